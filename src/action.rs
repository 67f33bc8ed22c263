// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Action context - the per-event unit of data flowing through a pipeline.
//!
//! An [`ActionContext`] is created by a watch manager for every observed
//! change, threaded by value through the pipeline steps and the controller,
//! and discarded once its pending events and callbacks have been delivered.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};

use crate::client::SharedConnection;
use crate::controller::ControllerBinding;

/// The kind of change observed on a watched resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    /// The resource was created (or seen for the first time by this watch).
    Added,
    /// The resource changed.
    Modified,
    /// The resource was removed.
    Deleted,
}

impl Action {
    /// Returns the canonical name of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Added => "Added",
            Action::Modified => "Modified",
            Action::Deleted => "Deleted",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "added" | "add" => Ok(Action::Added),
            "modified" | "modify" => Ok(Action::Modified),
            "deleted" | "delete" => Ok(Action::Deleted),
            other => Err(format!("unknown action {other:?}")),
        }
    }
}

/// Kubernetes event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Informational event.
    Normal,
    /// Something went wrong or needs attention.
    Warning,
}

/// A Kubernetes Event queued for emission after processing.
#[derive(Debug, Clone, PartialEq)]
pub struct KubeEvent {
    /// Severity.
    pub event_type: EventType,
    /// Short, machine-readable reason (`UpperCamelCase`).
    pub reason: String,
    /// Human-readable description.
    pub message: String,
    /// What action was taken or failed.
    pub action: String,
    /// The object this event is about.
    pub involved: ObjectReference,
}

impl KubeEvent {
    /// Creates an event about `resource`.
    pub fn new(
        event_type: EventType,
        resource: &DynamicObject,
        reason: impl Into<String>,
        message: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            reason: reason.into(),
            message: message.into(),
            action: action.into(),
            involved: object_reference(resource),
        }
    }
}

/// Builds an object reference pointing at `resource`.
pub fn object_reference(resource: &DynamicObject) -> ObjectReference {
    let (api_version, kind) = match &resource.types {
        Some(types) => (Some(types.api_version.clone()), Some(types.kind.clone())),
        None => (None, None),
    };

    ObjectReference {
        api_version,
        kind,
        name: resource.metadata.name.clone(),
        namespace: resource.metadata.namespace.clone(),
        uid: resource.metadata.uid.clone(),
        resource_version: resource.metadata.resource_version.clone(),
        field_path: None,
    }
}

/// Future returned by a deferred callback.
pub type CallbackFuture = BoxFuture<'static, anyhow::Result<()>>;

/// A zero-argument action deferred until after the pipeline completes.
///
/// Typical uses are status patches and finalizer updates.
pub struct Callback {
    name: String,
    short_circuit: bool,
    run: Box<dyn FnOnce() -> CallbackFuture + Send>,
}

impl Callback {
    /// Creates a named callback.
    pub fn new<F, Fut>(name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            short_circuit: false,
            run: Box::new(move || run().boxed()),
        }
    }

    /// Marks the callback so that its failure skips every callback queued after it.
    pub fn short_circuit(mut self) -> Self {
        self.short_circuit = true;
        self
    }

    /// Returns the callback's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true if failure of this callback stops later callbacks.
    pub fn is_short_circuit(&self) -> bool {
        self.short_circuit
    }

    pub(crate) fn invoke(self) -> CallbackFuture {
        (self.run)()
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("name", &self.name)
            .field("short_circuit", &self.short_circuit)
            .finish()
    }
}

/// Events and callbacks queued during one pipeline run, in append order.
#[derive(Debug, Default)]
pub struct PendingWork {
    pub(crate) events: Vec<KubeEvent>,
    pub(crate) callbacks: Vec<Callback>,
}

impl PendingWork {
    /// Returns the queued events.
    pub fn events(&self) -> &[KubeEvent] {
        &self.events
    }

    /// Returns the queued callbacks.
    pub fn callbacks(&self) -> &[Callback] {
        &self.callbacks
    }

    /// Returns true when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.callbacks.is_empty()
    }

    /// Appends everything from `other`, preserving order.
    pub fn append(&mut self, mut other: PendingWork) {
        self.events.append(&mut other.events);
        self.callbacks.append(&mut other.callbacks);
    }
}

/// Per-event state threaded through the pipeline.
///
/// The resource snapshot is shared and never mutated; steps consume a context
/// and return a new one. Pending events and callbacks can only be appended.
pub struct ActionContext {
    action: Action,
    resource: Arc<DynamicObject>,
    controller: Option<ControllerBinding>,
    operator: Arc<str>,
    connection: SharedConnection,
    halted: bool,
    assigns: BTreeMap<String, serde_json::Value>,
    pending: PendingWork,
}

impl ActionContext {
    /// Creates a context for one observed change.
    pub fn new(
        action: Action,
        resource: impl Into<Arc<DynamicObject>>,
        operator: impl Into<Arc<str>>,
        connection: SharedConnection,
    ) -> Self {
        Self {
            action,
            resource: resource.into(),
            controller: None,
            operator: operator.into(),
            connection,
            halted: false,
            assigns: BTreeMap::new(),
            pending: PendingWork::default(),
        }
    }

    /// Binds the controller that the delegate step will dispatch to.
    pub fn with_controller(mut self, controller: Option<ControllerBinding>) -> Self {
        self.controller = controller;
        self
    }

    /// Replaces the action, e.g. when a finalizer turns a modification into a deletion.
    pub fn with_action(mut self, action: Action) -> Self {
        self.action = action;
        self
    }

    /// Returns the observed action.
    pub fn action(&self) -> Action {
        self.action
    }

    /// Returns the resource snapshot.
    pub fn resource(&self) -> &Arc<DynamicObject> {
        &self.resource
    }

    /// Returns the bound controller, if any.
    pub fn controller(&self) -> Option<&ControllerBinding> {
        self.controller.as_ref()
    }

    /// Returns the name of the owning operator.
    pub fn operator(&self) -> &str {
        &self.operator
    }

    /// Returns the shared client connection.
    pub fn connection(&self) -> &SharedConnection {
        &self.connection
    }

    /// Returns true once a step has halted the pipeline.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Stops the pipeline after the current step.
    pub fn halt(mut self) -> Self {
        self.halted = true;
        self
    }

    /// Stores a value for later steps and the controller.
    pub fn assign(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.assigns.insert(key.into(), value);
        self
    }

    /// Returns the value stored under `key`.
    pub fn assigned(&self, key: &str) -> Option<&serde_json::Value> {
        self.assigns.get(key)
    }

    /// Returns all assigned values.
    pub fn assigns(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.assigns
    }

    /// Queues a Kubernetes event.
    pub fn emit(mut self, event: KubeEvent) -> Self {
        self.pending.events.push(event);
        self
    }

    /// Queues an event about this context's resource.
    pub fn emit_event(
        self,
        event_type: EventType,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let event = KubeEvent::new(
            event_type,
            &self.resource,
            reason,
            message,
            self.action.as_str(),
        );
        self.emit(event)
    }

    /// Queues a deferred callback.
    pub fn defer(mut self, callback: Callback) -> Self {
        self.pending.callbacks.push(callback);
        self
    }

    /// Returns the events queued so far in this context.
    pub fn pending_events(&self) -> &[KubeEvent] {
        &self.pending.events
    }

    /// Returns the callbacks queued so far in this context.
    pub fn pending_callbacks(&self) -> &[Callback] {
        &self.pending.callbacks
    }

    /// Removes and returns the queued work.
    pub fn take_pending(&mut self) -> PendingWork {
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn restore_pending(&mut self, pending: PendingWork) {
        let newer = std::mem::replace(&mut self.pending, pending);
        self.pending.append(newer);
    }
}

impl fmt::Debug for ActionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionContext")
            .field("action", &self.action)
            .field("resource", &self.resource.metadata.name)
            .field("controller", &self.controller.as_ref().map(|c| c.name()))
            .field("operator", &self.operator)
            .field("halted", &self.halted)
            .field("assigns", &self.assigns)
            .field("pending", &self.pending)
            .finish()
    }
}

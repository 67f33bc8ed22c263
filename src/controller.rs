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

//! Core controller traits and types.
//!
//! This module defines the interface that all controllers must implement.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::action::ActionContext;
use crate::error::ControllerError;

/// Result type for controller operations.
pub type Result<T> = std::result::Result<T, ControllerError>;

/// Static options a controller is initialized with.
pub type ControllerOptions = serde_json::Value;

/// User-supplied reconciliation logic.
///
/// # Lifecycle
///
/// For every event that reaches the delegate step:
///
/// 1. [`Controller::init`] turns the static options into internal state
/// 2. [`Controller::call`] receives the context and that state
/// 3. The returned context continues through the pipeline
///
/// `init` runs once per dispatch and is not cached, so it should be cheap.
/// Controllers must not keep the context or its resource after `call`
/// returns; any state that spans events belongs to the controller itself.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use kube_operator_runtime::{ActionContext, Controller, ControllerOptions, EventType};
/// use kube_operator_runtime::controller::Result;
///
/// struct Greeter;
///
/// #[async_trait]
/// impl Controller for Greeter {
///     type State = String;
///
///     fn init(&self, options: &ControllerOptions) -> Result<String> {
///         Ok(options["greeting"].as_str().unwrap_or("hello").to_string())
///     }
///
///     async fn call(&self, ctx: ActionContext, greeting: &String) -> Result<ActionContext> {
///         Ok(ctx.emit_event(EventType::Normal, "Greeted", greeting.clone()))
///     }
/// }
/// ```
#[async_trait]
pub trait Controller: Send + Sync + 'static {
    /// Internal state derived from the options.
    type State: Send + Sync;

    /// Validates the options and builds the internal state.
    fn init(&self, options: &ControllerOptions) -> Result<Self::State>;

    /// Reconciles one event.
    async fn call(&self, ctx: ActionContext, state: &Self::State) -> Result<ActionContext>;
}

/// Object-safe form of [`Controller`], used for stored references.
#[async_trait]
pub trait DynController: Send + Sync + 'static {
    /// Initializes the controller with `options` and calls it with `ctx`.
    async fn dispatch(&self, ctx: ActionContext, options: &ControllerOptions) -> Result<ActionContext>;
}

#[async_trait]
impl<C> DynController for C
where
    C: Controller,
{
    async fn dispatch(&self, ctx: ActionContext, options: &ControllerOptions) -> Result<ActionContext> {
        let state = self.init(options)?;
        self.call(ctx, &state).await
    }
}

/// Deserializes controller options into a typed value.
///
/// Controllers use this from [`Controller::init`] to validate their options.
pub fn parse_options<T>(controller: &str, options: &ControllerOptions) -> Result<T>
where
    T: DeserializeOwned,
{
    serde_json::from_value(options.clone()).map_err(|e| ControllerError::InvalidOptions {
        controller: controller.to_string(),
        reason: e.to_string(),
    })
}

/// A resolved `(controller, options)` pair attached to each action context.
#[derive(Clone)]
pub struct ControllerBinding {
    name: Arc<str>,
    options: Arc<ControllerOptions>,
    controller: Arc<dyn DynController>,
}

impl ControllerBinding {
    /// Creates a binding.
    pub fn new(
        name: impl Into<Arc<str>>,
        options: ControllerOptions,
        controller: Arc<dyn DynController>,
    ) -> Self {
        Self {
            name: name.into(),
            options: Arc::new(options),
            controller,
        }
    }

    /// Returns the registered controller name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the options passed to `init`.
    pub fn options(&self) -> &ControllerOptions {
        &self.options
    }

    /// Returns the controller.
    pub fn controller(&self) -> &Arc<dyn DynController> {
        &self.controller
    }
}

impl fmt::Debug for ControllerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerBinding")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish()
    }
}

/// A wrapper that converts a function into a [`Controller`].
///
/// Useful for controllers without options or internal state.
///
/// # Example
///
/// ```rust
/// use kube_operator_runtime::controller::FunctionController;
///
/// let controller = FunctionController::new("noop", |ctx| async move { Ok(ctx) });
/// ```
pub struct FunctionController<F, Fut>
where
    F: Fn(ActionContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ActionContext>> + Send,
{
    name: String,
    call_fn: F,
}

impl<F, Fut> FunctionController<F, Fut>
where
    F: Fn(ActionContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ActionContext>> + Send,
{
    /// Creates a new function-based controller.
    pub fn new(name: impl Into<String>, call_fn: F) -> Self {
        Self {
            name: name.into(),
            call_fn,
        }
    }

    /// Returns the controller's name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<F, Fut> fmt::Debug for FunctionController<F, Fut>
where
    F: Fn(ActionContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ActionContext>> + Send,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionController")
            .field("name", &self.name)
            .finish()
    }
}

#[async_trait]
impl<F, Fut> Controller for FunctionController<F, Fut>
where
    F: Fn(ActionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ActionContext>> + Send + 'static,
{
    type State = ();

    fn init(&self, _options: &ControllerOptions) -> Result<()> {
        Ok(())
    }

    async fn call(&self, ctx: ActionContext, _state: &()) -> Result<ActionContext> {
        (self.call_fn)(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, EventType};
    use crate::testing::{resource, MemoryConnection};
    use serde::Deserialize;

    fn context() -> ActionContext {
        ActionContext::new(
            Action::Modified,
            resource("v1", "ConfigMap", "default", "r1"),
            "test-operator",
            MemoryConnection::shared(),
        )
    }

    #[derive(Deserialize)]
    struct Settings {
        reason: String,
    }

    struct Reasoned;

    #[async_trait]
    impl Controller for Reasoned {
        type State = Settings;

        fn init(&self, options: &ControllerOptions) -> Result<Settings> {
            parse_options("reasoned", options)
        }

        async fn call(&self, ctx: ActionContext, state: &Settings) -> Result<ActionContext> {
            Ok(ctx.emit_event(EventType::Normal, state.reason.clone(), "reconciled"))
        }
    }

    #[tokio::test]
    async fn test_dispatch_inits_with_options() {
        let options = serde_json::json!({ "reason": "Synced" });
        let ctx = Reasoned.dispatch(context(), &options).await.unwrap();
        assert_eq!(ctx.pending_events()[0].reason, "Synced");
    }

    #[tokio::test]
    async fn test_dispatch_rejects_bad_options() {
        let err = Reasoned
            .dispatch(context(), &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidOptions { .. }));
    }

    #[tokio::test]
    async fn test_function_controller() {
        let controller = FunctionController::new("halter", |ctx: ActionContext| async move { Ok(ctx.halt()) });
        assert_eq!(controller.name(), "halter");
        let ctx = controller.dispatch(context(), &serde_json::Value::Null).await.unwrap();
        assert!(ctx.is_halted());
    }
}

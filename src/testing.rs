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

//! In-memory connection for tests.
//!
//! [`MemoryConnection`] hands out channel-backed watch streams, records
//! published events and finalizer patches, and can inject failures. It lets
//! operators be exercised end to end without an API server.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};

use crate::action::{Action, KubeEvent};
use crate::client::{Connection, SharedConnection, WatchNotification, WatchQuery, WatchStream};
use crate::error::ClientError;

type Item = Result<WatchNotification, ClientError>;

#[derive(Default)]
struct State {
    feeds: HashMap<String, VecDeque<mpsc::UnboundedReceiver<Item>>>,
    subscribe_failures: HashMap<String, usize>,
    subscriptions: HashMap<String, usize>,
    event_failures: usize,
    events: Vec<KubeEvent>,
    finalizer_patches: Vec<(String, Vec<String>)>,
}

/// A [`Connection`] backed by in-process channels.
///
/// Each call to [`MemoryConnection::feed`] queues one subscription for a
/// query; the next `watch` for that query receives it. A `watch` with nothing
/// queued gets a stream that never yields.
#[derive(Clone, Default)]
pub struct MemoryConnection {
    state: Arc<Mutex<State>>,
}

impl MemoryConnection {
    /// Creates an empty connection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty connection behind a shared handle.
    pub fn shared() -> SharedConnection {
        Arc::new(Self::new())
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a subscription for `query` and returns its sending side.
    pub fn feed(&self, query: &WatchQuery) -> WatchFeed {
        let (tx, rx) = mpsc::unbounded();
        self.state()
            .feeds
            .entry(query.key())
            .or_default()
            .push_back(rx);
        WatchFeed { tx }
    }

    /// Makes the next `count` subscriptions for `query` fail.
    pub fn fail_subscriptions(&self, query: &WatchQuery, count: usize) {
        *self.state().subscribe_failures.entry(query.key()).or_default() += count;
    }

    /// Returns how many times `query` was subscribed, failures included.
    pub fn subscription_attempts(&self, query: &WatchQuery) -> usize {
        self.state().subscriptions.get(&query.key()).copied().unwrap_or(0)
    }

    /// Makes the next `count` event publications fail.
    pub fn fail_next_events(&self, count: usize) {
        self.state().event_failures += count;
    }

    /// Returns every successfully published event.
    pub fn published_events(&self) -> Vec<KubeEvent> {
        self.state().events.clone()
    }

    /// Returns every finalizer patch as `(resource name, finalizers)`.
    pub fn finalizer_patches(&self) -> Vec<(String, Vec<String>)> {
        self.state().finalizer_patches.clone()
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn watch(&self, query: &WatchQuery) -> Result<WatchStream, ClientError> {
        let key = query.key();
        let mut state = self.state();
        *state.subscriptions.entry(key.clone()).or_default() += 1;

        if let Some(remaining) = state.subscribe_failures.get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ClientError::Watch(format!("injected subscription failure for {key}")));
            }
        }

        match state.feeds.get_mut(&key).and_then(VecDeque::pop_front) {
            Some(rx) => Ok(rx.boxed()),
            None => Ok(futures::stream::pending::<Item>().boxed()),
        }
    }

    async fn publish_event(&self, event: &KubeEvent) -> Result<(), ClientError> {
        let mut state = self.state();
        if state.event_failures > 0 {
            state.event_failures -= 1;
            return Err(ClientError::Watch(format!(
                "injected event failure for {}",
                event.reason
            )));
        }
        state.events.push(event.clone());
        Ok(())
    }

    async fn patch_finalizers(
        &self,
        resource: &DynamicObject,
        finalizers: Vec<String>,
    ) -> Result<(), ClientError> {
        let name = resource
            .metadata
            .name
            .clone()
            .ok_or(ClientError::MissingField("metadata.name"))?;
        self.state().finalizer_patches.push((name, finalizers));
        Ok(())
    }
}

/// Sending side of one queued subscription.
///
/// Dropping the feed ends the stream.
#[derive(Clone)]
pub struct WatchFeed {
    tx: mpsc::UnboundedSender<Item>,
}

impl WatchFeed {
    /// Delivers a notification. Returns false once the subscriber is gone.
    pub fn send(&self, action: Action, resource: DynamicObject) -> bool {
        self.tx
            .unbounded_send(Ok(WatchNotification::new(action, resource)))
            .is_ok()
    }

    /// Breaks the stream with an error.
    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.tx
            .unbounded_send(Err(ClientError::Watch(message.into())))
            .is_ok()
    }
}

/// Builds a namespaced resource with a deterministic uid.
pub fn resource(api_version: &str, kind: &str, namespace: &str, name: &str) -> DynamicObject {
    let (group, version) = api_version.split_once('/').unwrap_or(("", api_version));
    let ar = ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, kind));
    let mut obj = DynamicObject::new(name, &ar).within(namespace);
    obj.metadata.uid = Some(format!("{namespace}-{name}"));
    obj
}

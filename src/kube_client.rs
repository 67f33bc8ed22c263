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

//! [`Connection`] backed by a live API server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::{future, stream, StreamExt};
use kube::api::{Api, ApiResource, DynamicObject, Patch, PatchParams};
use kube::runtime::events::{Event, EventType as KubeEventType, Recorder, Reporter};
use kube::runtime::watcher;
use kube::Client;

use crate::action::{Action, EventType, KubeEvent};
use crate::client::{Connection, WatchNotification, WatchQuery, WatchStream};
use crate::error::ClientError;

/// A connection to a Kubernetes cluster.
#[derive(Clone)]
pub struct KubeConnection {
    client: Client,
    reporter: Reporter,
    snapshots: Snapshots,
}

type KnownObjects = HashMap<String, DynamicObject>;

/// Last seen objects per watch query, kept across resubscriptions.
///
/// A broken watch is dropped and resubscribed by the watch manager; the next
/// relist is compared against what the previous subscription saw.
#[derive(Clone, Default)]
struct Snapshots {
    queries: Arc<Mutex<HashMap<String, Arc<Mutex<KnownObjects>>>>>,
}

impl Snapshots {
    fn subscribe(&self, query_key: &str) -> Arc<Mutex<KnownObjects>> {
        self.queries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(query_key.to_string())
            .or_default()
            .clone()
    }
}

fn translate_shared(
    known: &Mutex<KnownObjects>,
    event: watcher::Event<DynamicObject>,
) -> Vec<WatchNotification> {
    let mut known = known.lock().unwrap_or_else(PoisonError::into_inner);
    translate(&mut known, event)
}

impl KubeConnection {
    /// Creates a connection publishing events as `reporter`.
    ///
    /// The reporter instance is taken from `POD_NAME` when set.
    pub fn new(client: Client, reporter: impl Into<String>) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: reporter.into(),
                instance: std::env::var("POD_NAME").ok(),
            },
            snapshots: Snapshots::default(),
        }
    }

    /// Returns the underlying client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api_for(&self, query: &WatchQuery) -> Result<Api<DynamicObject>, ClientError> {
        let gvk = query.gvk()?;
        let resource = match &query.plural {
            Some(plural) => ApiResource::from_gvk_with_plural(&gvk, plural),
            None => ApiResource::from_gvk(&gvk),
        };

        Ok(match &query.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        })
    }

    fn api_for_object(&self, object: &DynamicObject) -> Result<Api<DynamicObject>, ClientError> {
        let types = object
            .types
            .as_ref()
            .ok_or(ClientError::MissingField("apiVersion/kind"))?;
        let mut query = WatchQuery::new(types.api_version.clone(), types.kind.clone());
        query.namespace = object.metadata.namespace.clone();
        self.api_for(&query)
    }
}

#[async_trait]
impl Connection for KubeConnection {
    async fn watch(&self, query: &WatchQuery) -> Result<WatchStream, ClientError> {
        let api = self.api_for(query)?;

        let mut config = watcher::Config::default();
        if let Some(labels) = &query.label_selector {
            config = config.labels(labels);
        }
        if let Some(fields) = &query.field_selector {
            config = config.fields(fields);
        }

        tracing::debug!(query = %query, "starting kubernetes watch");

        let known = self.snapshots.subscribe(&query.key());
        let notifications = watcher::watcher(api, config)
            .scan(known, |known, event| {
                let batch: Vec<Result<WatchNotification, ClientError>> = match event {
                    Ok(event) => translate_shared(known, event).into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(ClientError::Watch(e.to_string()))],
                };
                future::ready(Some(stream::iter(batch)))
            })
            .flatten()
            .boxed();

        Ok(notifications)
    }

    async fn publish_event(&self, event: &KubeEvent) -> Result<(), ClientError> {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), event.involved.clone());
        recorder
            .publish(Event {
                type_: match event.event_type {
                    EventType::Normal => KubeEventType::Normal,
                    EventType::Warning => KubeEventType::Warning,
                },
                reason: event.reason.clone(),
                note: Some(event.message.clone()),
                action: event.action.clone(),
                secondary: None,
            })
            .await?;
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
            .as_deref()
            .ok_or(ClientError::MissingField("metadata.name"))?;
        let api = self.api_for_object(resource)?;

        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

fn object_key(object: &DynamicObject) -> String {
    match &object.metadata.uid {
        Some(uid) => uid.clone(),
        None => format!(
            "{}/{}",
            object.metadata.namespace.as_deref().unwrap_or(""),
            object.metadata.name.as_deref().unwrap_or("")
        ),
    }
}

/// Maps watcher events to notifications.
///
/// `known` holds the last seen version of every live object, so that an
/// applied object can be told apart as added or modified, and a relist can
/// report objects that disappeared while the watch was desynced.
fn translate(
    known: &mut HashMap<String, DynamicObject>,
    event: watcher::Event<DynamicObject>,
) -> Vec<WatchNotification> {
    match event {
        watcher::Event::Applied(object) => vec![applied(known, object)],
        watcher::Event::Deleted(object) => {
            known.remove(&object_key(&object));
            vec![WatchNotification::new(Action::Deleted, object)]
        }
        watcher::Event::Restarted(objects) => {
            let mut previous = std::mem::take(known);
            let mut notifications: Vec<_> = objects
                .into_iter()
                .map(|object| {
                    if let Some(old) = previous.remove(&object_key(&object)) {
                        known.insert(object_key(&old), old);
                    }
                    applied(known, object)
                })
                .collect();
            notifications.extend(
                previous
                    .into_values()
                    .map(|gone| WatchNotification::new(Action::Deleted, gone)),
            );
            notifications
        }
    }
}

fn applied(known: &mut HashMap<String, DynamicObject>, object: DynamicObject) -> WatchNotification {
    let action = match known.insert(object_key(&object), object.clone()) {
        Some(_) => Action::Modified,
        None => Action::Added,
    };
    WatchNotification::new(action, object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::resource;

    fn actions(notifications: &[WatchNotification]) -> Vec<(Action, String)> {
        notifications
            .iter()
            .map(|n| (n.action, n.resource.metadata.name.clone().unwrap_or_default()))
            .collect()
    }

    #[test]
    fn test_applied_then_modified_then_deleted() {
        let mut known = HashMap::new();
        let obj = resource("v1", "ConfigMap", "default", "a");

        let first = translate(&mut known, watcher::Event::Applied(obj.clone()));
        let second = translate(&mut known, watcher::Event::Applied(obj.clone()));
        let third = translate(&mut known, watcher::Event::Deleted(obj));

        assert_eq!(actions(&first), vec![(Action::Added, "a".to_string())]);
        assert_eq!(actions(&second), vec![(Action::Modified, "a".to_string())]);
        assert_eq!(actions(&third), vec![(Action::Deleted, "a".to_string())]);
        assert!(known.is_empty());
    }

    #[test]
    fn test_restart_reports_missing_objects_as_deleted() {
        let mut known = HashMap::new();
        let a = resource("v1", "ConfigMap", "default", "a");
        let b = resource("v1", "ConfigMap", "default", "b");
        let c = resource("v1", "ConfigMap", "default", "c");

        translate(&mut known, watcher::Event::Restarted(vec![a.clone(), b]));
        let relist = translate(&mut known, watcher::Event::Restarted(vec![a, c]));

        assert_eq!(
            actions(&relist),
            vec![
                (Action::Modified, "a".to_string()),
                (Action::Added, "c".to_string()),
                (Action::Deleted, "b".to_string()),
            ]
        );
        assert_eq!(known.len(), 2);
    }

    #[test]
    fn test_resubscription_reports_objects_gone_meanwhile() {
        let snapshots = Snapshots::default();
        let a = resource("v1", "ConfigMap", "default", "a");
        let b = resource("v1", "ConfigMap", "default", "b");

        let first = snapshots.subscribe("v1/ConfigMap@default");
        translate_shared(&first, watcher::Event::Restarted(vec![a.clone(), b]));
        drop(first);

        let second = snapshots.subscribe("v1/ConfigMap@default");
        let relist = translate_shared(&second, watcher::Event::Restarted(vec![a.clone()]));
        assert_eq!(
            actions(&relist),
            vec![
                (Action::Modified, "a".to_string()),
                (Action::Deleted, "b".to_string()),
            ]
        );

        let other = snapshots.subscribe("v1/ConfigMap@prod");
        let fresh = translate_shared(&other, watcher::Event::Restarted(vec![a]));
        assert_eq!(actions(&fresh), vec![(Action::Added, "a".to_string())]);
    }
}

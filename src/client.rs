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

//! The seam between the runtime and the Kubernetes client.
//!
//! The runtime never talks to the API server directly. It subscribes to change
//! streams, publishes events and patches finalizers through a [`Connection`],
//! which is shared read-only by every watch manager and controller.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use kube::core::{DynamicObject, GroupVersionKind};
use serde::{Deserialize, Serialize};

use crate::action::{Action, KubeEvent};
use crate::error::ClientError;

/// One raw change notification from a watch stream.
#[derive(Debug, Clone)]
pub struct WatchNotification {
    /// Kind of change.
    pub action: Action,
    /// The resource as observed.
    pub resource: DynamicObject,
}

impl WatchNotification {
    /// Creates a notification.
    pub fn new(action: Action, resource: DynamicObject) -> Self {
        Self { action, resource }
    }
}

/// An ordered, possibly infinite stream of notifications.
///
/// The stream is not restartable; it ends or yields an error when the
/// subscription breaks, and the caller resubscribes.
pub type WatchStream = BoxStream<'static, Result<WatchNotification, ClientError>>;

/// Shared handle to the client.
pub type SharedConnection = Arc<dyn Connection>;

/// Operations the runtime needs from a Kubernetes client.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Subscribes to changes of the resources selected by `query`.
    async fn watch(&self, query: &WatchQuery) -> Result<WatchStream, ClientError>;

    /// Publishes a Kubernetes Event.
    async fn publish_event(&self, event: &KubeEvent) -> Result<(), ClientError>;

    /// Replaces the finalizer list of `resource`.
    async fn patch_finalizers(
        &self,
        resource: &DynamicObject,
        finalizers: Vec<String>,
    ) -> Result<(), ClientError>;
}

/// Describes which resources a watch observes.
///
/// The runtime treats a query as opaque; only the [`Connection`] interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchQuery {
    /// API version, e.g. `v1` or `apps/v1`.
    pub api_version: String,

    /// Resource kind, e.g. `ConfigMap`.
    pub kind: String,

    /// Plural resource name, when it cannot be derived from the kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plural: Option<String>,

    /// Namespace to watch; `None` watches all namespaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Label selector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<String>,

    /// Field selector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_selector: Option<String>,
}

impl WatchQuery {
    /// Creates a cluster-wide query for `api_version`/`kind`.
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            plural: None,
            namespace: None,
            label_selector: None,
            field_selector: None,
        }
    }

    /// Restricts the query to one namespace.
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Sets the plural resource name.
    pub fn with_plural(mut self, plural: impl Into<String>) -> Self {
        self.plural = Some(plural.into());
        self
    }

    /// Sets the label selector.
    pub fn with_labels(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }

    /// Sets the field selector.
    pub fn with_fields(mut self, selector: impl Into<String>) -> Self {
        self.field_selector = Some(selector.into());
        self
    }

    /// Splits the API version into group and version.
    pub fn gvk(&self) -> Result<GroupVersionKind, ClientError> {
        if self.kind.is_empty() {
            return Err(ClientError::InvalidQuery("kind cannot be empty".to_string()));
        }
        match self.api_version.split('/').collect::<Vec<_>>().as_slice() {
            [version] if !version.is_empty() => Ok(GroupVersionKind::gvk("", version, &self.kind)),
            [group, version] if !group.is_empty() && !version.is_empty() => {
                Ok(GroupVersionKind::gvk(group, version, &self.kind))
            }
            _ => Err(ClientError::InvalidQuery(format!(
                "invalid apiVersion {:?} (expect v1 or group/v1)",
                self.api_version
            ))),
        }
    }

    /// Returns a stable key identifying the query.
    pub fn key(&self) -> String {
        let mut key = format!("{}/{}", self.api_version, self.kind);
        if let Some(ns) = &self.namespace {
            key.push('@');
            key.push_str(ns);
        }
        if let Some(labels) = &self.label_selector {
            key.push('?');
            key.push_str(labels);
        }
        if let Some(fields) = &self.field_selector {
            key.push('&');
            key.push_str(fields);
        }
        key
    }
}

impl fmt::Display for WatchQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gvk_core_group() {
        let gvk = WatchQuery::new("v1", "ConfigMap").gvk().unwrap();
        assert_eq!(gvk.group, "");
        assert_eq!(gvk.version, "v1");
        assert_eq!(gvk.kind, "ConfigMap");
    }

    #[test]
    fn test_gvk_named_group() {
        let gvk = WatchQuery::new("apps/v1", "Deployment").gvk().unwrap();
        assert_eq!(gvk.group, "apps");
        assert_eq!(gvk.version, "v1");
    }

    #[test]
    fn test_gvk_rejects_garbage() {
        assert!(WatchQuery::new("a/b/c", "Thing").gvk().is_err());
        assert!(WatchQuery::new("v1", "").gvk().is_err());
        assert!(WatchQuery::new("/v1", "Thing").gvk().is_err());
    }

    #[test]
    fn test_key_includes_scope() {
        let query = WatchQuery::new("v1", "Pod")
            .in_namespace("default")
            .with_labels("app=web");
        assert_eq!(query.key(), "v1/Pod@default?app=web");
        assert_eq!(WatchQuery::new("v1", "Node").key(), "v1/Node");
    }

    #[test]
    fn test_deserialize_query() {
        let yaml = r#"
apiVersion: example.com/v1
kind: Widget
namespace: default
labelSelector: tier=frontend
"#;
        let query: WatchQuery = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(query.kind, "Widget");
        assert_eq!(query.namespace.as_deref(), Some("default"));
        assert_eq!(query.label_selector.as_deref(), Some("tier=frontend"));
    }
}

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

//! The `event-recorder` controller.
//!
//! Publishes one Kubernetes Event for every change it is dispatched.

use async_trait::async_trait;
use serde::Deserialize;

use crate::action::{ActionContext, EventType};
use crate::controller::{parse_options, Controller, ControllerOptions, Result};

/// Name the controller is registered under.
pub const EVENT_RECORDER: &str = "event-recorder";

/// Options of [`EventRecorder`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RecorderOptions {
    /// Event reason; defaults to `Observed`.
    #[serde(default = "default_reason")]
    pub reason: String,

    /// Publish `Warning` instead of `Normal` events.
    #[serde(default)]
    pub warning: bool,
}

fn default_reason() -> String {
    "Observed".to_string()
}

/// Records every observed change as an event on the resource.
#[derive(Debug, Default, Clone, Copy)]
pub struct EventRecorder;

#[async_trait]
impl Controller for EventRecorder {
    type State = RecorderOptions;

    fn init(&self, options: &ControllerOptions) -> Result<RecorderOptions> {
        parse_options(EVENT_RECORDER, options)
    }

    async fn call(&self, ctx: ActionContext, options: &RecorderOptions) -> Result<ActionContext> {
        let resource = ctx.resource();
        let kind = resource
            .types
            .as_ref()
            .map(|t| t.kind.clone())
            .unwrap_or_default();
        let name = resource.metadata.name.clone().unwrap_or_default();
        let message = match &resource.metadata.namespace {
            Some(ns) => format!("{} {kind} {ns}/{name}", ctx.action()),
            None => format!("{} {kind} {name}", ctx.action()),
        };
        let event_type = if options.warning {
            EventType::Warning
        } else {
            EventType::Normal
        };

        Ok(ctx.emit_event(event_type, options.reason.clone(), message))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::action::Action;
    use crate::controller::DynController;
    use crate::error::ControllerError;
    use crate::testing::{resource, MemoryConnection};

    fn context() -> ActionContext {
        ActionContext::new(
            Action::Added,
            resource("v1", "ConfigMap", "default", "settings"),
            "op",
            MemoryConnection::shared(),
        )
    }

    #[tokio::test]
    async fn test_records_change_with_defaults() {
        let ctx = EventRecorder.dispatch(context(), &json!({})).await.unwrap();

        let event = &ctx.pending_events()[0];
        assert_eq!(event.event_type, EventType::Normal);
        assert_eq!(event.reason, "Observed");
        assert_eq!(event.message, "Added ConfigMap default/settings");
        assert_eq!(event.action, "Added");
    }

    #[tokio::test]
    async fn test_custom_options() {
        let ctx = EventRecorder
            .dispatch(context(), &json!({ "reason": "Audited", "warning": true }))
            .await
            .unwrap();
        assert_eq!(ctx.pending_events()[0].reason, "Audited");
        assert_eq!(ctx.pending_events()[0].event_type, EventType::Warning);
    }

    #[tokio::test]
    async fn test_rejects_unknown_options() {
        let err = EventRecorder
            .dispatch(context(), &json!({ "colour": "blue" }))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidOptions { .. }));
    }
}

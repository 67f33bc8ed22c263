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

//! Controller dispatch - the delegate step.

use crate::action::ActionContext;
use crate::controller::Result;

/// Hands `ctx` to its bound controller.
///
/// A context without a controller is returned unchanged, which lets a
/// pipeline observe or filter events without delegating them.
pub async fn dispatch(ctx: ActionContext) -> Result<ActionContext> {
    let Some(binding) = ctx.controller().cloned() else {
        return Ok(ctx);
    };

    tracing::debug!(
        controller = %binding.name(),
        action = %ctx.action(),
        "dispatching to controller"
    );

    binding
        .controller()
        .dispatch(ctx, binding.options())
        .await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::action::{Action, EventType};
    use crate::controller::{ControllerBinding, FunctionController};
    use crate::error::ControllerError;
    use crate::testing::{resource, MemoryConnection};

    fn context() -> ActionContext {
        ActionContext::new(
            Action::Deleted,
            resource("v1", "Secret", "default", "s1"),
            "test-operator",
            MemoryConnection::shared(),
        )
        .assign("k", serde_json::json!(1))
    }

    #[tokio::test]
    async fn test_no_controller_is_identity() {
        let before = context();
        let resource = before.resource().clone();

        let after = dispatch(before).await.unwrap();

        assert_eq!(after.action(), Action::Deleted);
        assert!(Arc::ptr_eq(after.resource(), &resource));
        assert!(!after.is_halted());
        assert!(after.controller().is_none());
        assert!(after.pending_events().is_empty());
        assert!(after.pending_callbacks().is_empty());
        assert_eq!(after.assigned("k"), Some(&serde_json::json!(1)));
    }

    #[tokio::test]
    async fn test_bound_controller_is_called() {
        let controller = FunctionController::new("recorder", |ctx: ActionContext| async move {
            Ok(ctx.emit_event(EventType::Normal, "Handled", "handled"))
        });
        let binding = ControllerBinding::new("recorder", serde_json::json!({}), Arc::new(controller));

        let ctx = dispatch(context().with_controller(Some(binding))).await.unwrap();
        assert_eq!(ctx.pending_events()[0].reason, "Handled");
    }

    #[tokio::test]
    async fn test_controller_error_propagates() {
        let controller = FunctionController::new("failing", |_ctx: ActionContext| async move {
            Err(ControllerError::reconcile("failing", anyhow::anyhow!("nope")))
        });
        let binding = ControllerBinding::new("failing", serde_json::json!({}), Arc::new(controller));

        let err = dispatch(context().with_controller(Some(binding))).await.unwrap_err();
        assert!(err.to_string().contains("failing"));
    }
}

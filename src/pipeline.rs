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

//! Pipeline engine.
//!
//! A [`Pipeline`] is an ordered list of named steps run over one
//! [`ActionContext`]. Exactly one step is the delegate step that hands the
//! context to the bound controller; every other step is a plain async
//! function with static options. Steps run strictly in order until one halts
//! the context or fails.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;

use crate::action::{ActionContext, PendingWork};
use crate::dispatch;
use crate::error::{ConfigError, PipelineError};
use crate::steps;

/// Static options for one step.
#[derive(Debug, Clone, Default)]
pub struct StepOptions(Arc<serde_json::Value>);

impl StepOptions {
    /// Wraps a JSON value.
    pub fn new(value: serde_json::Value) -> Self {
        Self(Arc::new(value))
    }

    /// Returns the raw value.
    pub fn value(&self) -> &serde_json::Value {
        &self.0
    }

    /// Returns the string option `key`.
    pub fn str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    /// Deserializes the options into `T`.
    pub fn parse<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        Ok(serde_json::from_value(self.0.as_ref().clone())?)
    }
}

impl From<serde_json::Value> for StepOptions {
    fn from(value: serde_json::Value) -> Self {
        Self::new(value)
    }
}

/// Future returned by a step.
pub type StepFuture = BoxFuture<'static, anyhow::Result<ActionContext>>;

/// A pipeline step function.
pub type StepFn = Arc<dyn Fn(ActionContext, StepOptions) -> StepFuture + Send + Sync>;

/// What a step does.
#[derive(Clone)]
pub enum StepKind {
    /// Runs a step function.
    Function(StepFn),
    /// Delegates to the context's bound controller.
    Delegate,
}

/// A named step with its static options.
#[derive(Clone)]
pub struct PipelineStep {
    name: String,
    kind: StepKind,
    options: StepOptions,
}

impl PipelineStep {
    /// Creates a function step.
    pub fn function<F, Fut>(name: impl Into<String>, options: impl Into<StepOptions>, step: F) -> Self
    where
        F: Fn(ActionContext, StepOptions) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ActionContext>> + Send + 'static,
    {
        Self {
            name: name.into(),
            kind: StepKind::Function(Arc::new(move |ctx, opts| step(ctx, opts).boxed())),
            options: options.into(),
        }
    }

    /// Creates the delegate-to-controller step.
    pub fn delegate() -> Self {
        Self {
            name: "delegate_to_controller".to_string(),
            kind: StepKind::Delegate,
            options: StepOptions::default(),
        }
    }

    /// Returns the step name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the step kind.
    pub fn kind(&self) -> &StepKind {
        &self.kind
    }

    /// Returns the static options.
    pub fn options(&self) -> &StepOptions {
        &self.options
    }

    /// Returns true for the delegate step.
    pub fn is_delegate(&self) -> bool {
        matches!(self.kind, StepKind::Delegate)
    }
}

impl fmt::Debug for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineStep")
            .field("name", &self.name)
            .field("delegate", &self.is_delegate())
            .field("options", self.options.value())
            .finish()
    }
}

/// An ordered list of steps.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    steps: Vec<PipelineStep>,
}

impl Pipeline {
    /// Creates a builder.
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// The pipeline used when an operator does not configure one:
    /// log the event, then delegate.
    pub fn default_pipeline() -> Self {
        Self::builder()
            .step(steps::log_event(serde_json::json!({ "level": "debug" })))
            .delegate()
            .build()
    }

    /// Returns the steps in order.
    pub fn steps(&self) -> &[PipelineStep] {
        &self.steps
    }

    /// Returns the number of delegate steps.
    pub fn delegate_count(&self) -> usize {
        self.steps.iter().filter(|s| s.is_delegate()).count()
    }

    /// Checks that the pipeline has exactly one delegate step.
    pub fn validate(&self, operator: &str) -> Result<(), ConfigError> {
        if self.steps.iter().any(|s| s.name.is_empty()) {
            return Err(ConfigError::EmptyStepName);
        }
        match self.delegate_count() {
            1 => Ok(()),
            0 => Err(ConfigError::MissingDelegate {
                operator: operator.to_string(),
            }),
            count => Err(ConfigError::DuplicateDelegate {
                operator: operator.to_string(),
                count,
            }),
        }
    }

    /// Runs every step over `ctx` in order.
    ///
    /// Halting returns the context as it was when halted. A failing step ends
    /// the run; the error carries the events and callbacks queued by the steps
    /// that completed before it.
    pub async fn run(&self, mut ctx: ActionContext) -> Result<ActionContext, PipelineError> {
        let mut pending = PendingWork::default();

        for step in &self.steps {
            if ctx.is_halted() {
                tracing::trace!(step = %step.name, "pipeline halted, skipping step");
                break;
            }

            tracing::trace!(step = %step.name, action = %ctx.action(), "running step");

            ctx = match &step.kind {
                StepKind::Function(run) => match run(ctx, step.options.clone()).await {
                    Ok(next) => next,
                    Err(source) => {
                        return Err(PipelineError::StepFailed {
                            step: step.name.clone(),
                            source,
                            pending,
                        });
                    }
                },
                StepKind::Delegate => match dispatch::dispatch(ctx).await {
                    Ok(next) => next,
                    Err(source) => return Err(PipelineError::Dispatch { source, pending }),
                },
            };

            pending.append(ctx.take_pending());
        }

        ctx.restore_pending(pending);
        Ok(ctx)
    }
}

/// Builder for [`Pipeline`].
#[derive(Debug, Default)]
pub struct PipelineBuilder {
    steps: Vec<PipelineStep>,
}

impl PipelineBuilder {
    /// Appends a step.
    pub fn step(mut self, step: PipelineStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Appends a function step.
    pub fn function<F, Fut>(self, name: impl Into<String>, options: impl Into<StepOptions>, step: F) -> Self
    where
        F: Fn(ActionContext, StepOptions) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ActionContext>> + Send + 'static,
    {
        self.step(PipelineStep::function(name, options, step))
    }

    /// Appends the delegate-to-controller step.
    pub fn delegate(self) -> Self {
        self.step(PipelineStep::delegate())
    }

    /// Finishes the pipeline. Validation happens when the operator is defined.
    pub fn build(self) -> Pipeline {
        Pipeline { steps: self.steps }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, Callback, EventType};
    use crate::controller::{ControllerBinding, FunctionController};
    use crate::testing::{resource, MemoryConnection};
    use serde_json::json;

    fn context() -> ActionContext {
        ActionContext::new(
            Action::Added,
            resource("v1", "ConfigMap", "default", "r1"),
            "test-operator",
            MemoryConnection::shared(),
        )
    }

    fn trace(name: &'static str) -> PipelineStep {
        PipelineStep::function(name, json!(null), move |ctx: ActionContext, _| async move {
            let mut seen = ctx
                .assigned("trace")
                .and_then(|v| v.as_array().cloned())
                .unwrap_or_default();
            seen.push(json!(name));
            Ok(ctx.assign("trace", json!(seen)))
        })
    }

    fn traced(ctx: &ActionContext) -> Vec<String> {
        ctx.assigned("trace")
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default()
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn test_steps_run_in_order() {
        let pipeline = Pipeline::builder()
            .step(trace("a"))
            .step(trace("b"))
            .delegate()
            .step(trace("c"))
            .build();

        let ctx = pipeline.run(context()).await.unwrap();
        assert_eq!(traced(&ctx), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_halt_short_circuits() {
        let pipeline = Pipeline::builder()
            .step(trace("a"))
            .function("stop", json!(null), |ctx: ActionContext, _| async move { Ok(ctx.halt()) })
            .step(trace("b"))
            .delegate()
            .build();

        let ctx = pipeline.run(context()).await.unwrap();
        assert!(ctx.is_halted());
        assert_eq!(traced(&ctx), vec!["a"]);
    }

    #[tokio::test]
    async fn test_step_receives_its_options() {
        let pipeline = Pipeline::builder()
            .function("opts", json!({ "flag": "on" }), |ctx: ActionContext, opts: StepOptions| async move {
                let flag = opts.str("flag").unwrap_or("off").to_string();
                Ok(ctx.assign("flag", json!(flag)))
            })
            .delegate()
            .build();

        let ctx = pipeline.run(context()).await.unwrap();
        assert_eq!(ctx.assigned("flag"), Some(&json!("on")));
    }

    #[tokio::test]
    async fn test_failure_keeps_earlier_pending_work() {
        let controller = FunctionController::new("emitter", |ctx: ActionContext| async move {
            Ok(ctx
                .emit_event(EventType::Normal, "One", "1")
                .emit_event(EventType::Normal, "Two", "2")
                .defer(Callback::new("cb", || async { Ok(()) })))
        });
        let binding = ControllerBinding::new("emitter", json!({}), Arc::new(controller));

        let pipeline = Pipeline::builder()
            .delegate()
            .function("explode", json!(null), |_ctx: ActionContext, _| async move {
                Err(anyhow::anyhow!("boom"))
            })
            .build();

        let mut err = pipeline
            .run(context().with_controller(Some(binding)))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::StepFailed { ref step, .. } if step == "explode"));

        let pending = err.take_pending();
        assert_eq!(pending.events().len(), 2);
        assert_eq!(pending.callbacks().len(), 1);
    }

    #[test]
    fn test_validate_delegate_count() {
        let none = Pipeline::builder().step(trace("a")).build();
        assert!(matches!(
            none.validate("op"),
            Err(ConfigError::MissingDelegate { operator }) if operator == "op"
        ));

        let two = Pipeline::builder().delegate().delegate().build();
        assert!(matches!(
            two.validate("op"),
            Err(ConfigError::DuplicateDelegate { count: 2, .. })
        ));

        assert!(Pipeline::default_pipeline().validate("op").is_ok());
    }
}

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

//! Built-in pipeline steps.
//!
//! Each function returns a [`PipelineStep`] ready to be added to a pipeline.

use kube::core::DynamicObject;
use serde::Deserialize;

use crate::action::{Action, ActionContext, Callback};
use crate::config::StepConfig;
use crate::error::ConfigError;
use crate::pipeline::{Pipeline, PipelineStep, StepOptions};

/// Builds a pipeline from configured built-in step names.
///
/// An empty list yields [`Pipeline::default_pipeline`]. The result is not
/// validated; the operator definition checks the delegate count. A
/// `finalizer` step must come before the delegate and `release_finalizer`
/// after it.
pub fn from_config(steps: &[StepConfig]) -> Result<Pipeline, ConfigError> {
    if steps.is_empty() {
        return Ok(Pipeline::default_pipeline());
    }

    let position = |name: &str| steps.iter().position(|s| s.step == name);
    if let Some(mark) = position("finalizer") {
        let delegate = steps
            .iter()
            .position(|s| matches!(s.step.as_str(), "delegate" | "delegate_to_controller"));
        match (delegate, position("release_finalizer")) {
            (Some(delegate), Some(release)) if mark < delegate && delegate < release => {}
            _ => return Err(ConfigError::UnreleasedFinalizer),
        }
    }

    steps
        .iter()
        .try_fold(Pipeline::builder(), |builder, config| {
            let options = config.options.clone();
            let step = match config.step.as_str() {
                "delegate" | "delegate_to_controller" => PipelineStep::delegate(),
                "log_event" => log_event(options),
                "filter_actions" => filter_actions(options),
                "skip_observed_generations" => skip_observed_generations(),
                "finalizer" => finalizer(options),
                "release_finalizer" => release_finalizer(),
                other => return Err(ConfigError::UnknownStep(other.to_string())),
            };
            Ok(builder.step(step))
        })
        .map(|builder| builder.build())
}

/// Logs every event.
///
/// Options: `{"level": "info" | "debug"}` (default `info`).
pub fn log_event(options: serde_json::Value) -> PipelineStep {
    PipelineStep::function("log_event", options, |ctx: ActionContext, opts: StepOptions| async move {
        let meta = &ctx.resource().metadata;
        let kind = ctx
            .resource()
            .types
            .as_ref()
            .map(|t| t.kind.as_str())
            .unwrap_or("<unknown>");
        let name = meta.name.as_deref().unwrap_or("<unnamed>");
        let namespace = meta.namespace.as_deref().unwrap_or("");

        if opts.str("level") == Some("debug") {
            tracing::debug!(operator = %ctx.operator(), action = %ctx.action(), kind, name, namespace, "observed change");
        } else {
            tracing::info!(operator = %ctx.operator(), action = %ctx.action(), kind, name, namespace, "observed change");
        }
        Ok(ctx)
    })
}

#[derive(Deserialize)]
struct ActionFilter {
    actions: Vec<Action>,
}

/// Halts every event whose action is not listed.
///
/// Options: `{"actions": ["Added", "Modified"]}`.
pub fn filter_actions(options: serde_json::Value) -> PipelineStep {
    PipelineStep::function("filter_actions", options, |ctx: ActionContext, opts: StepOptions| async move {
        let filter: ActionFilter = opts.parse()?;
        if filter.actions.contains(&ctx.action()) {
            Ok(ctx)
        } else {
            tracing::trace!(action = %ctx.action(), "action filtered out");
            Ok(ctx.halt())
        }
    })
}

/// Halts every event for which `keep` returns false.
pub fn predicate<F>(name: impl Into<String>, keep: F) -> PipelineStep
where
    F: Fn(&ActionContext) -> bool + Send + Sync + Clone + 'static,
{
    PipelineStep::function(name, serde_json::Value::Null, move |ctx: ActionContext, _| {
        let keep = keep.clone();
        async move {
            if keep(&ctx) {
                Ok(ctx)
            } else {
                Ok(ctx.halt())
            }
        }
    })
}

/// Halts additions and modifications whose generation has already been
/// observed, i.e. `status.observedGeneration == metadata.generation`.
pub fn skip_observed_generations() -> PipelineStep {
    PipelineStep::function(
        "skip_observed_generations",
        serde_json::Value::Null,
        |ctx: ActionContext, _| async move {
            if ctx.action() == Action::Deleted {
                return Ok(ctx);
            }
            let generation = ctx.resource().metadata.generation;
            let observed = ctx
                .resource()
                .data
                .pointer("/status/observedGeneration")
                .and_then(|v| v.as_i64());

            match (generation, observed) {
                (Some(generation), Some(observed)) if generation == observed => {
                    tracing::debug!(generation, "generation already observed, skipping");
                    Ok(ctx.halt())
                }
                _ => Ok(ctx),
            }
        },
    )
}

#[derive(Deserialize)]
struct FinalizerOptions {
    name: String,
}

/// Assign recording the finalizer to strip once the controller succeeded.
pub const RELEASE_FINALIZER_ASSIGN: &str = "finalizer.release";

/// Manages a finalizer on watched resources.
///
/// Options: `{"name": "example.com/cleanup"}`.
///
/// - Live resource without the finalizer: queues a callback adding it.
/// - Resource being deleted that carries it: turns the action into
///   [`Action::Deleted`] and marks the finalizer for [`release_finalizer`].
/// - Resource being deleted without it: halts, there is nothing left to do.
///
/// Must be paired with [`release_finalizer`] placed after the delegate step,
/// otherwise deleted resources keep the finalizer forever.
pub fn finalizer(options: serde_json::Value) -> PipelineStep {
    PipelineStep::function("finalizer", options, |ctx: ActionContext, opts: StepOptions| async move {
        let FinalizerOptions { name } = opts.parse()?;
        let resource = ctx.resource();
        let finalizers = resource.metadata.finalizers.clone().unwrap_or_default();
        let has_finalizer = finalizers.iter().any(|f| *f == name);
        let deleting = resource.metadata.deletion_timestamp.is_some();

        match (deleting, has_finalizer) {
            (false, false) if ctx.action() != Action::Deleted => {
                let mut updated = finalizers;
                updated.push(name.clone());
                let callback = patch_callback(&ctx, format!("add finalizer {name}"), updated);
                Ok(ctx.defer(callback))
            }
            (true, true) => Ok(ctx
                .with_action(Action::Deleted)
                .assign(RELEASE_FINALIZER_ASSIGN, serde_json::Value::String(name))),
            (true, false) => Ok(ctx.halt()),
            _ => Ok(ctx),
        }
    })
}

/// Queues removal of the finalizer marked by [`finalizer`].
///
/// Placed after the delegate step, so it only runs once the controller's
/// cleanup succeeded. A failed cleanup leaves the finalizer in place and the
/// deletion is retried on the next change.
pub fn release_finalizer() -> PipelineStep {
    PipelineStep::function(
        "release_finalizer",
        serde_json::Value::Null,
        |ctx: ActionContext, _| async move {
            let Some(name) = ctx
                .assigned(RELEASE_FINALIZER_ASSIGN)
                .and_then(|v| v.as_str())
                .map(str::to_string)
            else {
                return Ok(ctx);
            };
            let finalizers = ctx.resource().metadata.finalizers.clone().unwrap_or_default();
            let updated = without(finalizers, &name);
            let callback =
                patch_callback(&ctx, format!("remove finalizer {name}"), updated).short_circuit();
            Ok(ctx.defer(callback))
        },
    )
}

fn without(finalizers: Vec<String>, name: &str) -> Vec<String> {
    finalizers.into_iter().filter(|f| f != name).collect()
}

fn patch_callback(ctx: &ActionContext, label: String, finalizers: Vec<String>) -> Callback {
    let connection = ctx.connection().clone();
    let resource: DynamicObject = ctx.resource().as_ref().clone();
    Callback::new(label, move || async move {
        connection.patch_finalizers(&resource, finalizers).await?;
        Ok(())
    })
}

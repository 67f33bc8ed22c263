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

//! Error types for the operator runtime.
//!
//! Errors are split by the phase in which they occur:
//!
//! - [`ConfigError`]: the operator definition or its assembly is invalid.
//!   Raised before any watch starts and never recovered.
//! - [`ClientError`]: the external Kubernetes client failed.
//! - [`ControllerError`]: a controller rejected its options or failed to reconcile.
//! - [`PipelineError`]: processing of one event failed.
//! - [`WatchError`]: a watch manager gave up on its subscription.
//! - [`SupervisorError`]: restart intensity was exceeded and the operator stopped.

use std::time::Duration;

use thiserror::Error;

use crate::action::PendingWork;

/// Definition-time and assembly-time configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("operator name cannot be empty")]
    EmptyOperatorName,

    #[error("operator {operator} has no default watch namespace")]
    MissingNamespace { operator: String },

    #[error(
        "operator {operator} pipeline has no delegate-to-controller step; \
         add exactly one `delegate` step"
    )]
    MissingDelegate { operator: String },

    #[error(
        "operator {operator} pipeline has {count} delegate-to-controller steps; \
         exactly one is allowed"
    )]
    DuplicateDelegate { operator: String, count: usize },

    #[error("operator {operator} has no controller spec resolver")]
    MissingSpecResolver { operator: String },

    #[error("operator {operator} failed to resolve controller specs: {source}")]
    SpecResolution {
        operator: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("operator {operator} references unknown controller {controller:?}")]
    UnknownController { operator: String, controller: String },

    #[error("controller name cannot be empty")]
    EmptyControllerName,

    #[error("controller {0:?} is already registered")]
    DuplicateController(String),

    #[error("alias {alias:?} is already used by controller {existing:?}")]
    AliasConflict { alias: String, existing: String },

    #[error("pipeline step name cannot be empty")]
    EmptyStepName,

    #[error("unknown pipeline step {0:?}")]
    UnknownStep(String),

    #[error("finalizer step must precede the delegate step and be released after it")]
    UnreleasedFinalizer,
}

/// Errors raised by the external Kubernetes client.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("watch stream error: {0}")]
    Watch(String),

    #[error("invalid watch query: {0}")]
    InvalidQuery(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("resource has no {0}")]
    MissingField(&'static str),
}

/// Errors raised by controllers during dispatch.
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("invalid options for controller {controller}: {reason}")]
    InvalidOptions { controller: String, reason: String },

    #[error("controller {controller} failed: {source}")]
    Reconcile {
        controller: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ControllerError {
    /// Wraps an arbitrary error as a reconcile failure of `controller`.
    pub fn reconcile(controller: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        ControllerError::Reconcile {
            controller: controller.into(),
            source: source.into(),
        }
    }
}

impl From<anyhow::Error> for ControllerError {
    fn from(err: anyhow::Error) -> Self {
        ControllerError::Reconcile {
            controller: "unknown".to_string(),
            source: err,
        }
    }
}

/// Failure of a single event's pipeline run.
///
/// Work queued by steps that completed before the failure travels with the
/// error so it can still be delivered.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("pipeline step {step} failed: {source}")]
    StepFailed {
        step: String,
        #[source]
        source: anyhow::Error,
        pending: PendingWork,
    },

    #[error("controller dispatch failed: {source}")]
    Dispatch {
        #[source]
        source: ControllerError,
        pending: PendingWork,
    },
}

impl PipelineError {
    /// Takes the work that was queued before the failure.
    pub fn take_pending(&mut self) -> PendingWork {
        match self {
            PipelineError::StepFailed { pending, .. } | PipelineError::Dispatch { pending, .. } => {
                std::mem::take(pending)
            }
        }
    }
}

/// A watch manager stopped because its subscription kept failing.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("watch {watch} failed to subscribe after {attempts} attempts: {source}")]
    SubscriptionFailed {
        watch: String,
        attempts: u32,
        #[source]
        source: ClientError,
    },
}

/// Errors that terminate the whole supervision tree.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error(
        "watch {child} exceeded restart intensity ({restarts} restarts within {window:?}); \
         shutting down operator"
    )]
    RestartIntensityExceeded {
        child: String,
        restarts: usize,
        window: Duration,
    },
}

/// Umbrella error for starting and running an operator.
#[derive(Error, Debug)]
pub enum OperatorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("operator task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Result type for operator operations.
pub type Result<T, E = OperatorError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_delegate_names_operator() {
        let err = ConfigError::MissingDelegate {
            operator: "widget-operator".to_string(),
        };
        assert!(err.to_string().contains("widget-operator"));
        assert!(err.to_string().contains("delegate"));
    }

    #[test]
    fn test_take_pending_leaves_empty() {
        let mut err = PipelineError::StepFailed {
            step: "boom".to_string(),
            source: anyhow::anyhow!("nope"),
            pending: PendingWork::default(),
        };
        assert!(err.take_pending().is_empty());
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_restart_intensity_message() {
        let err = SupervisorError::RestartIntensityExceeded {
            child: "v1/ConfigMap@default#0".to_string(),
            restarts: 6,
            window: Duration::from_secs(60),
        };
        assert!(err.to_string().contains("v1/ConfigMap@default#0"));
    }
}

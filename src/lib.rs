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

//! kube-operator-runtime - runtime core for Kubernetes operators
//!
//! This library provides the pieces an operator is assembled from:
//! - Action contexts flowing through ordered pipelines of steps
//! - Controller traits, registry and dispatch
//! - Supervised watch managers, one per controller spec
//! - Operator definition, assembly and lifecycle
//! - Configuration, health checks and a Kubernetes-backed connection

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::too_many_arguments)]

pub mod action;
pub mod client;
pub mod config;
pub mod controller;
pub mod delivery;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod kube_client;
pub mod operator;
pub mod pipeline;
pub mod recorder;
pub mod registry;
pub mod steps;
pub mod supervisor;
pub mod testing;
pub mod watch;

// Re-export commonly used types
pub use action::{Action, ActionContext, Callback, EventType, KubeEvent};
pub use client::{Connection, SharedConnection, WatchNotification, WatchQuery};
pub use config::{OperatorFileConfig, RuntimeConfig};
pub use controller::{Controller, ControllerBinding, ControllerOptions, DynController, FunctionController};
pub use error::{ConfigError, ControllerError, OperatorError, PipelineError};
pub use kube_client::KubeConnection;
pub use operator::{ControllerRef, ControllerSpec, OperatorDefinition, OperatorHandle, StartOptions};
pub use pipeline::{Pipeline, PipelineStep, StepOptions};
pub use registry::{ControllerDescriptor, ControllerRegistry};
pub use watch::{WatchState, WatchStatus};

/// Semantic version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

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

//! Operator definition and assembly.
//!
//! An [`OperatorDefinition`] is the static description of an operator: its
//! name, default watch namespace, pipeline, known controllers and a resolver
//! producing the controller specs to watch. [`OperatorDefinition::start`]
//! resolves and validates everything up front, then launches one supervised
//! watch manager per spec.
//!
//! # Example
//!
//! ```rust,no_run
//! use kube_operator_runtime::controller::FunctionController;
//! use kube_operator_runtime::operator::{ControllerSpec, OperatorDefinition, StartOptions};
//! use kube_operator_runtime::testing::MemoryConnection;
//! use kube_operator_runtime::{ActionContext, WatchQuery};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let operator = OperatorDefinition::builder("widget-operator")
//!     .default_watch_namespace("default")
//!     .controller("widgets", FunctionController::new("widgets", |ctx: ActionContext| async move {
//!         Ok(ctx)
//!     }))
//!     .controller_specs(|namespace, _args| {
//!         Ok(vec![ControllerSpec::new(
//!             WatchQuery::new("example.com/v1", "Widget").in_namespace(namespace),
//!         )
//!         .controller("widgets")])
//!     })
//!     .build()?;
//!
//! let handle = operator.start(MemoryConnection::shared(), StartOptions::default())?;
//! handle.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::{SharedConnection, WatchQuery};
use crate::config::RuntimeConfig;
use crate::controller::{Controller, ControllerBinding, ControllerOptions};
use crate::error::{ConfigError, OperatorError, SupervisorError};
use crate::pipeline::Pipeline;
use crate::registry::{ControllerDescriptor, ControllerRegistry};
use crate::supervisor::Supervisor;
use crate::watch::{WatchManager, WatchStatus};

/// Free-form arguments passed to the spec resolver.
pub type StartArgs = serde_json::Map<String, serde_json::Value>;

/// Produces the controller specs for a namespace and start arguments.
pub type SpecResolver =
    Arc<dyn Fn(&str, &StartArgs) -> anyhow::Result<Vec<ControllerSpec>> + Send + Sync>;

/// Reference to a registered controller, with or without options.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerRef {
    /// Bare name; initialized with empty options.
    Module(String),
    /// Name with explicit options.
    WithOptions(String, ControllerOptions),
}

impl ControllerRef {
    /// Returns the referenced controller name.
    pub fn name(&self) -> &str {
        match self {
            ControllerRef::Module(name) | ControllerRef::WithOptions(name, _) => name,
        }
    }

    /// Converts the reference to its `(name, options)` form. A bare name
    /// gets an empty options object.
    pub fn normalize(self) -> (String, ControllerOptions) {
        match self {
            ControllerRef::Module(name) => (name, ControllerOptions::Object(Default::default())),
            ControllerRef::WithOptions(name, options) => (name, options),
        }
    }
}

impl From<&str> for ControllerRef {
    fn from(name: &str) -> Self {
        ControllerRef::Module(name.to_string())
    }
}

impl From<String> for ControllerRef {
    fn from(name: String) -> Self {
        ControllerRef::Module(name)
    }
}

impl<S: Into<String>> From<(S, ControllerOptions)> for ControllerRef {
    fn from((name, options): (S, ControllerOptions)) -> Self {
        ControllerRef::WithOptions(name.into(), options)
    }
}

/// What to watch and, optionally, which controller handles it.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSpec {
    /// The watch query.
    pub query: WatchQuery,
    /// The controller receiving the events; `None` only observes them.
    pub controller: Option<ControllerRef>,
}

impl ControllerSpec {
    /// Creates a spec without a controller.
    pub fn new(query: WatchQuery) -> Self {
        Self {
            query,
            controller: None,
        }
    }

    /// Sets the controller.
    pub fn controller(mut self, controller: impl Into<ControllerRef>) -> Self {
        self.controller = Some(controller.into());
        self
    }
}

/// A controller spec after assembly: identified, with its controller resolved.
#[derive(Clone)]
pub struct ResolvedSpec {
    id: Arc<str>,
    query: WatchQuery,
    controller: Option<ControllerBinding>,
}

impl ResolvedSpec {
    /// Creates a resolved spec.
    pub fn new(
        id: impl Into<Arc<str>>,
        query: WatchQuery,
        controller: Option<ControllerBinding>,
    ) -> Self {
        Self {
            id: id.into(),
            query,
            controller,
        }
    }

    /// Returns the id, unique within the operator.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn id_arc(&self) -> Arc<str> {
        self.id.clone()
    }

    /// Returns the watch query.
    pub fn query(&self) -> &WatchQuery {
        &self.query
    }

    /// Returns the bound controller.
    pub fn controller(&self) -> Option<&ControllerBinding> {
        self.controller.as_ref()
    }
}

impl fmt::Debug for ResolvedSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedSpec")
            .field("id", &self.id)
            .field("query", &self.query)
            .field("controller", &self.controller)
            .finish()
    }
}

/// Options given when starting an operator.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Namespace overriding the default watch namespace.
    pub namespace: Option<String>,
    /// Arguments for the spec resolver.
    pub args: StartArgs,
}

impl StartOptions {
    /// Overrides the watch namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Adds a resolver argument.
    pub fn with_arg(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.args.insert(key.into(), value);
        self
    }
}

/// A validated operator definition.
#[derive(Clone)]
pub struct OperatorDefinition {
    name: Arc<str>,
    default_watch_namespace: String,
    pipeline: Arc<Pipeline>,
    registry: Arc<ControllerRegistry>,
    resolver: SpecResolver,
    runtime: RuntimeConfig,
}

impl OperatorDefinition {
    /// Creates a builder.
    pub fn builder(name: impl Into<String>) -> OperatorBuilder {
        OperatorBuilder::new(name)
    }

    /// Returns the operator name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the namespace watched when none is given at start.
    pub fn default_watch_namespace(&self) -> &str {
        &self.default_watch_namespace
    }

    /// Returns the pipeline.
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Returns the controller registry.
    pub fn registry(&self) -> &ControllerRegistry {
        &self.registry
    }

    /// Returns the runtime configuration.
    pub fn runtime(&self) -> &RuntimeConfig {
        &self.runtime
    }

    /// Resolves the controller specs for `options` and binds their controllers.
    ///
    /// Every error is a [`ConfigError`] and nothing is started.
    pub fn assemble(
        &self,
        connection: SharedConnection,
        options: StartOptions,
    ) -> Result<AssembledOperator, ConfigError> {
        self.pipeline.validate(&self.name)?;

        let namespace = options
            .namespace
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| self.default_watch_namespace.clone());

        let specs = (self.resolver)(&namespace, &options.args).map_err(|source| {
            ConfigError::SpecResolution {
                operator: self.name.to_string(),
                source,
            }
        })?;

        let resolved = specs
            .into_iter()
            .enumerate()
            .map(|(index, spec)| self.resolve(index, spec).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(
            operator = %self.name,
            namespace = %namespace,
            specs = resolved.len(),
            "operator assembled"
        );

        Ok(AssembledOperator {
            name: self.name.clone(),
            namespace,
            specs: resolved,
            pipeline: self.pipeline.clone(),
            connection,
            runtime: self.runtime.clone(),
        })
    }

    fn resolve(&self, index: usize, spec: ControllerSpec) -> Result<ResolvedSpec, ConfigError> {
        let id = format!("{}#{}", spec.query.key(), index);

        let controller = match spec.controller {
            None => None,
            Some(reference) => {
                let (name, options) = reference.normalize();
                let descriptor =
                    self.registry
                        .get(&name)
                        .ok_or_else(|| ConfigError::UnknownController {
                            operator: self.name.to_string(),
                            controller: name.clone(),
                        })?;
                Some(ControllerBinding::new(
                    descriptor.name(),
                    options,
                    descriptor.controller().clone(),
                ))
            }
        };

        Ok(ResolvedSpec::new(id, spec.query, controller))
    }

    /// Assembles the operator and starts its supervision tree.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        &self,
        connection: SharedConnection,
        options: StartOptions,
    ) -> Result<OperatorHandle, ConfigError> {
        Ok(self.assemble(connection, options)?.start())
    }
}

impl fmt::Debug for OperatorDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorDefinition")
            .field("name", &self.name)
            .field("default_watch_namespace", &self.default_watch_namespace)
            .field("pipeline", &self.pipeline)
            .field("controllers", &self.registry.controller_names())
            .finish()
    }
}

/// Builder for [`OperatorDefinition`].
pub struct OperatorBuilder {
    name: String,
    default_watch_namespace: Option<String>,
    pipeline: Option<Pipeline>,
    registry: ControllerRegistry,
    resolver: Option<SpecResolver>,
    runtime: RuntimeConfig,
    registration_error: Option<ConfigError>,
}

impl OperatorBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_watch_namespace: None,
            pipeline: None,
            registry: ControllerRegistry::new(),
            resolver: None,
            runtime: RuntimeConfig::default(),
            registration_error: None,
        }
    }

    /// Sets the namespace watched when none is given at start.
    pub fn default_watch_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.default_watch_namespace = Some(namespace.into());
        self
    }

    /// Sets the pipeline. Defaults to [`Pipeline::default_pipeline`].
    pub fn pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    /// Replaces the controller registry.
    pub fn registry(mut self, registry: ControllerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Registers a controller descriptor.
    ///
    /// Registration errors are reported by [`OperatorBuilder::build`].
    pub fn register(mut self, descriptor: ControllerDescriptor) -> Self {
        if let Err(e) = self.registry.register(descriptor) {
            self.registration_error.get_or_insert(e);
        }
        self
    }

    /// Registers a controller under `name`.
    pub fn controller<C: Controller>(self, name: impl Into<String>, controller: C) -> Self {
        self.register(ControllerDescriptor::builder(name).build(controller))
    }

    /// Sets the function producing the controller specs at start.
    pub fn controller_specs<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&str, &StartArgs) -> anyhow::Result<Vec<ControllerSpec>> + Send + Sync + 'static,
    {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    /// Uses a fixed list of controller specs.
    pub fn static_specs(self, specs: Vec<ControllerSpec>) -> Self {
        self.controller_specs(move |_, _| Ok(specs.clone()))
    }

    /// Sets the runtime configuration.
    pub fn runtime(mut self, runtime: RuntimeConfig) -> Self {
        self.runtime = runtime;
        self
    }

    /// Validates and builds the definition.
    pub fn build(self) -> Result<OperatorDefinition, ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::EmptyOperatorName);
        }
        if let Some(e) = self.registration_error {
            return Err(e);
        }

        let default_watch_namespace = self
            .default_watch_namespace
            .filter(|ns| !ns.is_empty())
            .ok_or_else(|| ConfigError::MissingNamespace {
                operator: self.name.clone(),
            })?;

        let pipeline = self.pipeline.unwrap_or_else(Pipeline::default_pipeline);
        pipeline.validate(&self.name)?;

        let resolver = self.resolver.ok_or_else(|| ConfigError::MissingSpecResolver {
            operator: self.name.clone(),
        })?;

        Ok(OperatorDefinition {
            name: self.name.into(),
            default_watch_namespace,
            pipeline: Arc::new(pipeline),
            registry: Arc::new(self.registry),
            resolver,
            runtime: self.runtime,
        })
    }
}

/// An operator whose specs are resolved, ready to start.
pub struct AssembledOperator {
    name: Arc<str>,
    namespace: String,
    specs: Vec<Arc<ResolvedSpec>>,
    pipeline: Arc<Pipeline>,
    connection: SharedConnection,
    runtime: RuntimeConfig,
}

impl AssembledOperator {
    /// Returns the operator name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the namespace the specs were resolved for.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns the resolved specs in order.
    pub fn specs(&self) -> &[Arc<ResolvedSpec>] {
        &self.specs
    }

    /// Builds the supervision tree without starting it.
    pub fn into_supervisor(self, shutdown_token: CancellationToken) -> Supervisor {
        let children = self
            .specs
            .into_iter()
            .map(|spec| {
                Arc::new(WatchManager::new(
                    spec,
                    self.name.clone(),
                    self.connection.clone(),
                    self.pipeline.clone(),
                    self.runtime.watch.clone(),
                ))
            })
            .collect();

        Supervisor::new(self.name, children, self.runtime.supervisor, shutdown_token)
    }

    /// Starts the supervision tree on a new task.
    pub fn start(self) -> OperatorHandle {
        let name = self.name.clone();
        let shutdown_token = CancellationToken::new();
        let supervisor = self.into_supervisor(shutdown_token.clone());
        let statuses = supervisor.statuses();

        tracing::info!(operator = %name, watches = statuses.len(), "starting operator");
        let task = tokio::spawn(supervisor.run());

        OperatorHandle {
            name,
            shutdown_token,
            statuses,
            task,
        }
    }
}

/// Handle to a running operator.
pub struct OperatorHandle {
    name: Arc<str>,
    shutdown_token: CancellationToken,
    statuses: Vec<WatchStatus>,
    task: JoinHandle<Result<(), SupervisorError>>,
}

impl OperatorHandle {
    /// Returns the operator name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns a status handle per watch, in spec order.
    pub fn statuses(&self) -> &[WatchStatus] {
        &self.statuses
    }

    /// Returns the token that stops the operator when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Requests a graceful shutdown.
    pub fn shutdown(&self) {
        tracing::info!(operator = %self.name, "initiating graceful shutdown");
        self.shutdown_token.cancel();
    }

    /// Returns true once the supervision tree has stopped.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the operator to stop, either after [`OperatorHandle::shutdown`]
    /// or because restart intensity was exceeded.
    pub async fn wait(self) -> Result<(), OperatorError> {
        self.task.await??;
        Ok(())
    }

    /// Shuts down and waits.
    pub async fn stop(self) -> Result<(), OperatorError> {
        self.shutdown();
        self.wait().await
    }
}

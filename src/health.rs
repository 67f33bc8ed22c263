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

//! Health check support.
//!
//! Serves liveness and readiness endpoints for a running operator:
//!
//! - `/healthz`: the process is up
//! - `/readyz` (also `/healthz/ready`): every registered checker passes
//! - `/healthz/deep`: per-checker results as JSON

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::HealthConfig;
use crate::watch::{WatchState, WatchStatus};

/// Health check status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// The component is healthy.
    Healthy,
    /// The component is unhealthy.
    Unhealthy,
}

impl From<bool> for HealthStatus {
    fn from(healthy: bool) -> Self {
        if healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }
}

/// Health check result.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    /// The overall health status.
    pub status: HealthStatus,

    /// Individual component health.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub checks: HashMap<String, HealthStatus>,
}

/// Health checker trait.
pub trait HealthChecker: Send + Sync + 'static {
    /// Returns `true` if the component is healthy.
    fn check(&self) -> BoxFuture<'_, bool>;

    /// Returns the name of this checker.
    fn name(&self) -> &str;
}

/// Adapter for implementing [`HealthChecker`] with a function.
pub struct FunctionHealthChecker<F, Fut>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = bool> + Send,
{
    name: String,
    check_fn: F,
}

impl<F, Fut> FunctionHealthChecker<F, Fut>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = bool> + Send,
{
    /// Creates a new function-based health checker.
    pub fn new(name: impl Into<String>, check_fn: F) -> Self {
        Self {
            name: name.into(),
            check_fn,
        }
    }
}

impl<F, Fut> HealthChecker for FunctionHealthChecker<F, Fut>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    fn check(&self) -> BoxFuture<'_, bool> {
        Box::pin((self.check_fn)())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Ready when every watch of an operator is subscribed.
pub struct WatchHealthChecker {
    name: String,
    statuses: Vec<WatchStatus>,
}

impl WatchHealthChecker {
    /// Creates a checker over the given watches.
    pub fn new(name: impl Into<String>, statuses: Vec<WatchStatus>) -> Self {
        Self {
            name: name.into(),
            statuses,
        }
    }
}

impl HealthChecker for WatchHealthChecker {
    fn check(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let mut healthy = true;
            for status in &self.statuses {
                let state = status.state();
                if state != WatchState::Watching {
                    tracing::debug!(watch = %status.id(), ?state, "watch not ready");
                    healthy = false;
                }
            }
            healthy
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Health check registry.
#[derive(Clone, Default)]
pub struct HealthRegistry {
    checkers: Arc<RwLock<Vec<Arc<dyn HealthChecker>>>>,
}

impl HealthRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a health checker.
    pub async fn register(&self, checker: Arc<dyn HealthChecker>) {
        self.checkers.write().await.push(checker);
    }

    /// Removes a health checker by name.
    pub async fn unregister(&self, name: &str) -> bool {
        let mut checkers = self.checkers.write().await;
        let original_len = checkers.len();
        checkers.retain(|c| c.name() != name);
        checkers.len() < original_len
    }

    /// Runs all health checks and returns the results.
    pub async fn check_all(&self) -> HealthCheck {
        let checkers = self.checkers.read().await;
        let mut checks = HashMap::new();
        let mut overall_healthy = true;

        for checker in checkers.iter() {
            let healthy = checker.check().await;
            overall_healthy &= healthy;
            checks.insert(checker.name().to_string(), HealthStatus::from(healthy));
        }

        HealthCheck {
            status: overall_healthy.into(),
            checks,
        }
    }

    /// Returns the number of registered checkers.
    pub async fn len(&self) -> usize {
        self.checkers.read().await.len()
    }

    /// Returns true if there are no registered checkers.
    pub async fn is_empty(&self) -> bool {
        self.checkers.read().await.is_empty()
    }
}

/// Health check server.
pub struct HealthServer {
    registry: HealthRegistry,
    bind_address: String,
    bind_port: u16,
}

impl HealthServer {
    /// Creates a new health server.
    pub fn new(bind_address: impl Into<String>, bind_port: u16) -> Self {
        Self {
            registry: HealthRegistry::new(),
            bind_address: bind_address.into(),
            bind_port,
        }
    }

    /// Creates a server from configuration.
    pub fn from_config(config: &HealthConfig) -> Self {
        Self::new(config.bind_address.clone(), config.port)
    }

    /// Returns the health registry.
    pub fn registry(&self) -> &HealthRegistry {
        &self.registry
    }

    /// Serves requests until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.bind_address, self.bind_port);
        let listener = TcpListener::bind(&addr).await?;

        tracing::info!("health server listening on {}", addr);

        loop {
            let (stream, _) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted?,
            };
            let registry = self.registry.clone();
            let io = TokioIo::new(stream);

            tokio::task::spawn(async move {
                let http = hyper::server::conn::http1::Builder::new();
                let service = service_fn(move |req: Request<Incoming>| {
                    let registry = registry.clone();
                    async move {
                        Ok::<_, hyper::Error>(route(req.uri().path(), &registry).await)
                    }
                });

                if let Err(e) = http.serve_connection(io, service).await {
                    tracing::debug!(error = %e, "health connection closed with error");
                }
            });
        }

        tracing::info!("health server stopped");
        Ok(())
    }

    /// Runs the health server in a background task.
    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(self.run(shutdown))
    }
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

async fn route(path: &str, registry: &HealthRegistry) -> Response<Full<Bytes>> {
    match path {
        "/healthz" | "/healthz/live" | "/livez" => respond(StatusCode::OK, "text/plain", "ok"),
        "/readyz" | "/healthz/ready" => {
            let result = registry.check_all().await;
            if result.status == HealthStatus::Healthy {
                respond(StatusCode::OK, "text/plain", "ok")
            } else {
                respond(StatusCode::SERVICE_UNAVAILABLE, "text/plain", "not ready")
            }
        }
        "/healthz/deep" => {
            let result = registry.check_all().await;
            let status = match result.status {
                HealthStatus::Healthy => StatusCode::OK,
                HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
            };
            let json = serde_json::to_string(&result).unwrap_or_default();
            respond(status, "application/json", json)
        }
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::WatchQuery;
    use crate::config::WatchConfig;
    use crate::operator::ResolvedSpec;
    use crate::pipeline::Pipeline;
    use crate::testing::MemoryConnection;
    use crate::watch::WatchManager;

    #[tokio::test]
    async fn test_health_registry() {
        let registry = HealthRegistry::new();

        let checker = FunctionHealthChecker::new("test", || async { true });
        registry.register(Arc::new(checker)).await;

        assert_eq!(registry.len().await, 1);
        assert!(!registry.is_empty().await);

        let result = registry.check_all().await;
        assert_eq!(result.status, HealthStatus::Healthy);
        assert_eq!(result.checks.get("test"), Some(&HealthStatus::Healthy));

        assert!(registry.unregister("test").await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_readiness_routes() {
        let registry = HealthRegistry::new();
        assert_eq!(route("/healthz", &registry).await.status(), StatusCode::OK);
        assert_eq!(route("/readyz", &registry).await.status(), StatusCode::OK);
        assert_eq!(route("/nope", &registry).await.status(), StatusCode::NOT_FOUND);

        registry
            .register(Arc::new(FunctionHealthChecker::new("failing", || async { false })))
            .await;
        assert_eq!(route("/healthz", &registry).await.status(), StatusCode::OK);
        assert_eq!(
            route("/readyz", &registry).await.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );

        let deep = route("/healthz/deep", &registry).await;
        assert_eq!(deep.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(deep.headers()[CONTENT_TYPE], "application/json");
    }

    #[tokio::test]
    async fn test_watch_checker_follows_watch_state() {
        let connection = MemoryConnection::new();
        let query = WatchQuery::new("v1", "ConfigMap").in_namespace("default");
        let manager = Arc::new(WatchManager::new(
            Arc::new(ResolvedSpec::new("cm#0", query, None)),
            "op",
            Arc::new(connection),
            Arc::new(Pipeline::default_pipeline()),
            WatchConfig::default(),
        ));
        let checker = WatchHealthChecker::new("watches", vec![manager.status()]);
        assert!(!checker.check().await);

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let manager = manager.clone();
            let cancel = cancel.clone();
            async move { manager.run(cancel).await }
        });
        let mut status = manager.status();
        assert!(status.wait_for(WatchState::Watching).await);
        assert!(checker.check().await);

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert!(!checker.check().await);
    }
}

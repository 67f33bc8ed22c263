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

//! Supervision tree - keeps one watch manager running per controller spec.
//!
//! Watches are supervised one-for-one: a crashed watch is restarted on its
//! own and its siblings keep running. When restarts happen faster than the
//! configured intensity allows, the supervisor cancels every watch and
//! returns an error, taking the operator down.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::SupervisorConfig;
use crate::error::SupervisorError;
use crate::watch::{WatchManager, WatchStatus};

/// Why a child stopped.
#[derive(Debug)]
enum ChildExit {
    Stopped,
    Crashed(String),
}

/// Supervises a fixed set of watch managers.
pub struct Supervisor {
    operator: Arc<str>,
    children: Vec<Arc<WatchManager>>,
    config: SupervisorConfig,
    shutdown_token: CancellationToken,
}

impl Supervisor {
    /// Creates a supervisor over `children`. Cancelling `shutdown_token`
    /// stops the tree gracefully.
    pub fn new(
        operator: impl Into<Arc<str>>,
        children: Vec<Arc<WatchManager>>,
        config: SupervisorConfig,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            operator: operator.into(),
            children,
            config,
            shutdown_token,
        }
    }

    /// Returns a status handle for every child, in start order.
    pub fn statuses(&self) -> Vec<WatchStatus> {
        self.children.iter().map(|c| c.status()).collect()
    }

    /// Returns the shutdown token.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    fn spawn_child(&self, join_set: &mut JoinSet<(usize, ChildExit)>, index: usize) {
        let Some(child) = self.children.get(index).cloned() else {
            return;
        };
        let cancel = self.shutdown_token.child_token();

        join_set.spawn(async move {
            let exit = match AssertUnwindSafe(child.run(cancel)).catch_unwind().await {
                Ok(Ok(())) => ChildExit::Stopped,
                Ok(Err(e)) => ChildExit::Crashed(e.to_string()),
                Err(panic) => ChildExit::Crashed(panic_message(panic.as_ref())),
            };
            (index, exit)
        });
    }

    fn child_id(&self, index: usize) -> String {
        self.children
            .get(index)
            .map(|c| c.id().to_string())
            .unwrap_or_else(|| format!("#{index}"))
    }

    /// Runs every child until shutdown or escalation.
    ///
    /// Returns `Ok` after a graceful shutdown. Returns
    /// [`SupervisorError::RestartIntensityExceeded`] when more than
    /// `max_restarts` crashes happen within `restart_window`; all children are
    /// stopped before it returns.
    pub async fn run(self) -> Result<(), SupervisorError> {
        if self.children.is_empty() {
            tracing::warn!(operator = %self.operator, "no watches configured, supervisor exiting");
            return Ok(());
        }

        let mut join_set = JoinSet::new();
        for index in 0..self.children.len() {
            self.spawn_child(&mut join_set, index);
        }
        tracing::info!(
            operator = %self.operator,
            watches = self.children.len(),
            "supervisor started"
        );

        let mut restarts: VecDeque<Instant> = VecDeque::new();

        loop {
            let joined = tokio::select! {
                _ = self.shutdown_token.cancelled() => {
                    tracing::info!(operator = %self.operator, "shutdown signal received, waiting for watches to stop");
                    break;
                }
                joined = join_set.join_next() => joined,
            };

            let (index, exit) = match joined {
                Some(Ok(result)) => result,
                Some(Err(e)) => {
                    tracing::error!(operator = %self.operator, error = %e, "watch task failed");
                    continue;
                }
                None => break,
            };

            let reason = match exit {
                ChildExit::Stopped => {
                    tracing::debug!(watch = %self.child_id(index), "watch finished");
                    continue;
                }
                ChildExit::Crashed(reason) => reason,
            };

            let now = Instant::now();
            restarts.push_back(now);
            while let Some(oldest) = restarts.front() {
                if now.duration_since(*oldest) > self.config.restart_window {
                    restarts.pop_front();
                } else {
                    break;
                }
            }

            if restarts.len() > self.config.max_restarts {
                let child = self.child_id(index);
                tracing::error!(
                    operator = %self.operator,
                    watch = %child,
                    restarts = restarts.len(),
                    window = ?self.config.restart_window,
                    reason = %reason,
                    "restart intensity exceeded, stopping operator"
                );
                self.shutdown_token.cancel();
                self.drain(&mut join_set).await;
                return Err(SupervisorError::RestartIntensityExceeded {
                    child,
                    restarts: restarts.len(),
                    window: self.config.restart_window,
                });
            }

            tracing::warn!(
                operator = %self.operator,
                watch = %self.child_id(index),
                reason = %reason,
                "watch crashed, restarting"
            );
            self.spawn_child(&mut join_set, index);
        }

        self.drain(&mut join_set).await;
        tracing::info!(operator = %self.operator, "supervisor stopped");
        Ok(())
    }

    /// Waits for the remaining children, aborting them after the shutdown timeout.
    async fn drain(&self, join_set: &mut JoinSet<(usize, ChildExit)>) {
        let deadline = Instant::now() + self.config.shutdown_timeout;

        while !join_set.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!(
                    operator = %self.operator,
                    remaining = join_set.len(),
                    "shutdown timeout reached, aborting watches"
                );
                join_set.shutdown().await;
                break;
            }

            tokio::select! {
                result = join_set.join_next() => {
                    match result {
                        Some(Ok((index, ChildExit::Stopped))) => {
                            tracing::debug!(watch = %self.child_id(index), "watch stopped");
                        }
                        Some(Ok((index, ChildExit::Crashed(reason)))) => {
                            tracing::warn!(watch = %self.child_id(index), reason = %reason, "watch stopped with error");
                        }
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "watch task failed");
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep(remaining.min(Duration::from_secs(1))) => {
                    tracing::debug!(remaining = join_set.len(), "still waiting for watches");
                }
            }
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
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
    use crate::watch::WatchState;

    fn child(connection: &MemoryConnection, kind: &str, max_reconnect_attempts: u32) -> Arc<WatchManager> {
        let query = WatchQuery::new("v1", kind).in_namespace("default");
        let spec = Arc::new(ResolvedSpec::new(format!("{}#0", query.key()), query, None));
        Arc::new(WatchManager::new(
            spec,
            "test-operator",
            Arc::new(connection.clone()),
            Arc::new(Pipeline::default_pipeline()),
            WatchConfig {
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                max_reconnect_attempts,
            },
        ))
    }

    fn config(max_restarts: usize) -> SupervisorConfig {
        SupervisorConfig {
            max_restarts,
            restart_window: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_graceful_shutdown() {
        let connection = MemoryConnection::new();
        let supervisor = Supervisor::new(
            "op",
            vec![child(&connection, "ConfigMap", 3), child(&connection, "Secret", 3)],
            config(3),
            CancellationToken::new(),
        );
        let token = supervisor.shutdown_token();
        let mut statuses = supervisor.statuses();
        let task = tokio::spawn(supervisor.run());

        for status in &mut statuses {
            assert!(status.wait_for(WatchState::Watching).await);
        }
        token.cancel();

        assert!(task.await.unwrap().is_ok());
        assert!(statuses.iter().all(|s| s.state() == WatchState::Stopped));
    }

    #[tokio::test]
    async fn test_crashed_child_is_restarted_alone() {
        let connection = MemoryConnection::new();
        let flaky = WatchQuery::new("v1", "Secret").in_namespace("default");
        // Two crashes of one attempt each, then a healthy subscription.
        connection.fail_subscriptions(&flaky, 2);

        let supervisor = Supervisor::new(
            "op",
            vec![child(&connection, "ConfigMap", 3), child(&connection, "Secret", 0)],
            config(3),
            CancellationToken::new(),
        );
        let token = supervisor.shutdown_token();
        let mut statuses = supervisor.statuses();
        let task = tokio::spawn(supervisor.run());

        for status in &mut statuses {
            assert!(status.wait_for(WatchState::Watching).await);
        }
        let stable = WatchQuery::new("v1", "ConfigMap").in_namespace("default");
        assert_eq!(connection.subscription_attempts(&stable), 1);
        assert_eq!(connection.subscription_attempts(&flaky), 3);

        token.cancel();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_restart_intensity_escalates() {
        let connection = MemoryConnection::new();
        let broken = WatchQuery::new("v1", "Secret").in_namespace("default");
        connection.fail_subscriptions(&broken, usize::MAX);

        let supervisor = Supervisor::new(
            "op",
            vec![child(&connection, "ConfigMap", 3), child(&connection, "Secret", 0)],
            config(2),
            CancellationToken::new(),
        );
        let token = supervisor.shutdown_token();
        let statuses = supervisor.statuses();

        let err = supervisor.run().await.unwrap_err();
        let SupervisorError::RestartIntensityExceeded { child, restarts, .. } = err;
        assert_eq!(child, "v1/Secret@default#0");
        assert_eq!(restarts, 3);
        assert!(token.is_cancelled());
        assert!(statuses.iter().all(|s| s.state() == WatchState::Stopped));
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "panicked: boom");
    }
}

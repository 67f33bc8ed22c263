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

//! Watch manager - one long-lived subscription per controller spec.
//!
//! A [`WatchManager`] subscribes to its query, turns every notification into
//! an [`ActionContext`], runs the operator pipeline over it and delivers the
//! queued events and callbacks. Events of one watch are processed strictly
//! one after another. A failure or panic while processing an event is
//! contained and logged; only a subscription that keeps failing stops the
//! watch.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::action::ActionContext;
use crate::client::{SharedConnection, WatchNotification, WatchStream};
use crate::config::WatchConfig;
use crate::delivery::{deliver, DeliveryReport};
use crate::error::{ClientError, PipelineError, WatchError};
use crate::operator::ResolvedSpec;
use crate::pipeline::Pipeline;

/// Lifecycle of a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WatchState {
    /// Subscribing for the first time.
    Starting,
    /// Subscribed and processing notifications.
    Watching,
    /// Waiting to resubscribe after the stream ended or failed.
    Reconnecting,
    /// Not running.
    Stopped,
}

/// Read-only view of a watch's state.
#[derive(Debug, Clone)]
pub struct WatchStatus {
    id: Arc<str>,
    rx: watch::Receiver<WatchState>,
}

impl WatchStatus {
    /// Returns the watch id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the current state.
    pub fn state(&self) -> WatchState {
        *self.rx.borrow()
    }

    /// Waits until the watch reaches `state`.
    ///
    /// Returns false if the watch manager was dropped first.
    pub async fn wait_for(&mut self, state: WatchState) -> bool {
        self.rx.wait_for(|s| *s == state).await.is_ok()
    }
}

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    /// Creates a backoff from the watch configuration.
    pub fn new(config: &WatchConfig) -> Self {
        Self {
            initial: config.initial_backoff,
            max: config.max_backoff,
            attempt: 0,
        }
    }

    /// Returns the next delay and advances the attempt counter.
    ///
    /// The delay doubles on every attempt, gets up to 50% jitter, and never
    /// exceeds the configured maximum.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(16));
        self.attempt = self.attempt.saturating_add(1);

        let base = self.initial.saturating_mul(factor).min(self.max);
        let jitter = rand::random::<f64>() * 0.5;
        Duration::from_secs_f64(base.as_secs_f64() * (1.0 + jitter)).min(self.max)
    }

    /// Starts over from the initial delay.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// How a subscription stream ended.
enum StreamEnd {
    Cancelled,
    Closed,
    Failed(ClientError),
}

/// Outcome of processing one notification.
#[derive(Debug)]
pub struct EventOutcome {
    /// Whether a step halted the pipeline.
    pub halted: bool,
    /// The pipeline failure, if any.
    pub error: Option<PipelineError>,
    /// Result of delivering the queued events and callbacks.
    pub delivery: DeliveryReport,
}

/// Runs `pipeline` over `ctx` and delivers what it queued.
///
/// Pending work is delivered even when a step fails, so events and
/// callbacks queued before the failure are not lost.
pub async fn process_event(
    pipeline: &Pipeline,
    connection: &SharedConnection,
    ctx: ActionContext,
) -> EventOutcome {
    let (pending, halted, error) = match pipeline.run(ctx).await {
        Ok(mut ctx) => (ctx.take_pending(), ctx.is_halted(), None),
        Err(mut err) => {
            tracing::error!(error = %err, "event processing failed");
            (err.take_pending(), false, Some(err))
        }
    };

    let delivery = deliver(connection.as_ref(), pending).await;
    EventOutcome {
        halted,
        error,
        delivery,
    }
}

/// Watches one query and feeds its notifications through the pipeline.
pub struct WatchManager {
    spec: Arc<ResolvedSpec>,
    operator: Arc<str>,
    connection: SharedConnection,
    pipeline: Arc<Pipeline>,
    config: WatchConfig,
    state: watch::Sender<WatchState>,
}

impl WatchManager {
    /// Creates a stopped watch manager.
    pub fn new(
        spec: Arc<ResolvedSpec>,
        operator: impl Into<Arc<str>>,
        connection: SharedConnection,
        pipeline: Arc<Pipeline>,
        config: WatchConfig,
    ) -> Self {
        let (state, _) = watch::channel(WatchState::Stopped);
        Self {
            spec,
            operator: operator.into(),
            connection,
            pipeline,
            config,
            state,
        }
    }

    /// Returns the watch id.
    pub fn id(&self) -> &str {
        self.spec.id()
    }

    /// Returns the controller spec being watched.
    pub fn spec(&self) -> &Arc<ResolvedSpec> {
        &self.spec
    }

    /// Returns a handle for observing the state.
    pub fn status(&self) -> WatchStatus {
        WatchStatus {
            id: self.spec.id_arc(),
            rx: self.state.subscribe(),
        }
    }

    fn set_state(&self, state: WatchState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::trace!(watch = %self.id(), ?previous, ?state, "watch state changed");
        }
    }

    /// Runs until `cancel` fires or the subscription fails more than
    /// `max_reconnect_attempts` times in a row.
    ///
    /// A stream that ends cleanly is resubscribed without counting as a
    /// failure. Cancellation lets the event being processed finish first.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), WatchError> {
        self.set_state(WatchState::Starting);
        let mut backoff = Backoff::new(&self.config);
        let mut failures: u32 = 0;

        loop {
            let subscribed = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.connection.watch(self.spec.query()) => result,
            };

            let failure = match subscribed {
                Ok(stream) => {
                    self.set_state(WatchState::Watching);
                    tracing::info!(watch = %self.id(), "watch subscribed");

                    match self.consume(stream, &cancel, &mut failures, &mut backoff).await {
                        StreamEnd::Cancelled => break,
                        StreamEnd::Closed => {
                            tracing::info!(watch = %self.id(), "watch stream ended, resubscribing");
                            None
                        }
                        StreamEnd::Failed(error) => Some(error),
                    }
                }
                Err(error) => Some(error),
            };

            if let Some(error) = failure {
                failures += 1;
                tracing::warn!(
                    watch = %self.id(),
                    attempt = failures,
                    error = %error,
                    "watch subscription failed"
                );

                if failures > self.config.max_reconnect_attempts {
                    self.set_state(WatchState::Stopped);
                    return Err(WatchError::SubscriptionFailed {
                        watch: self.id().to_string(),
                        attempts: failures,
                        source: error,
                    });
                }
            }

            self.set_state(WatchState::Reconnecting);
            let delay = backoff.next_delay();
            tracing::debug!(watch = %self.id(), ?delay, "waiting before resubscribing");

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!(watch = %self.id(), "watch stopped");
        self.set_state(WatchState::Stopped);
        Ok(())
    }

    async fn consume(
        &self,
        mut stream: WatchStream,
        cancel: &CancellationToken,
        failures: &mut u32,
        backoff: &mut Backoff,
    ) -> StreamEnd {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return StreamEnd::Cancelled,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(notification)) => {
                    *failures = 0;
                    backoff.reset();
                    self.handle(notification).await;
                }
                Some(Err(error)) => return StreamEnd::Failed(error),
                None => return StreamEnd::Closed,
            }
        }
    }

    /// Processes one notification on its own task and waits for it, so a
    /// panic inside a step or controller cannot take the watch down.
    async fn handle(&self, notification: WatchNotification) {
        let WatchNotification { action, resource } = notification;
        let name = resource.metadata.name.clone().unwrap_or_default();
        let span = tracing::info_span!("event", watch = %self.id(), %action, %name);

        let ctx = ActionContext::new(action, resource, self.operator.clone(), self.connection.clone())
            .with_controller(self.spec.controller().cloned());
        let pipeline = self.pipeline.clone();
        let connection = self.connection.clone();

        let task = tokio::spawn(
            async move { process_event(&pipeline, &connection, ctx).await }.instrument(span),
        );

        match task.await {
            Ok(outcome) => {
                if !outcome.delivery.is_success() {
                    tracing::warn!(
                        watch = %self.id(),
                        %name,
                        failures = outcome.delivery.failures.len(),
                        "some pending work was not delivered"
                    );
                }
            }
            Err(e) if e.is_panic() => {
                tracing::error!(watch = %self.id(), %action, %name, "event processing panicked");
            }
            Err(e) => {
                tracing::error!(watch = %self.id(), %action, %name, error = %e, "event processing task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::action::{Action, EventType};
    use crate::client::WatchQuery;
    use crate::testing::{resource, MemoryConnection};

    fn fast_config(max_reconnect_attempts: u32) -> WatchConfig {
        WatchConfig {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            max_reconnect_attempts,
        }
    }

    fn manager(connection: &MemoryConnection, pipeline: Pipeline, config: WatchConfig) -> WatchManager {
        let query = WatchQuery::new("v1", "ConfigMap").in_namespace("default");
        let spec = Arc::new(ResolvedSpec::new("v1/ConfigMap@default#0", query, None));
        WatchManager::new(spec, "test-operator", Arc::new(connection.clone()), Arc::new(pipeline), config)
    }

    fn query() -> WatchQuery {
        WatchQuery::new("v1", "ConfigMap").in_namespace("default")
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = Backoff::new(&WatchConfig {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            max_reconnect_attempts: 3,
        });

        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));

        for _ in 0..10 {
            assert!(backoff.next_delay() <= Duration::from_secs(1));
        }

        backoff.reset();
        assert!(backoff.next_delay() <= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_events_processed_in_order() {
        let connection = MemoryConnection::new();
        let feed = connection.feed(&query());
        let pipeline = Pipeline::builder()
            .function("record", serde_json::Value::Null, |ctx: ActionContext, _| async move {
                let reason = ctx.action().to_string();
                let name = ctx.resource().metadata.name.clone().unwrap_or_default();
                Ok(ctx.emit_event(EventType::Normal, reason, name))
            })
            .delegate()
            .build();
        let manager = Arc::new(manager(&connection, pipeline, fast_config(3)));

        for i in 0..5 {
            feed.send(Action::Modified, resource("v1", "ConfigMap", "default", &format!("cm-{i}")));
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let manager = manager.clone();
            let cancel = cancel.clone();
            async move { manager.run(cancel).await }
        });

        while connection.published_events().len() < 5 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        task.await.unwrap().unwrap();

        let names: Vec<_> = connection
            .published_events()
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(names, vec!["cm-0", "cm-1", "cm-2", "cm-3", "cm-4"]);
        assert_eq!(manager.status().state(), WatchState::Stopped);
    }

    #[tokio::test]
    async fn test_failing_event_does_not_stop_watch() {
        let connection = MemoryConnection::new();
        let feed = connection.feed(&query());
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let pipeline = Pipeline::builder()
            .function("maybe-fail", serde_json::Value::Null, move |ctx: ActionContext, _| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if ctx.resource().metadata.name.as_deref() == Some("bad") {
                        anyhow::bail!("bad resource");
                    }
                    if ctx.resource().metadata.name.as_deref() == Some("panic") {
                        panic!("step panicked");
                    }
                    Ok(ctx)
                }
            })
            .delegate()
            .build();
        let manager = Arc::new(manager(&connection, pipeline, fast_config(3)));

        feed.send(Action::Added, resource("v1", "ConfigMap", "default", "bad"));
        feed.send(Action::Added, resource("v1", "ConfigMap", "default", "panic"));
        feed.send(Action::Added, resource("v1", "ConfigMap", "default", "good"));

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let manager = manager.clone();
            let cancel = cancel.clone();
            async move { manager.run(cancel).await }
        });

        while seen.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(manager.status().state(), WatchState::Watching);

        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_gives_up_after_repeated_subscription_failures() {
        let connection = MemoryConnection::new();
        connection.fail_subscriptions(&query(), 10);
        let manager = manager(&connection, Pipeline::default_pipeline(), fast_config(2));

        let err = manager.run(CancellationToken::new()).await.unwrap_err();
        let WatchError::SubscriptionFailed { attempts, .. } = err;
        assert_eq!(attempts, 3);
        assert_eq!(connection.subscription_attempts(&query()), 3);
        assert_eq!(manager.status().state(), WatchState::Stopped);
    }

    #[tokio::test]
    async fn test_recovers_from_transient_failures() {
        let connection = MemoryConnection::new();
        connection.fail_subscriptions(&query(), 2);
        let feed = connection.feed(&query());
        let pipeline = Pipeline::builder()
            .function("record", serde_json::Value::Null, |ctx: ActionContext, _| async move {
                Ok(ctx.emit_event(EventType::Normal, "Seen", "seen"))
            })
            .delegate()
            .build();
        let manager = Arc::new(manager(&connection, pipeline, fast_config(2)));
        let mut status = manager.status();

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let manager = manager.clone();
            let cancel = cancel.clone();
            async move { manager.run(cancel).await }
        });

        assert!(status.wait_for(WatchState::Watching).await);
        feed.send(Action::Added, resource("v1", "ConfigMap", "default", "a"));
        while connection.published_events().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
        assert_eq!(connection.subscription_attempts(&query()), 3);
    }

    #[tokio::test]
    async fn test_process_event_delivers_after_failure() {
        let connection = MemoryConnection::new();
        let shared: SharedConnection = Arc::new(connection.clone());
        let pipeline = Pipeline::builder()
            .function("emit", serde_json::Value::Null, |ctx: ActionContext, _| async move {
                Ok(ctx.emit_event(EventType::Warning, "Early", "queued before failure"))
            })
            .function("boom", serde_json::Value::Null, |_ctx: ActionContext, _| async move {
                Err(anyhow::anyhow!("boom"))
            })
            .delegate()
            .build();

        let ctx = ActionContext::new(
            Action::Added,
            resource("v1", "ConfigMap", "default", "a"),
            "op",
            shared.clone(),
        );
        let outcome = process_event(&pipeline, &shared, ctx).await;

        assert!(outcome.error.is_some());
        assert_eq!(outcome.delivery.events_published, 1);
        assert_eq!(connection.published_events()[0].reason, "Early");
    }
}

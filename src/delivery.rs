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

//! Post-processing of queued events and callbacks.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;

use crate::action::PendingWork;
use crate::client::Connection;
use crate::supervisor::panic_message;

/// What failed while delivering pending work.
#[derive(Debug)]
pub enum DeliveryFailure {
    /// Publishing an event failed.
    Event {
        /// Event reason.
        reason: String,
        /// Error message.
        error: String,
    },
    /// A callback returned an error or panicked.
    Callback {
        /// Callback name.
        name: String,
        /// Error message.
        error: String,
    },
    /// A callback was not run because an earlier short-circuit callback failed.
    Skipped {
        /// Callback name.
        name: String,
    },
}

/// Outcome of delivering one context's pending work.
#[derive(Debug, Default)]
pub struct DeliveryReport {
    /// Number of events published.
    pub events_published: usize,
    /// Number of callbacks that succeeded.
    pub callbacks_run: usize,
    /// Every failure, in order.
    pub failures: Vec<DeliveryFailure>,
}

impl DeliveryReport {
    /// Returns true when everything was delivered.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Publishes every queued event, then runs every queued callback.
///
/// Each item is attempted independently and every failure is logged and
/// reported, including panics. The only exception is a callback marked short-circuit: when it
/// fails, the callbacks queued after it are skipped.
pub async fn deliver(connection: &dyn Connection, pending: PendingWork) -> DeliveryReport {
    let mut report = DeliveryReport::default();
    let PendingWork { events, callbacks } = pending;

    for event in &events {
        match connection.publish_event(event).await {
            Ok(()) => report.events_published += 1,
            Err(e) => {
                tracing::error!(
                    reason = %event.reason,
                    name = ?event.involved.name,
                    error = %e,
                    "failed to publish event"
                );
                report.failures.push(DeliveryFailure::Event {
                    reason: event.reason.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    let mut callbacks = callbacks.into_iter();
    while let Some(callback) = callbacks.next() {
        let name = callback.name().to_string();
        let short_circuit = callback.is_short_circuit();

        let outcome = AssertUnwindSafe(async move { callback.invoke().await })
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(anyhow::anyhow!(panic_message(panic.as_ref()))));

        match outcome {
            Ok(()) => report.callbacks_run += 1,
            Err(e) => {
                tracing::error!(callback = %name, error = %e, "deferred callback failed");
                report.failures.push(DeliveryFailure::Callback {
                    name,
                    error: format!("{e:#}"),
                });

                if short_circuit {
                    for skipped in callbacks.by_ref() {
                        tracing::warn!(callback = %skipped.name(), "skipping callback after short-circuit failure");
                        report.failures.push(DeliveryFailure::Skipped {
                            name: skipped.name().to_string(),
                        });
                    }
                }
            }
        }
    }

    report
}

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

//! Configuration structures for the operator runtime.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::WatchQuery;

/// Tunables for supervision, watches and the health server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    /// Supervision tree configuration.
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Watch manager configuration.
    #[serde(default)]
    pub watch: WatchConfig,

    /// Health server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Restart intensity and shutdown behaviour of the supervision tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorConfig {
    /// Maximum number of watch restarts tolerated within `restart_window`.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: usize,

    /// Sliding window for counting restarts.
    #[serde(default = "default_restart_window", with = "humantime_serde")]
    pub restart_window: Duration,

    /// The maximum time to wait for watches to drain on shutdown.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            restart_window: default_restart_window(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Reconnect behaviour of watch managers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchConfig {
    /// Delay before the first resubscription.
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Upper bound for the resubscription delay.
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,

    /// Consecutive failed subscriptions tolerated before the watch crashes.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

/// Health server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthConfig {
    /// Whether to serve health endpoints.
    #[serde(default = "default_health_enabled")]
    pub enabled: bool,

    /// The address to bind.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// The port to bind.
    #[serde(default = "default_health_port")]
    pub port: u16,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: default_health_enabled(),
            bind_address: default_bind_address(),
            port: default_health_port(),
        }
    }
}

/// One pipeline step in a configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepConfig {
    /// Built-in step name, or `delegate`.
    pub step: String,

    /// Static options for the step.
    #[serde(default)]
    pub options: serde_json::Value,
}

/// Configuration file of the `kube-operator` binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorFileConfig {
    /// Operator name.
    #[serde(default = "default_operator_name")]
    pub name: String,

    /// Event reporter; defaults to the operator name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reporter: Option<String>,

    /// Default namespace to watch.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Pipeline steps; the default pipeline is used when empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pipeline: Vec<StepConfig>,

    /// Resources to watch. A query without a namespace inherits the
    /// operator's watch namespace.
    #[serde(default)]
    pub watches: Vec<WatchQuery>,

    /// Runtime tunables.
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl Default for OperatorFileConfig {
    fn default() -> Self {
        Self {
            name: default_operator_name(),
            reporter: None,
            namespace: default_namespace(),
            pipeline: Vec::new(),
            watches: Vec::new(),
            runtime: RuntimeConfig::default(),
        }
    }
}

fn default_max_restarts() -> usize {
    5
}

fn default_restart_window() -> Duration {
    Duration::from_secs(60)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(500)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(30)
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_health_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_health_port() -> u16 {
    8081
}

fn default_operator_name() -> String {
    "kube-operator".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

/// Module for duration serialization/deserialization with human-readable format.
mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.supervisor.max_restarts, 5);
        assert_eq!(config.watch.initial_backoff, Duration::from_millis(500));
        assert!(config.health.enabled);
    }

    #[test]
    fn test_deserialize_operator_file() {
        let yaml = r#"
name: widget-operator
namespace: widgets
pipeline:
  - step: filter_actions
    options:
      actions: [Added, Modified]
  - step: delegate
watches:
  - apiVersion: example.com/v1
    kind: Widget
runtime:
  supervisor:
    maxRestarts: 3
    restartWindow: 2m
  watch:
    initialBackoff: 250ms
"#;

        let config: OperatorFileConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.name, "widget-operator");
        assert_eq!(config.pipeline.len(), 2);
        assert_eq!(config.pipeline[1].step, "delegate");
        assert_eq!(config.watches[0].kind, "Widget");
        assert_eq!(config.runtime.supervisor.max_restarts, 3);
        assert_eq!(config.runtime.supervisor.restart_window, Duration::from_secs(120));
        assert_eq!(config.runtime.watch.initial_backoff, Duration::from_millis(250));
        assert_eq!(config.runtime.watch.max_backoff, Duration::from_secs(30));
    }

    #[test]
    fn test_durations_round_trip_as_text() {
        let yaml = serde_yaml::to_string(&SupervisorConfig::default()).unwrap();
        assert!(yaml.contains("restartWindow: 1m"));
    }
}

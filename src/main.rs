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

//! kube-operator - runs an operator that records watched changes as events.
//!
//! Every query listed in the configuration file is watched and each change
//! is handed to the built-in `event-recorder` controller.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kube_operator_runtime::config::OperatorFileConfig;
use kube_operator_runtime::health::{HealthServer, WatchHealthChecker};
use kube_operator_runtime::operator::{ControllerSpec, OperatorDefinition, StartOptions};
use kube_operator_runtime::recorder::{EventRecorder, EVENT_RECORDER};
use kube_operator_runtime::{steps, KubeConnection};

/// Kubernetes operator runtime
///
/// Watches the configured resources, runs every change through the operator
/// pipeline and records it as a Kubernetes Event on the resource.
#[derive(Parser, Debug)]
#[command(name = "kube-operator")]
#[command(version)]
#[command(about = "Kubernetes operator runtime", long_about = None)]
struct Args {
    /// Path to the kubeconfig file
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Namespace to watch, overriding the configuration file
    #[arg(short, long)]
    namespace: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    log_json: bool,

    /// Port for the health check server
    #[arg(long)]
    healthz_bind_port: Option<u16>,

    /// Disable the health check server
    #[arg(long)]
    no_healthz: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level, args.log_json)?;

    info!(version = kube_operator_runtime::VERSION, "starting kube-operator");

    let config = load_config(&args).await?;
    let client = create_client(args.kubeconfig.as_ref()).await?;
    let reporter = config.reporter.clone().unwrap_or_else(|| config.name.clone());
    let connection = Arc::new(KubeConnection::new(client, reporter));

    let watches = config.watches.clone();
    let operator = OperatorDefinition::builder(config.name.clone())
        .default_watch_namespace(config.namespace.clone())
        .pipeline(steps::from_config(&config.pipeline)?)
        .controller(EVENT_RECORDER, EventRecorder)
        .controller_specs(move |namespace, _args| {
            Ok(watches
                .iter()
                .map(|query| {
                    let mut query = query.clone();
                    query.namespace.get_or_insert_with(|| namespace.to_string());
                    ControllerSpec::new(query).controller(EVENT_RECORDER)
                })
                .collect())
        })
        .runtime(config.runtime.clone())
        .build()?;

    let handle = operator.start(connection, StartOptions::default())?;

    let health_shutdown = CancellationToken::new();
    let health_task = if config.runtime.health.enabled {
        let server = HealthServer::from_config(&config.runtime.health);
        server
            .registry()
            .register(Arc::new(WatchHealthChecker::new(
                "watches",
                handle.statuses().to_vec(),
            )))
            .await;
        Some(server.spawn(health_shutdown.clone()))
    } else {
        None
    };

    let shutdown_token = handle.shutdown_token();
    tokio::spawn(async move {
        match wait_for_shutdown().await {
            Ok(()) => shutdown_token.cancel(),
            Err(e) => error!("failed to install signal handlers: {:#}", e),
        }
    });

    let result = handle.wait().await;

    health_shutdown.cancel();
    if let Some(task) = health_task {
        match task.await {
            Ok(Err(e)) => error!("health server failed: {:#}", e),
            Err(e) => error!("health server task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }

    if let Err(e) = result {
        error!("operator failed: {:#}", e);
        return Err(e.into());
    }

    info!("kube-operator exited successfully");
    Ok(())
}

/// Initializes logging based on the provided level and format.
fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(
            level
                .parse()
                .with_context(|| format!("invalid log level: {level}"))?,
        )
        .from_env_lossy();

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty())
            .init();
    }
    Ok(())
}

/// Loads the configuration file, then applies command-line overrides.
async fn load_config(args: &Args) -> anyhow::Result<OperatorFileConfig> {
    let mut config = if let Some(config_path) = &args.config {
        let content = tokio::fs::read_to_string(config_path)
            .await
            .with_context(|| format!("failed to read config file: {:?}", config_path))?;

        serde_yaml::from_str::<OperatorFileConfig>(&content)
            .with_context(|| format!("failed to parse config file: {:?}", config_path))?
    } else {
        OperatorFileConfig::default()
    };

    if let Some(namespace) = &args.namespace {
        config.namespace = namespace.clone();
    }
    if let Some(port) = args.healthz_bind_port {
        config.runtime.health.port = port;
    }
    if args.no_healthz {
        config.runtime.health.enabled = false;
    }

    info!(
        operator = %config.name,
        namespace = %config.namespace,
        watches = config.watches.len(),
        "configuration loaded"
    );
    Ok(config)
}

/// Creates a Kubernetes client from a kubeconfig path, or infers one.
async fn create_client(kubeconfig: Option<&PathBuf>) -> anyhow::Result<kube::Client> {
    use kube::config::{KubeConfigOptions, Kubeconfig};
    use kube::Config;

    let kube_config = if let Some(kubeconfig_path) = kubeconfig {
        let kubeconfig = Kubeconfig::read_from(kubeconfig_path)
            .with_context(|| format!("failed to read kubeconfig from: {:?}", kubeconfig_path))?;
        Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .with_context(|| format!("failed to load kubeconfig from: {:?}", kubeconfig_path))?
    } else {
        Config::infer().await.context("failed to load kubeconfig")?
    };

    Ok(kube::Client::try_from(kube_config)?)
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() -> anyhow::Result<()> {
    use tokio::signal;

    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .context("failed to install SIGINT handler")?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
            }
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.context("failed to listen for Ctrl+C")?;
        info!("received Ctrl+C, shutting down");
    }

    Ok(())
}

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

//! configmap-controller - a small operator built on kube-operator-runtime
//!
//! Watches ConfigMaps and records an event every time one changes. Serves as
//! a runnable example of wiring an informer, a factory-built controller and
//! the controller manager together.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::watcher;
use kube::{Api, Client};
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kube_operator_runtime::config::ControllerManagerConfig;
use kube_operator_runtime::controller::CancellationToken;
use kube_operator_runtime::controller_manager::ControllerManager;
use kube_operator_runtime::errors::SyncError;
use kube_operator_runtime::events::LoggingRecorder;
use kube_operator_runtime::factory::Factory;
use kube_operator_runtime::informer::Informer;
use kube_operator_runtime::kube_informer::WatchInformer;
use kube_operator_runtime::sync_context::{SyncContext, DEFAULT_QUEUE_KEY};

const CONTROLLER_NAME: &str = "ConfigMapController";

/// ConfigMap controller
///
/// Watches ConfigMaps through the apiserver and reports every change as an
/// event. Periodic resyncs summarize the cached state.
#[derive(Parser, Debug)]
#[command(name = "configmap-controller")]
#[command(version)]
#[command(about = "Example operator built on kube-operator-runtime", long_about = None)]
struct Args {
    /// Path to the kubeconfig file
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    log_json: bool,

    /// Number of concurrent workers
    #[arg(long)]
    workers: Option<usize>,

    /// How often to resync regardless of events, e.g. "5m"
    #[arg(long, value_parser = parse_duration)]
    resync_interval: Option<Duration>,

    /// Maximum time to wait for the informer cache, e.g. "2m"
    #[arg(long, value_parser = parse_duration)]
    cache_sync_timeout: Option<Duration>,

    /// Namespace to watch (all namespaces when omitted)
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,
}

fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    humantime::parse_duration(s).map_err(|e| anyhow::anyhow!("invalid duration: {}", e))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level, args.log_json)?;

    info!("starting {}", CONTROLLER_NAME);

    let config = load_config(args)?;
    info!(
        workers = config.workers,
        namespace = config.namespace.as_deref().unwrap_or("<all>"),
        resync = %humantime::format_duration(config.resync_interval),
        "configuration loaded"
    );

    let client = create_client(&config).await?;

    let config_maps: Api<ConfigMap> = match &config.namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    };
    let informer = Arc::new(WatchInformer::new(config_maps, watcher::Config::default()));

    let controller = build_controller(&config, client, Arc::clone(&informer));

    let mut manager = ControllerManager::new(&config);
    manager.add_controller(Arc::new(controller), config.workers);

    let shutdown_token = manager.shutdown_token();
    let informer_token = shutdown_token.child_token();
    let informer_task = tokio::spawn({
        let informer = Arc::clone(&informer);
        async move { informer.run(informer_token).await }
    });

    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown().await {
            error!("signal handling failed: {:#}", e);
        }
        shutdown_token.cancel();
    });

    let result = manager.run().await;
    manager.shutdown();
    informer_task.await.context("informer task failed")?;

    if let Err(e) = result {
        error!("controller failed: {:#}", e);
        return Err(e.into());
    }

    info!("{} exited successfully", CONTROLLER_NAME);
    Ok(())
}

fn build_controller(
    config: &ControllerManagerConfig,
    client: Client,
    informer: Arc<WatchInformer<ConfigMap>>,
) -> kube_operator_runtime::BaseController {
    let sync_context = SyncContext::with_rate_limiter(
        CONTROLLER_NAME,
        Arc::new(LoggingRecorder::new(CONTROLLER_NAME)),
        config.rate_limiter.build(),
    );

    let cache = Arc::clone(&informer);
    let mut factory = Factory::new()
        .with_sync(move |cancel, ctx| sync_config_map(Arc::clone(&cache), cancel, ctx))
        .with_sync_context(sync_context)
        .with_queued_objects()
        .with_informers([informer as Arc<dyn Informer>])
        .with_precondition(move |_| {
            let client = client.clone();
            async move {
                let version = client
                    .apiserver_version()
                    .await
                    .context("apiserver is not reachable")?;
                debug!(version = %version.git_version, "apiserver reachable");
                Ok::<_, anyhow::Error>(true)
            }
        })
        .resync_every(config.resync_interval);

    if let Some(timeout) = config.cache_sync_timeout {
        factory = factory.with_cache_sync_timeout(timeout);
    }

    factory.to_controller(
        CONTROLLER_NAME,
        Arc::new(LoggingRecorder::new(CONTROLLER_NAME)),
    )
}

async fn sync_config_map(
    cache: Arc<WatchInformer<ConfigMap>>,
    _cancel: CancellationToken,
    ctx: SyncContext,
) -> Result<(), SyncError> {
    if ctx.queue_key() == DEFAULT_QUEUE_KEY {
        ctx.recorder().event(
            "Resync",
            &format!("{} ConfigMaps in cache", cache.len()),
        );
        return Ok(());
    }

    let Some(config_map) = ctx
        .queue_object()
        .and_then(|obj| obj.downcast_ref::<ConfigMap>())
    else {
        debug!(key = %ctx.queue_key(), "no object queued with key, skipping");
        return Ok(());
    };

    if config_map.metadata.deletion_timestamp.is_some() {
        ctx.recorder()
            .event("ConfigMapDeleting", &format!("{} is being deleted", ctx.queue_key()));
        return Ok(());
    }

    let keys = config_map.data.as_ref().map_or(0, |data| data.len())
        + config_map.binary_data.as_ref().map_or(0, |data| data.len());
    ctx.recorder().event(
        "ConfigMapObserved",
        &format!(
            "{} at resourceVersion {} has {} keys",
            ctx.queue_key(),
            config_map.metadata.resource_version.as_deref().unwrap_or("<none>"),
            keys
        ),
    );
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

/// Loads the configuration from file, then applies command-line overrides.
fn load_config(mut args: Args) -> anyhow::Result<ControllerManagerConfig> {
    let mut config = match args.config.take() {
        Some(path) => ControllerManagerConfig::from_file(&path)
            .with_context(|| format!("failed to load config file: {:?}", path))?,
        None => ControllerManagerConfig::default(),
    };

    if let Some(kubeconfig) = args.kubeconfig {
        config.kubeconfig = Some(kubeconfig);
    }
    if let Some(namespace) = args.namespace {
        config.namespace = Some(namespace);
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(interval) = args.resync_interval {
        config.resync_interval = interval;
    }
    if let Some(timeout) = args.cache_sync_timeout {
        config.cache_sync_timeout = Some(timeout);
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Creates a Kubernetes client from the configuration.
async fn create_client(config: &ControllerManagerConfig) -> anyhow::Result<Client> {
    use kube::config::{KubeConfigOptions, Kubeconfig};

    let kube_config = if let Some(kubeconfig_path) = &config.kubeconfig {
        let kubeconfig = Kubeconfig::read_from(kubeconfig_path)
            .with_context(|| format!("failed to read kubeconfig from: {:?}", kubeconfig_path))?;
        kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .with_context(|| format!("failed to load kubeconfig from: {:?}", kubeconfig_path))?
    } else {
        kube::Config::infer()
            .await
            .context("failed to load kubeconfig")?
    };

    Client::try_from(kube_config).context("failed to create kubernetes client")
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
        signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl+C")?;
        info!("received Ctrl+C, shutting down");
    }

    Ok(())
}

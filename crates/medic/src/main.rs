//! KubeMedic - autonomous remediation controller
//!
//! Polls SelfRemediationPolicies, applies temporary scaling remediations when
//! their conditions hold, reverts them after the configured window, and serves
//! the policy admission webhook alongside health and metrics endpoints.

use anyhow::Result;
use clap::Parser;
use medic_lib::{
    admission::{webhook::WebhookState, PolicyValidator},
    cluster::{ClusterStore, KubeEventSink, KubeStore},
    controller::{Controller, ControllerConfig},
    evaluator::PolicyEvaluator,
    executor::{ActionExecutor, HookClient},
    health::{components, HealthRegistry},
    observability::StructuredLogger,
    reversion::ReversionScheduler,
    server::{self, AppState},
    tracker::StateTracker,
    usage::{KubeMetricsSource, MetricsGateway},
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

const MEDIC_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "kubemedic", version, about)]
struct Cli {
    /// Optional configuration file; KUBEMEDIC_* environment variables take precedence
    #[arg(short, long, env = "KUBEMEDIC_CONFIG_FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let config = config::MedicConfig::load(cli.config.as_deref())?;
    info!(
        api_port = config.api_port,
        poll_interval_secs = config.poll_interval_secs,
        "KubeMedic configured"
    );

    let client = kube::Client::try_default().await?;

    let health_registry = HealthRegistry::new();
    health_registry.register(components::CONTROLLER).await;

    let logger = StructuredLogger::new(&config.reporter);

    // Engine wiring
    let store: Arc<dyn ClusterStore> = Arc::new(KubeStore::new(client.clone()));
    let events = Arc::new(KubeEventSink::new(client.clone(), &config.reporter));
    let tracker = Arc::new(StateTracker::new());
    let reversions = ReversionScheduler::with_logger(store.clone(), logger.clone());
    let executor = Arc::new(
        ActionExecutor::new(store.clone(), events, tracker.clone(), reversions)
            .with_hooks(HookClient::new(config.hook_timeout()))
            .with_logger(logger.clone()),
    );
    let gateway = MetricsGateway::with_interval(
        Arc::new(KubeMetricsSource::new(client.clone())),
        config.sample_interval(),
    )
    .with_health(health_registry.clone());
    let evaluator = Arc::new(PolicyEvaluator::new(store.clone(), gateway, executor));
    let controller = Controller::new(
        store.clone(),
        evaluator,
        tracker,
        health_registry.clone(),
        ControllerConfig {
            poll_interval: config.poll_interval(),
        },
    );

    let webhook = WebhookState::new(Arc::new(PolicyValidator::new(store)))
        .with_logger(logger.clone())
        .with_health(health_registry.clone());
    let app_state = Arc::new(AppState::new(health_registry.clone(), webhook));

    let shutdown = CancellationToken::new();
    let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    let api_handle = tokio::spawn(server::serve(addr, app_state, shutdown.clone()));
    let controller_handle = tokio::spawn(controller.run(shutdown.clone()));

    health_registry.set_ready(true).await;
    logger.log_startup(MEDIC_VERSION, config.poll_interval_secs);

    let reason = shutdown_signal().await;
    logger.log_shutdown(reason);
    health_registry.set_ready(false).await;
    shutdown.cancel();

    if let Err(e) = controller_handle.await {
        error!(error = %e, "Controller task failed");
    }
    match api_handle.await {
        Ok(Err(e)) => error!(error = %e, "API server failed"),
        Err(e) => error!(error = %e, "API server task failed"),
        Ok(Ok(())) => {}
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT received",
                _ = sigterm.recv() => "SIGTERM received",
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT received"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT received"
    }
}

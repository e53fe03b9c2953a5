//! HTTP surface: health checks, Prometheus metrics and the admission endpoint

use crate::admission::webhook::{self, WebhookState};
use crate::health::{components, ComponentStatus, HealthRegistry};
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub webhook: WebhookState,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, webhook: WebhookState) -> Self {
        Self {
            health_registry,
            webhook,
        }
    }
}

/// 200 while healthy or degraded, 503 when unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            Vec::new(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    let admission = webhook::router(state.webhook.clone());

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
        .merge(admission)
}

/// Serve until `shutdown` is cancelled
///
/// Reports the `webhook` component healthy once listening and unhealthy if the
/// listener fails.
pub async fn serve(
    addr: SocketAddr,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let health = state.health_registry.clone();
    let app = create_router(state);

    info!(addr = %addr, "Starting API server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            health
                .set_unhealthy(components::WEBHOOK, format!("bind {} failed: {}", addr, e))
                .await;
            return Err(e.into());
        }
    };
    health.set_healthy(components::WEBHOOK).await;

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        health
            .set_unhealthy(components::WEBHOOK, format!("listener failed: {}", e))
            .await;
        return Err(e.into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::PolicyValidator;
    use crate::cluster::InMemoryCluster;

    fn state() -> Arc<AppState> {
        let webhook = WebhookState::new(Arc::new(PolicyValidator::new(Arc::new(
            InMemoryCluster::new(),
        ))));
        Arc::new(AppState::new(HealthRegistry::new(), webhook))
    }

    #[tokio::test]
    async fn test_listening_marks_webhook_healthy() {
        let state = state();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        serve(([127, 0, 0, 1], 0).into(), state.clone(), shutdown)
            .await
            .unwrap();

        let health = state.health_registry.health().await;
        assert_eq!(
            health.components[components::WEBHOOK].status,
            ComponentStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_bind_failure_marks_webhook_unhealthy() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();
        let state = state();

        let result = serve(addr, state.clone(), CancellationToken::new()).await;

        assert!(result.is_err());
        state.health_registry.set_ready(true).await;
        let readiness = state.health_registry.readiness().await;
        assert_eq!(readiness.reason.as_deref(), Some("unhealthy: webhook"));
    }
}

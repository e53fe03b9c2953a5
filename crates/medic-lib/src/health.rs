//! Component health behind `/healthz` and `/readyz`
//!
//! Each component reports its own state as it works:
//!
//! - `controller`: every poll cycle, degraded while policies cannot be listed
//! - `webhook`: the API listener lifecycle, degraded while admission cannot
//!   read cluster state
//! - `metrics_source`: every usage sample, degraded while the metrics API fails
//!
//! A component appears in the report once it has reported at least once.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Working with reduced function; liveness still passes
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        *self != ComponentStatus::Unhealthy
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Unix seconds of the last report
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn reported(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn healthy() -> Self {
        Self::reported(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::reported(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::reported(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst status across components; healthy when nothing has reported
    pub fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Names components report under
pub mod components {
    /// Policy poll loop
    pub const CONTROLLER: &str = "controller";
    /// API listener serving admission reviews
    pub const WEBHOOK: &str = "webhook";
    /// Usage API queried by the metrics gateway
    pub const METRICS_SOURCE: &str = "metrics_source";
}

/// Shared, cloneable health state
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    ready: Arc<RwLock<bool>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component as healthy
    pub async fn register(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn update(&self, name: &str, health: ComponentHealth) {
        self.components.write().await.insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let status = HealthResponse::compute_status(&components);
        HealthResponse { status, components }
    }

    /// Ready once startup finished and no component is unhealthy
    pub async fn readiness(&self) -> ReadinessResponse {
        if !*self.ready.read().await {
            return ReadinessResponse {
                ready: false,
                reason: Some("controller not started".to_string()),
            };
        }

        let components = self.components.read().await;
        let mut unhealthy: Vec<&str> = components
            .iter()
            .filter(|(_, health)| !health.status.is_operational())
            .map(|(name, _)| name.as_str())
            .collect();
        if unhealthy.is_empty() {
            return ReadinessResponse {
                ready: true,
                reason: None,
            };
        }

        unhealthy.sort_unstable();
        ReadinessResponse {
            ready: false,
            reason: Some(format!("unhealthy: {}", unhealthy.join(", "))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_nothing_reported_is_healthy() {
        let registry = HealthRegistry::new();
        let health = registry.health().await;

        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());
    }

    #[tokio::test]
    async fn test_degraded_controller_keeps_status_operational() {
        let registry = HealthRegistry::new();
        registry.register(components::CONTROLLER).await;
        registry.register(components::WEBHOOK).await;

        registry
            .set_degraded(components::CONTROLLER, "policy list failed")
            .await;

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Degraded);
        assert!(health.status.is_operational());
        assert_eq!(
            health.components[components::CONTROLLER].message.as_deref(),
            Some("policy list failed")
        );
    }

    #[tokio::test]
    async fn test_unhealthy_outranks_degraded() {
        let registry = HealthRegistry::new();
        registry
            .set_degraded(components::METRICS_SOURCE, "metrics API timeout")
            .await;
        registry
            .set_unhealthy(components::WEBHOOK, "listener closed")
            .await;

        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_readiness_names_unhealthy_components() {
        let registry = HealthRegistry::new();
        registry.register(components::CONTROLLER).await;
        assert_eq!(
            registry.readiness().await.reason.as_deref(),
            Some("controller not started")
        );

        registry.set_ready(true).await;
        assert!(registry.readiness().await.ready);

        registry
            .set_unhealthy(components::WEBHOOK, "listener closed")
            .await;
        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(readiness.reason.as_deref(), Some("unhealthy: webhook"));
    }
}

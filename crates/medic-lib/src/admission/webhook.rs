//! Validating admission endpoint for SelfRemediationPolicy writes

use super::{AdmissionError, PolicyValidator};
use crate::crd::SelfRemediationPolicy;
use crate::health::{components, HealthRegistry};
use crate::observability::{MedicMetrics, StructuredLogger};
use axum::{extract::State, routing::post, Json, Router};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::core::DynamicObject;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Path the API server posts AdmissionReviews to
pub const VALIDATE_PATH: &str = "/validate";

#[derive(Clone)]
pub struct WebhookState {
    validator: Arc<PolicyValidator>,
    metrics: MedicMetrics,
    logger: StructuredLogger,
    health: Option<HealthRegistry>,
}

impl WebhookState {
    pub fn new(validator: Arc<PolicyValidator>) -> Self {
        Self {
            validator,
            metrics: MedicMetrics::new(),
            logger: StructuredLogger::default(),
            health: None,
        }
    }

    /// Report `webhook` degraded while reviews cannot read cluster state
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Decide one admission request
    pub async fn review(&self, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
        let response = AdmissionResponse::from(request);
        if matches!(request.operation, Operation::Delete | Operation::Connect) {
            return response;
        }

        let verdict = match decode_policy(request) {
            Ok(policy) => {
                let verdict = self.validator.validate(&policy).await;
                self.report(&verdict).await;
                verdict.map_err(|e| e.to_string())
            }
            Err(reason) => Err(reason),
        };

        self.metrics.inc_admission(verdict.is_ok());
        match verdict {
            Ok(()) => {
                debug!(policy = %request.name, operation = ?request.operation, "Policy admitted");
                response
            }
            Err(reason) => {
                self.logger.log_admission_denied(
                    &format!("{}/{}", request.namespace.as_deref().unwrap_or_default(), request.name),
                    &format!("{:?}", request.operation),
                    &reason,
                );
                response.deny(reason)
            }
        }
    }

    async fn report(&self, verdict: &Result<(), AdmissionError>) {
        let Some(health) = &self.health else {
            return;
        };
        match verdict {
            Err(e) if e.is_cluster_failure() => {
                health
                    .set_degraded(components::WEBHOOK, format!("cluster read failed: {}", e))
                    .await
            }
            _ => health.set_healthy(components::WEBHOOK).await,
        }
    }
}

/// Decode the candidate policy, filling the namespace from the request
fn decode_policy(request: &AdmissionRequest<DynamicObject>) -> Result<SelfRemediationPolicy, String> {
    let object = request
        .object
        .as_ref()
        .ok_or_else(|| "admission request carries no object".to_string())?;
    let value = serde_json::to_value(object).map_err(|e| format!("invalid policy: {}", e))?;
    let mut policy: SelfRemediationPolicy =
        serde_json::from_value(value).map_err(|e| format!("invalid policy: {}", e))?;

    if policy.namespace().is_none() {
        policy.metadata.namespace = request.namespace.clone();
    }
    Ok(policy)
}

async fn validate_handler(
    State(state): State<WebhookState>,
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Malformed admission review");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };
    Json(state.review(&request).await.into_review())
}

/// Router serving the admission endpoint
pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route(VALIDATE_PATH, post(validate_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryCluster;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn review(operation: &str, namespace: &str, spec: Value) -> Value {
        json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": {"group": "remediation.kubemedic.io", "version": "v1alpha1", "kind": "SelfRemediationPolicy"},
                "resource": {"group": "remediation.kubemedic.io", "version": "v1alpha1", "resource": "selfremediationpolicies"},
                "name": "web-policy",
                "namespace": namespace,
                "operation": operation,
                "userInfo": {"username": "admin"},
                "dryRun": false,
                "object": {
                    "apiVersion": "remediation.kubemedic.io/v1alpha1",
                    "kind": "SelfRemediationPolicy",
                    "metadata": {"name": "web-policy"},
                    "spec": spec
                }
            }
        })
    }

    fn scale_up_spec(ceiling: i32) -> Value {
        json!({
            "rules": [{
                "name": "cpu",
                "conditions": [{"type": "CPUUsage", "threshold": "80%", "duration": "1m"}],
                "actions": [{
                    "type": "ScaleUp",
                    "target": {"kind": "Deployment", "name": "web"},
                    "scalingParams": {"temporaryMaxReplicas": ceiling, "scalingDuration": "10m"}
                }]
            }]
        })
    }

    fn app() -> Router {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.insert_deployment("shop", "web", 2);
        router(WebhookState::new(Arc::new(PolicyValidator::new(cluster))))
    }

    async fn post_review(app: Router, body: Value) -> Value {
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(VALIDATE_PATH)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_valid_policy_allowed() {
        let body = post_review(app(), review("CREATE", "shop", scale_up_spec(3))).await;

        assert_eq!(body["response"]["allowed"], true);
        assert_eq!(body["response"]["uid"], "705ab4f5-6393-11e8-b7cc-42010a800002");
    }

    #[tokio::test]
    async fn test_denial_carries_stage_message() {
        let body = post_review(app(), review("UPDATE", "kube-system", scale_up_spec(3))).await;

        assert_eq!(body["response"]["allowed"], false);
        assert_eq!(
            body["response"]["status"]["message"],
            "namespace kube-system is not allowed for remediation policies"
        );
    }

    #[tokio::test]
    async fn test_delete_is_always_allowed() {
        let body = post_review(app(), review("DELETE", "kube-system", scale_up_spec(50))).await;

        assert_eq!(body["response"]["allowed"], true);
    }

    #[tokio::test]
    async fn test_undecodable_policy_denied() {
        let body = post_review(app(), review("CREATE", "shop", json!({"rules": "nope"}))).await;

        assert_eq!(body["response"]["allowed"], false);
        assert!(body["response"]["status"]["message"]
            .as_str()
            .unwrap()
            .starts_with("invalid policy"));
    }

    #[tokio::test]
    async fn test_cluster_read_failure_degrades_webhook_health() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.insert_deployment("shop", "web", 2);
        let health = HealthRegistry::new();
        let app = router(
            WebhookState::new(Arc::new(PolicyValidator::new(cluster.clone())))
                .with_health(health.clone()),
        );

        cluster.set_fail_reads(true);
        let body = post_review(app.clone(), review("CREATE", "shop", scale_up_spec(3))).await;
        assert_eq!(body["response"]["allowed"], false);
        let report = health.health().await;
        let webhook = &report.components[components::WEBHOOK];
        assert_eq!(webhook.status, crate::health::ComponentStatus::Degraded);
        assert!(webhook
            .message
            .as_deref()
            .unwrap()
            .contains("injected read failure"));

        cluster.set_fail_reads(false);
        let body = post_review(app.clone(), review("CREATE", "shop", scale_up_spec(3))).await;
        assert_eq!(body["response"]["allowed"], true);

        // Policy denials are not a health problem
        post_review(app, review("CREATE", "kube-system", scale_up_spec(3))).await;
        assert_eq!(
            health.health().await.components[components::WEBHOOK].status,
            crate::health::ComponentStatus::Healthy
        );
    }
}

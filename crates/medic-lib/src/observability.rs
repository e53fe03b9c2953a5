//! Observability infrastructure for the remediation controller
//!
//! Provides:
//! - Prometheus metrics (evaluations, action outcomes, reversions, admission decisions)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for policy evaluation latency (in seconds)
const EVALUATION_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<MedicMetricsInner> = OnceLock::new();

struct MedicMetricsInner {
    policy_evaluations: IntCounter,
    evaluation_errors: IntCounter,
    evaluation_latency_seconds: Histogram,
    condition_errors: IntCounter,
    actions: IntCounterVec,
    reversions_scheduled: IntCounter,
    reversions_completed: IntCounter,
    reversions_failed: IntCounter,
    admission_decisions: IntCounterVec,
    tracked_remediations: IntGauge,
    pending_reversions: IntGauge,
}

impl MedicMetricsInner {
    fn new() -> Self {
        Self {
            policy_evaluations: register_int_counter!(
                "kubemedic_policy_evaluations_total",
                "Policy evaluations started"
            )
            .expect("Failed to register policy_evaluations"),

            evaluation_errors: register_int_counter!(
                "kubemedic_policy_evaluation_errors_total",
                "Policy evaluations aborted by an error"
            )
            .expect("Failed to register evaluation_errors"),

            evaluation_latency_seconds: register_histogram!(
                "kubemedic_policy_evaluation_latency_seconds",
                "Time spent evaluating one policy, including sustain windows",
                EVALUATION_BUCKETS.to_vec()
            )
            .expect("Failed to register evaluation_latency_seconds"),

            condition_errors: register_int_counter!(
                "kubemedic_condition_errors_total",
                "Conditions that could not be evaluated"
            )
            .expect("Failed to register condition_errors"),

            actions: register_int_counter_vec!(
                "kubemedic_actions_total",
                "Remediation actions by type and outcome",
                &["action_type", "outcome"]
            )
            .expect("Failed to register actions"),

            reversions_scheduled: register_int_counter!(
                "kubemedic_reversions_scheduled_total",
                "Reversions scheduled"
            )
            .expect("Failed to register reversions_scheduled"),

            reversions_completed: register_int_counter!(
                "kubemedic_reversions_completed_total",
                "Reversions that finished without error"
            )
            .expect("Failed to register reversions_completed"),

            reversions_failed: register_int_counter!(
                "kubemedic_reversions_failed_total",
                "Reversions abandoned after an error"
            )
            .expect("Failed to register reversions_failed"),

            admission_decisions: register_int_counter_vec!(
                "kubemedic_admission_decisions_total",
                "Admission reviews by verdict",
                &["verdict"]
            )
            .expect("Failed to register admission_decisions"),

            tracked_remediations: register_int_gauge!(
                "kubemedic_tracked_remediations",
                "Remediations currently held by the state tracker"
            )
            .expect("Failed to register tracked_remediations"),

            pending_reversions: register_int_gauge!(
                "kubemedic_pending_reversions",
                "Reversions waiting for their timer"
            )
            .expect("Failed to register pending_reversions"),
        }
    }
}

/// Controller metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share the same
/// underlying metrics.
#[derive(Clone)]
pub struct MedicMetrics {
    _private: (),
}

impl Default for MedicMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MedicMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(MedicMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &MedicMetricsInner {
        GLOBAL_METRICS.get_or_init(MedicMetricsInner::new)
    }

    pub fn inc_policy_evaluations(&self) {
        self.inner().policy_evaluations.inc();
    }

    pub fn inc_evaluation_errors(&self) {
        self.inner().evaluation_errors.inc();
    }

    pub fn observe_evaluation_latency(&self, duration_secs: f64) {
        self.inner().evaluation_latency_seconds.observe(duration_secs);
    }

    pub fn inc_condition_errors(&self) {
        self.inner().condition_errors.inc();
    }

    /// Count an action outcome, e.g. ("ScaleUp", "applied")
    pub fn inc_action(&self, action_type: &str, outcome: &str) {
        self.inner()
            .actions
            .with_label_values(&[action_type, outcome])
            .inc();
    }

    pub fn inc_reversions_scheduled(&self) {
        self.inner().reversions_scheduled.inc();
    }

    pub fn inc_reversions_completed(&self) {
        self.inner().reversions_completed.inc();
    }

    pub fn inc_reversions_failed(&self) {
        self.inner().reversions_failed.inc();
    }

    pub fn inc_admission(&self, allowed: bool) {
        let verdict = if allowed { "allowed" } else { "denied" };
        self.inner()
            .admission_decisions
            .with_label_values(&[verdict])
            .inc();
    }

    pub fn set_tracked_remediations(&self, count: i64) {
        self.inner().tracked_remediations.set(count);
    }

    pub fn set_pending_reversions(&self, count: i64) {
        self.inner().pending_reversions.set(count);
    }
}

/// Structured logger for remediation events
#[derive(Clone, Debug)]
pub struct StructuredLogger {
    instance: String,
}

impl Default for StructuredLogger {
    fn default() -> Self {
        Self::new("kubemedic")
    }
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    /// Log a mutation written to a target
    pub fn log_remediation_applied(
        &self,
        policy: &str,
        action_type: &str,
        target: &str,
        field: &str,
        original: i32,
        applied: i32,
        backup: &str,
    ) {
        info!(
            event = "remediation_applied",
            instance = %self.instance,
            policy = %policy,
            action_type = %action_type,
            resource = %target,
            field = %field,
            original = original,
            applied = applied,
            backup = %backup,
            "Remediation applied"
        );
    }

    /// Log an action that was not executed
    pub fn log_remediation_skipped(&self, policy: &str, action_type: &str, target: &str, reason: &str) {
        info!(
            event = "remediation_skipped",
            instance = %self.instance,
            policy = %policy,
            action_type = %action_type,
            resource = %target,
            reason = %reason,
            "Remediation skipped"
        );
    }

    /// Log a scale request that an autoscaler would clamp
    pub fn log_autoscaler_conflict(
        &self,
        policy: &str,
        target: &str,
        autoscaler: &str,
        requested: i32,
        min_replicas: Option<i32>,
        max_replicas: i32,
    ) {
        warn!(
            event = "autoscaler_conflict",
            instance = %self.instance,
            policy = %policy,
            resource = %target,
            autoscaler = %autoscaler,
            requested = requested,
            min_replicas = ?min_replicas,
            max_replicas = max_replicas,
            "Requested replicas conflict with autoscaler bounds"
        );
    }

    /// Log a restored value; `source` names where the original came from
    pub fn log_reversion_completed(&self, target: &str, field: &str, value: i32, source: &str) {
        info!(
            event = "reversion_completed",
            instance = %self.instance,
            resource = %target,
            field = %field,
            value = value,
            source = %source,
            "Reverted remediation"
        );
    }

    pub fn log_reversion_failed(&self, target: &str, field: &str, error: &str) {
        warn!(
            event = "reversion_failed",
            instance = %self.instance,
            resource = %target,
            field = %field,
            error = %error,
            "Reversion abandoned"
        );
    }

    pub fn log_admission_denied(&self, policy: &str, operation: &str, reason: &str) {
        info!(
            event = "admission_denied",
            instance = %self.instance,
            policy = %policy,
            operation = %operation,
            reason = %reason,
            "Policy rejected"
        );
    }

    pub fn log_startup(&self, version: &str, poll_interval_secs: u64) {
        info!(
            event = "controller_started",
            instance = %self.instance,
            version = %version,
            poll_interval_secs = poll_interval_secs,
            "KubeMedic controller started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "controller_shutdown",
            instance = %self.instance,
            reason = %reason,
            "KubeMedic controller shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_medic_metrics_creation() {
        // Registration happens once per process; repeated handles share it
        let metrics = MedicMetrics::new();
        let again = MedicMetrics::new();

        metrics.inc_policy_evaluations();
        metrics.observe_evaluation_latency(0.2);
        metrics.inc_action("ScaleUp", "applied");
        again.inc_admission(false);
        again.set_pending_reversions(2);
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("test-instance");
        assert_eq!(logger.instance, "test-instance");
        assert_eq!(StructuredLogger::default().instance, "kubemedic");
    }
}

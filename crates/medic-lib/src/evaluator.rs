//! Policy evaluation
//!
//! One evaluation walks a policy's rules in order. For every distinct target
//! a rule's actions name, the rule's conditions are evaluated concurrently
//! against the target's workload; any true condition fires the rule for that
//! target and its actions are handed to the executor. Errors are scoped to the
//! smallest unit: a bad target skips its actions, a failing condition counts
//! as not firing. Only failing to fetch the policy aborts the evaluation.

use crate::cluster::{ClusterError, ClusterStore};
use crate::crd::{Action, Rule, SelfRemediationPolicy, SelfRemediationPolicyStatus};
use crate::executor::{ActionExecutor, ActionOutcome};
use crate::models::{ClusterObject, ObjectKey, PolicyKey};
use crate::observability::MedicMetrics;
use crate::resolve::{ResolveError, TargetResolver};
use crate::usage::{MetricsError, MetricsGateway};
use chrono::{SecondsFormat, Utc};
use futures::future::join_all;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const STATE_ACTIVE: &str = "Active";
pub const STATE_IDLE: &str = "Idle";

#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("policy {0} not found")]
    PolicyNotFound(PolicyKey),

    #[error("failed to fetch policy {policy}: {source}")]
    Fetch {
        policy: PolicyKey,
        #[source]
        source: ClusterError,
    },

    #[error("evaluation cancelled")]
    Cancelled,
}

/// What happened to one rule for one target
#[derive(Debug, Clone)]
pub struct RuleResult {
    pub rule: String,
    pub target: ObjectKey,
    pub fired: bool,
    pub outcomes: Vec<ActionOutcome>,
}

#[derive(Debug, Clone)]
pub struct EvaluationReport {
    pub policy: PolicyKey,
    pub results: Vec<RuleResult>,
    /// Targets that could not be resolved
    pub skipped_targets: usize,
}

impl EvaluationReport {
    /// Whether any rule fired
    pub fn active(&self) -> bool {
        self.results.iter().any(|r| r.fired)
    }

    pub fn applied(&self) -> impl Iterator<Item = &ActionOutcome> {
        self.results
            .iter()
            .flat_map(|r| r.outcomes.iter())
            .filter(|o| o.is_applied())
    }
}

pub struct PolicyEvaluator {
    store: Arc<dyn ClusterStore>,
    gateway: MetricsGateway,
    resolver: TargetResolver,
    executor: Arc<ActionExecutor>,
    metrics: MedicMetrics,
}

impl PolicyEvaluator {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        gateway: MetricsGateway,
        executor: Arc<ActionExecutor>,
    ) -> Self {
        Self {
            resolver: TargetResolver::new(store.clone()),
            store,
            gateway,
            executor,
            metrics: MedicMetrics::new(),
        }
    }

    pub fn executor(&self) -> &Arc<ActionExecutor> {
        &self.executor
    }

    /// Evaluate the current version of a policy and record its status
    pub async fn evaluate(
        &self,
        key: &PolicyKey,
        cancel: &CancellationToken,
    ) -> Result<EvaluationReport, EvaluationError> {
        let started = Instant::now();
        self.metrics.inc_policy_evaluations();

        let result = self.evaluate_inner(key, cancel).await;

        self.metrics
            .observe_evaluation_latency(started.elapsed().as_secs_f64());
        if result.is_err() {
            self.metrics.inc_evaluation_errors();
        }
        result
    }

    async fn evaluate_inner(
        &self,
        key: &PolicyKey,
        cancel: &CancellationToken,
    ) -> Result<EvaluationReport, EvaluationError> {
        let policy = self
            .store
            .get_policy(&key.namespace, &key.name)
            .await
            .map_err(|source| EvaluationError::Fetch {
                policy: key.clone(),
                source,
            })?
            .ok_or_else(|| EvaluationError::PolicyNotFound(key.clone()))?;

        let mut report = EvaluationReport {
            policy: key.clone(),
            results: Vec::new(),
            skipped_targets: 0,
        };

        for rule in &policy.spec.rules {
            self.evaluate_rule(&policy, rule, cancel, &mut report).await?;
        }

        self.record_status(&policy, &report).await;
        Ok(report)
    }

    async fn evaluate_rule(
        &self,
        policy: &SelfRemediationPolicy,
        rule: &Rule,
        cancel: &CancellationToken,
        report: &mut EvaluationReport,
    ) -> Result<(), EvaluationError> {
        let namespace = policy.key().namespace;

        for (target, actions) in group_by_target(&rule.actions, &namespace) {
            let key = match target {
                Ok(key) => key,
                Err(e) => {
                    warn!(policy = %policy.key(), rule = %rule.name, error = %e, "Invalid action target");
                    report.skipped_targets += 1;
                    continue;
                }
            };

            let resolved = match self.resolver.resolve_key(&key).await {
                Ok(resolved) => resolved,
                Err(e) => {
                    warn!(
                        policy = %policy.key(),
                        rule = %rule.name,
                        resource = %key,
                        error = %e,
                        "Skipping unresolvable target"
                    );
                    report.skipped_targets += 1;
                    continue;
                }
            };
            let Some(workload) = resolved.metrics_target() else {
                warn!(
                    policy = %policy.key(),
                    rule = %rule.name,
                    resource = %key,
                    "Target has no workload to measure"
                );
                report.skipped_targets += 1;
                continue;
            };

            let fired = self.rule_fires(policy, rule, workload, cancel).await?;
            let outcomes = if fired {
                info!(policy = %policy.key(), rule = %rule.name, resource = %key, "Rule fired");
                self.executor.execute(policy, &actions, &resolved).await
            } else {
                debug!(policy = %policy.key(), rule = %rule.name, resource = %key, "Rule idle");
                Vec::new()
            };

            report.results.push(RuleResult {
                rule: rule.name.clone(),
                target: key,
                fired,
                outcomes,
            });
        }
        Ok(())
    }

    /// Evaluate every condition; true when any one holds
    async fn rule_fires(
        &self,
        policy: &SelfRemediationPolicy,
        rule: &Rule,
        workload: &ClusterObject,
        cancel: &CancellationToken,
    ) -> Result<bool, EvaluationError> {
        let results = join_all(
            rule.conditions
                .iter()
                .map(|condition| self.gateway.evaluate_condition(workload, condition, cancel)),
        )
        .await;

        let mut fired = false;
        for (condition, result) in rule.conditions.iter().zip(results) {
            match result {
                Ok(true) => fired = true,
                Ok(false) => {}
                Err(MetricsError::Cancelled) => return Err(EvaluationError::Cancelled),
                Err(e) => {
                    self.metrics.inc_condition_errors();
                    warn!(
                        policy = %policy.key(),
                        rule = %rule.name,
                        resource = %workload.key,
                        signal = %condition.signal,
                        error = %e,
                        "Condition could not be evaluated"
                    );
                }
            }
        }
        Ok(fired)
    }

    async fn record_status(&self, policy: &SelfRemediationPolicy, report: &EvaluationReport) {
        let previous = policy.status.clone().unwrap_or_default();
        let last_action = report
            .results
            .iter()
            .flat_map(|r| r.outcomes.iter())
            .filter(|o| o.is_applied())
            .last()
            .map(ToString::to_string)
            .or(previous.last_remediation_action);

        let active = report.active();
        let status = SelfRemediationPolicyStatus {
            last_evaluation_time: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
            last_remediation_action: last_action,
            state: Some(if active { STATE_ACTIVE } else { STATE_IDLE }.to_string()),
            active,
        };

        let key = policy.key();
        if let Err(e) = self
            .store
            .update_policy_status(&key.namespace, &key.name, &status)
            .await
        {
            warn!(policy = %key, error = %e, "Failed to update policy status");
        }
    }
}

/// Actions grouped by target key, in order of first appearance
fn group_by_target(
    actions: &[Action],
    namespace: &str,
) -> Vec<(Result<ObjectKey, ResolveError>, Vec<Action>)> {
    let mut groups: Vec<(Result<ObjectKey, _>, Vec<Action>)> = Vec::new();
    for action in actions {
        match TargetResolver::target_key(&action.target, namespace) {
            Ok(key) => match groups.iter_mut().find(|(k, _)| k.as_ref().ok() == Some(&key)) {
                Some((_, group)) => group.push(action.clone()),
                None => groups.push((Ok(key), vec![action.clone()])),
            },
            Err(e) => groups.push((Err(e), vec![action.clone()])),
        }
    }
    groups
}

//! Policy admission
//!
//! Five stages run in a fixed order: namespace, resource, action, safety
//! limits, quota. Each stage checks every action of every rule before the next
//! stage starts, and the first failure is the denial. Targets and quota
//! arithmetic go through the same `TargetResolver` the executor uses.

pub mod webhook;

use crate::cluster::{ClusterError, ClusterStore};
use crate::crd::{parse_duration, Action, ActionType, SelfRemediationPolicy};
use crate::models::{ObjectKey, EXCLUDE_LABEL};
use crate::quantity::{QuantityError, Threshold};
use crate::resolve::{per_replica_requests, quota_violation, ResolveError, ResolvedTarget, TargetResolver};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Namespaces that never accept remediation policies
pub const DENIED_NAMESPACES: &[&str] = &[
    "kube-system",
    "kube-public",
    "kube-node-lease",
    "cert-manager",
    "ingress-nginx",
];

/// Fixed bounds on what a policy may request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafetyLimits {
    /// Requested replicas may be at most current replicas times this
    pub max_scale_factor: i32,
    pub min_replicas: i32,
    pub max_duration: Duration,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_scale_factor: 2,
            min_replicas: 1,
            max_duration: Duration::from_secs(2 * 60 * 60),
        }
    }
}

/// Denial reasons; `Display` is the message returned to the API server
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("namespace {0} is not allowed for remediation policies")]
    NamespaceDenied(String),

    #[error("namespace {0} is excluded from remediation")]
    NamespaceExcluded(String),

    #[error(transparent)]
    Target(#[from] ResolveError),

    #[error("action type {0} is not allowed")]
    ActionNotAllowed(String),

    #[error("scalingParams.temporaryMaxReplicas is required for action type {0}")]
    MissingReplicaCeiling(String),

    #[error("invalid duration {value:?} for {field}")]
    InvalidDuration { field: &'static str, value: String },

    #[error("invalid threshold {threshold:?} in rule {rule}: {source}")]
    InvalidThreshold {
        rule: String,
        threshold: String,
        #[source]
        source: QuantityError,
    },

    #[error("scale factor exceeds maximum allowed ({factor}): {requested} replicas requested for {target} running {current}")]
    ScaleFactorExceeded {
        target: ObjectKey,
        requested: i32,
        current: i32,
        factor: i32,
    },

    #[error("minimum pods cannot be less than {0}")]
    BelowMinimum(i32),

    /// Carries the formatted limit, e.g. "2h"
    #[error("scaling duration exceeds maximum allowed ({0})")]
    DurationExceeded(String),

    #[error("scaling would exceed quota for {resource}: {requested} requested, {hard} allowed")]
    QuotaExceeded {
        resource: String,
        requested: f64,
        hard: f64,
    },

    #[error("invalid resource quantity: {0}")]
    Quantity(#[from] QuantityError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

impl AdmissionError {
    /// True when the verdict came from a failed cluster read rather than the policy
    pub fn is_cluster_failure(&self) -> bool {
        matches!(
            self,
            AdmissionError::Cluster(_) | AdmissionError::Target(ResolveError::Cluster(_))
        )
    }
}

/// Runs the admission stages against live cluster state
#[derive(Clone)]
pub struct PolicyValidator {
    store: Arc<dyn ClusterStore>,
    resolver: TargetResolver,
    limits: SafetyLimits,
}

impl PolicyValidator {
    pub fn new(store: Arc<dyn ClusterStore>) -> Self {
        Self::with_limits(store, SafetyLimits::default())
    }

    pub fn with_limits(store: Arc<dyn ClusterStore>, limits: SafetyLimits) -> Self {
        Self {
            resolver: TargetResolver::new(store.clone()),
            store,
            limits,
        }
    }

    pub fn limits(&self) -> &SafetyLimits {
        &self.limits
    }

    /// Validate a policy; the error of the first failing stage is the denial
    pub async fn validate(&self, policy: &SelfRemediationPolicy) -> Result<(), AdmissionError> {
        let namespace = policy.key().namespace;
        let actions: Vec<&Action> = policy
            .spec
            .rules
            .iter()
            .flat_map(|rule| rule.actions.iter())
            .collect();

        self.check_namespaces(&namespace, &actions).await?;
        let targets = self.check_resources(&namespace, &actions).await?;
        self.check_actions(policy, &actions)?;
        self.check_safety_limits(&actions, &targets)?;
        self.check_quota(&actions, &targets).await?;
        Ok(())
    }

    async fn check_namespaces(&self, namespace: &str, actions: &[&Action]) -> Result<(), AdmissionError> {
        let mut namespaces = BTreeSet::from([namespace.to_string()]);
        namespaces.extend(
            actions
                .iter()
                .map(|a| a.target.namespace_or(namespace).to_string()),
        );

        // The policy namespace is checked first so its denial wins
        let ordered = std::iter::once(namespace.to_string())
            .chain(namespaces.into_iter().filter(|ns| ns != namespace));
        for ns in ordered {
            if DENIED_NAMESPACES.contains(&ns.as_str()) {
                return Err(AdmissionError::NamespaceDenied(ns));
            }
            let labels = self.store.namespace_labels(&ns).await?.unwrap_or_default();
            if labels.get(EXCLUDE_LABEL).map(String::as_str) == Some("true") {
                return Err(AdmissionError::NamespaceExcluded(ns));
            }
        }
        Ok(())
    }

    /// Resolve every target; one entry per action, in order
    async fn check_resources(
        &self,
        namespace: &str,
        actions: &[&Action],
    ) -> Result<Vec<ResolvedTarget>, AdmissionError> {
        let mut targets = Vec::with_capacity(actions.len());
        for action in actions {
            targets.push(self.resolver.resolve(&action.target, namespace).await?);
        }
        Ok(targets)
    }

    fn check_actions(&self, policy: &SelfRemediationPolicy, actions: &[&Action]) -> Result<(), AdmissionError> {
        for action in actions {
            if let ActionType::Other(other) = &action.action_type {
                return Err(AdmissionError::ActionNotAllowed(other.clone()));
            }
            if action.action_type.is_scaling() && action.replica_ceiling().is_none() {
                return Err(AdmissionError::MissingReplicaCeiling(action.action_type.to_string()));
            }
            if let Some(raw) = action
                .scaling_params
                .as_ref()
                .and_then(|p| p.scaling_duration.as_deref())
            {
                check_duration("scalingParams.scalingDuration", raw)?;
            }
        }

        for rule in &policy.spec.rules {
            for condition in &rule.conditions {
                Threshold::parse(&condition.threshold, &condition.signal).map_err(|source| {
                    AdmissionError::InvalidThreshold {
                        rule: rule.name.clone(),
                        threshold: condition.threshold.clone(),
                        source,
                    }
                })?;
                if let Some(raw) = condition.duration.as_deref() {
                    check_duration("conditions.duration", raw)?;
                }
            }
        }

        if let Some(raw) = policy.spec.cooldown_period.as_deref() {
            check_duration("cooldownPeriod", raw)?;
        }
        Ok(())
    }

    fn check_safety_limits(&self, actions: &[&Action], targets: &[ResolvedTarget]) -> Result<(), AdmissionError> {
        for (action, target) in actions.iter().zip(targets) {
            if let Some(requested) = action.replica_ceiling() {
                let current = target.current_value();
                if i64::from(requested) > i64::from(current) * i64::from(self.limits.max_scale_factor) {
                    return Err(AdmissionError::ScaleFactorExceeded {
                        target: target.key().clone(),
                        requested,
                        current,
                        factor: self.limits.max_scale_factor,
                    });
                }
                if requested < self.limits.min_replicas {
                    return Err(AdmissionError::BelowMinimum(self.limits.min_replicas));
                }
            }

            let duration = action
                .scaling_params
                .as_ref()
                .map(|p| p.duration())
                .transpose()
                .ok()
                .flatten()
                .flatten();
            if duration.is_some_and(|d| d > self.limits.max_duration) {
                return Err(AdmissionError::DurationExceeded(
                    humantime::format_duration(self.limits.max_duration).to_string(),
                ));
            }
        }
        Ok(())
    }

    async fn check_quota(&self, actions: &[&Action], targets: &[ResolvedTarget]) -> Result<(), AdmissionError> {
        for (action, target) in actions.iter().zip(targets) {
            let Some(requested) = action.replica_ceiling() else {
                continue;
            };
            // Autoscaler ceilings are checked against the pods of the scaled workload
            let Some(workload) = target.metrics_target() else {
                continue;
            };
            let Some(hard) = self.resolver.compute_quota(&workload.key.namespace).await? else {
                continue;
            };

            let per_replica = per_replica_requests(workload)?;
            if let Some(violation) = quota_violation(&per_replica, requested, &hard)? {
                return Err(AdmissionError::QuotaExceeded {
                    resource: violation.resource,
                    requested: violation.requested,
                    hard: violation.hard,
                });
            }
        }
        Ok(())
    }
}

fn check_duration(field: &'static str, raw: &str) -> Result<(), AdmissionError> {
    if raw.trim().is_empty() {
        return Ok(());
    }
    parse_duration(raw)
        .map(|_| ())
        .map_err(|_| AdmissionError::InvalidDuration {
            field,
            value: raw.to_string(),
        })
}

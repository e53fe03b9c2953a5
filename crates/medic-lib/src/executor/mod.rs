//! Action execution
//!
//! Applies the actions of a fired rule to a resolved target. Each executed
//! action writes one RemediationBackup and then one mutation carrying the new
//! value plus the original-value annotation. Conflicts with a governing
//! autoscaler are skipped with a warning event unless the action asks for the
//! autoscaler's ceiling to be raised instead.

pub mod backup;
pub mod hooks;

pub use hooks::{HookClient, HookError, HookPayload, HookPhase};

use crate::cluster::{ClusterStore, EventSink};
use crate::crd::{Action, ActionType, ConflictResolution, ResourceReference, SelfRemediationPolicy};
use crate::models::{ClusterObject, Mutation, ObjectKey, ScaleField, BACKUP_ANNOTATION};
use crate::observability::{MedicMetrics, StructuredLogger};
use crate::resolve::ResolvedTarget;
use crate::reversion::{ReversionRequest, ReversionScheduler};
use crate::tracker::{RemediationKey, StateTracker};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use dashmap::DashMap;
use kube::ResourceExt;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Event reason for a scale request an autoscaler would clamp
pub const REASON_AUTOSCALER_CONFLICT: &str = "AutoscalerConflict";
/// Event reason for an action that could not run
pub const REASON_REMEDIATION_SKIPPED: &str = "RemediationSkipped";
/// Event reason for an action that failed against the cluster
pub const REASON_REMEDIATION_FAILED: &str = "RemediationFailed";

/// Result of one action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Applied {
        target: ObjectKey,
        field: ScaleField,
        original: i32,
        applied: i32,
        backup: String,
    },
    /// Not executed; not an error
    Skipped { reason: String },
    /// A governing autoscaler would clamp the requested replicas
    Conflict {
        autoscaler: ObjectKey,
        requested: i32,
        min_replicas: Option<i32>,
        max_replicas: i32,
    },
    /// The (policy, target) pair was remediated within the cooldown period
    CoolingDown { remaining: Duration },
    /// Accepted action type without mutation logic
    Unimplemented(ActionType),
    Failed { error: String },
}

impl ActionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ActionOutcome::Applied { .. } => "applied",
            ActionOutcome::Skipped { .. } => "skipped",
            ActionOutcome::Conflict { .. } => "conflict",
            ActionOutcome::CoolingDown { .. } => "cooling_down",
            ActionOutcome::Unimplemented(_) => "unimplemented",
            ActionOutcome::Failed { .. } => "failed",
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, ActionOutcome::Applied { .. })
    }

    fn skipped(reason: impl Into<String>) -> Self {
        ActionOutcome::Skipped {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ActionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionOutcome::Applied {
                target,
                field,
                original,
                applied,
                ..
            } => write!(f, "set {} {} from {} to {}", target, field, original, applied),
            ActionOutcome::Skipped { reason } => write!(f, "skipped: {}", reason),
            ActionOutcome::Conflict {
                autoscaler,
                requested,
                max_replicas,
                ..
            } => write!(
                f,
                "conflict: {} replicas requested, {} allows at most {}",
                requested, autoscaler, max_replicas
            ),
            ActionOutcome::CoolingDown { remaining } => {
                write!(f, "cooling down for {}s", remaining.as_secs())
            }
            ActionOutcome::Unimplemented(action) => write!(f, "{} is not implemented", action),
            ActionOutcome::Failed { error } => write!(f, "failed: {}", error),
        }
    }
}

/// A single-field write planned for one action
#[derive(Debug, Clone)]
struct Plan {
    object: ClusterObject,
    field: ScaleField,
    original: i32,
    value: i32,
    /// Backup already holding `original`, when an earlier remediation is live
    restore_from: Option<String>,
}

enum Planned {
    Write(Plan),
    Done(ActionOutcome),
}

pub struct ActionExecutor {
    store: Arc<dyn ClusterStore>,
    events: Arc<dyn EventSink>,
    tracker: Arc<StateTracker>,
    reversions: ReversionScheduler,
    hooks: HookClient,
    cooldowns: DashMap<RemediationKey, Instant>,
    last_backup_millis: AtomicI64,
    metrics: MedicMetrics,
    logger: StructuredLogger,
}

impl ActionExecutor {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        events: Arc<dyn EventSink>,
        tracker: Arc<StateTracker>,
        reversions: ReversionScheduler,
    ) -> Self {
        Self {
            store,
            events,
            tracker,
            reversions,
            hooks: HookClient::default(),
            cooldowns: DashMap::new(),
            last_backup_millis: AtomicI64::new(0),
            metrics: MedicMetrics::new(),
            logger: StructuredLogger::default(),
        }
    }

    pub fn with_hooks(mut self, hooks: HookClient) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn tracker(&self) -> &Arc<StateTracker> {
        &self.tracker
    }

    pub fn reversions(&self) -> &ReversionScheduler {
        &self.reversions
    }

    /// Execute every action against `target`; one outcome per action, in order
    pub async fn execute(
        &self,
        policy: &SelfRemediationPolicy,
        actions: &[Action],
        target: &ResolvedTarget,
    ) -> Vec<ActionOutcome> {
        // The window is checked once so every action of a firing runs together
        let key = RemediationKey::new(policy.key(), target.key().clone());
        let cooling = self.cooldown_remaining(policy, &key);

        let mut outcomes = Vec::with_capacity(actions.len());
        for action in actions {
            let outcome = match cooling {
                Some(remaining) if action.action_type.is_scaling() => {
                    ActionOutcome::CoolingDown { remaining }
                }
                _ => self.execute_one(policy, action, target).await,
            };
            self.metrics
                .inc_action(&action.action_type.to_string(), outcome.label());
            match &outcome {
                ActionOutcome::Applied { .. } => {}
                ActionOutcome::Skipped { reason } => self.logger.log_remediation_skipped(
                    &policy.key().to_string(),
                    &action.action_type.to_string(),
                    &target.key().to_string(),
                    reason,
                ),
                other => debug!(
                    policy = %policy.key(),
                    resource = %target.key(),
                    outcome = %other,
                    "Action not applied"
                ),
            }
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn execute_one(
        &self,
        policy: &SelfRemediationPolicy,
        action: &Action,
        target: &ResolvedTarget,
    ) -> ActionOutcome {
        if !action.action_type.is_scaling() {
            return ActionOutcome::Unimplemented(action.action_type.clone());
        }

        let Some(ceiling) = action.replica_ceiling() else {
            let outcome = ActionOutcome::skipped("scalingParams.temporaryMaxReplicas is not set");
            self.warn_event(policy, REASON_REMEDIATION_SKIPPED, &outcome).await;
            return outcome;
        };
        let duration = match action.scaling_params.as_ref().map(|p| p.duration()) {
            None => None,
            Some(Ok(duration)) => duration,
            Some(Err(e)) => {
                let outcome = ActionOutcome::skipped(format!("invalid scalingDuration: {}", e));
                self.warn_event(policy, REASON_REMEDIATION_SKIPPED, &outcome).await;
                return outcome;
            }
        };

        let planned = match action.action_type {
            ActionType::AdjustHpaLimits => match &target.autoscaler {
                Some(autoscaler) => self.plan_autoscaler(autoscaler, ceiling),
                None => Planned::Done(ActionOutcome::skipped(format!(
                    "no autoscaler governs {}",
                    target.key()
                ))),
            },
            _ => self.plan_scale(policy, action, target, ceiling).await,
        };

        let plan = match planned {
            Planned::Write(plan) => plan,
            Planned::Done(outcome) => return outcome,
        };

        if plan.object.field_value(plan.field) == Some(plan.value) {
            return self.extend_pending(&plan, duration);
        }

        self.apply(policy, action, target, plan, duration).await
    }

    /// Plan a ScaleUp or ScaleDown, resolving autoscaler conflicts
    async fn plan_scale(
        &self,
        policy: &SelfRemediationPolicy,
        action: &Action,
        target: &ResolvedTarget,
        requested: i32,
    ) -> Planned {
        if !target.key().kind.is_workload() {
            return Planned::Done(ActionOutcome::skipped(format!(
                "{} needs a Deployment or StatefulSet target",
                action.action_type
            )));
        }
        if requested < 1 {
            return Planned::Done(ActionOutcome::skipped("requested replicas must be at least 1"));
        }

        let current = target.object.replicas().unwrap_or(1);
        let scale_up = action.action_type == ActionType::ScaleUp;

        if let Some(autoscaler) = &target.autoscaler {
            if let Some((min, max)) = autoscaler.autoscaler_bounds() {
                let conflicts = if scale_up {
                    requested > max
                } else {
                    requested < min.unwrap_or(1)
                };
                if conflicts {
                    if scale_up && action.conflict_resolution() == ConflictResolution::AdjustHpaLimits {
                        debug!(
                            resource = %target.key(),
                            autoscaler = %autoscaler.key,
                            "Raising autoscaler ceiling instead of scaling"
                        );
                        return self.plan_autoscaler(autoscaler, requested);
                    }
                    return Planned::Done(
                        self.report_conflict(policy, action, target, autoscaler, requested, min, max)
                            .await,
                    );
                }
            }
        }

        let (original, restore_from) =
            self.original_value(&target.object, ScaleField::Replicas, current);
        Planned::Write(Plan {
            object: target.object.clone(),
            field: ScaleField::Replicas,
            original,
            value: requested,
            restore_from,
        })
    }

    /// Plan a maxReplicas write, clamping the ceiling up to minReplicas
    fn plan_autoscaler(&self, autoscaler: &ClusterObject, ceiling: i32) -> Planned {
        let Some((min, max)) = autoscaler.autoscaler_bounds() else {
            return Planned::Done(ActionOutcome::skipped(format!(
                "{} is not an autoscaler",
                autoscaler.key
            )));
        };
        if ceiling < 1 {
            return Planned::Done(ActionOutcome::skipped("autoscaler ceiling must be at least 1"));
        }

        let value = ceiling.max(min.unwrap_or(1));
        if value != ceiling {
            debug!(
                autoscaler = %autoscaler.key,
                requested = ceiling,
                min_replicas = value,
                "Clamped autoscaler ceiling up to minReplicas"
            );
        }

        let (original, restore_from) = self.original_value(autoscaler, ScaleField::MaxReplicas, max);
        Planned::Write(Plan {
            object: autoscaler.clone(),
            field: ScaleField::MaxReplicas,
            original,
            value,
            restore_from,
        })
    }

    /// Value to restore later and the backup holding it: a pending
    /// reversion's capture wins over existing annotations, which win over the
    /// live value
    fn original_value(
        &self,
        object: &ClusterObject,
        field: ScaleField,
        current: i32,
    ) -> (i32, Option<String>) {
        if let Some(pending) = self.reversions.pending_for(&object.key, field) {
            return (pending.request.original, pending.request.backup);
        }
        match object
            .annotations
            .get(field.annotation())
            .and_then(|v| v.parse().ok())
        {
            Some(annotated) => (annotated, object.annotations.get(BACKUP_ANNOTATION).cloned()),
            None => (current, None),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn report_conflict(
        &self,
        policy: &SelfRemediationPolicy,
        action: &Action,
        target: &ResolvedTarget,
        autoscaler: &ClusterObject,
        requested: i32,
        min: Option<i32>,
        max: i32,
    ) -> ActionOutcome {
        self.logger.log_autoscaler_conflict(
            &policy.key().to_string(),
            &target.key().to_string(),
            &autoscaler.key.to_string(),
            requested,
            min,
            max,
        );
        let message = format!(
            "{} of {} to {} replicas skipped: HorizontalPodAutoscaler {} bounds replicas to [{}, {}]",
            action.action_type,
            target.key(),
            requested,
            autoscaler.key.name,
            min.unwrap_or(1),
            max
        );
        if let Err(e) = self
            .events
            .warning(policy, REASON_AUTOSCALER_CONFLICT, &message)
            .await
        {
            warn!(policy = %policy.key(), error = %e, "Failed to publish conflict event");
        }
        ActionOutcome::Conflict {
            autoscaler: autoscaler.key.clone(),
            requested,
            min_replicas: min,
            max_replicas: max,
        }
    }

    /// Target already holds the requested value; push out a pending reversion
    fn extend_pending(&self, plan: &Plan, duration: Option<Duration>) -> ActionOutcome {
        match (self.reversions.pending_for(&plan.object.key, plan.field), duration) {
            (Some(pending), Some(duration)) => {
                self.reversions.schedule(pending.request, duration);
                ActionOutcome::skipped(format!(
                    "{} already at {}; reversion extended",
                    plan.field, plan.value
                ))
            }
            _ => ActionOutcome::skipped(format!("{} already at {}", plan.field, plan.value)),
        }
    }

    async fn apply(
        &self,
        policy: &SelfRemediationPolicy,
        action: &Action,
        target: &ResolvedTarget,
        plan: Plan,
        duration: Option<Duration>,
    ) -> ActionOutcome {
        let policy_key = policy.key();
        let object_key = plan.object.key.clone();

        if let Some(url) = action.pre_action_hook.as_deref() {
            let payload = self.payload(HookPhase::Pre, policy, action, &plan);
            if let Err(e) = self.hooks.notify(url, &payload).await {
                let outcome = ActionOutcome::skipped(format!("pre-action hook failed: {}", e));
                self.warn_event(policy, REASON_REMEDIATION_SKIPPED, &outcome).await;
                return outcome;
            }
        }

        // A repeat remediation keeps the first backup; it already holds the original
        let backup_name = match plan.restore_from.clone() {
            Some(existing) => existing,
            None => match self.write_backup(policy, action, &plan).await {
                Ok(name) => name,
                Err(outcome) => return outcome,
            },
        };

        let mutation = Mutation::new(plan.field, plan.value)
            .set_annotation(plan.field.annotation(), plan.original.to_string())
            .set_annotation(BACKUP_ANNOTATION, backup_name.clone());
        if let Err(e) = self.store.apply_mutation(&object_key, &mutation).await {
            return self
                .fail(policy, format!("failed to update {}: {}", object_key, e))
                .await;
        }

        self.logger.log_remediation_applied(
            &policy_key.to_string(),
            &action.action_type.to_string(),
            &object_key.to_string(),
            &plan.field.to_string(),
            plan.original,
            plan.value,
            &backup_name,
        );

        if let Some(duration) = duration {
            self.reversions.schedule(
                ReversionRequest {
                    target: object_key.clone(),
                    field: plan.field,
                    original: plan.original,
                    backup: Some(backup_name.clone()),
                    policy: policy_key.clone(),
                },
                duration,
            );
        }

        let notify_urls = action
            .post_action_hook
            .iter()
            .chain(action.scaling_params.iter().filter_map(|p| p.notification_webhook.as_ref()));
        let payload = self.payload(HookPhase::Post, policy, action, &plan);
        for url in notify_urls {
            if let Err(e) = self.hooks.notify(url, &payload).await {
                warn!(policy = %policy_key, url = %url, error = %e, "Post-action notification failed");
            }
        }

        self.tracker.track(&policy_key, target.key());
        self.cooldowns.insert(
            RemediationKey::new(policy_key, target.key().clone()),
            Instant::now(),
        );
        self.metrics
            .set_tracked_remediations(self.tracker.len() as i64);

        ActionOutcome::Applied {
            target: object_key,
            field: plan.field,
            original: plan.original,
            applied: plan.value,
            backup: backup_name,
        }
    }

    async fn write_backup(
        &self,
        policy: &SelfRemediationPolicy,
        action: &Action,
        plan: &Plan,
    ) -> Result<String, ActionOutcome> {
        let backup_time = self.next_backup_time();
        let backup = match backup::build_backup(policy, &plan.object, &action.action_type, backup_time) {
            Ok(backup) => backup,
            Err(e) => return Err(self.fail(policy, format!("failed to build backup: {}", e)).await),
        };
        let name = backup.name_any();
        if let Err(e) = self.store.create_backup(&backup).await {
            return Err(self
                .fail(policy, format!("failed to write backup {}: {}", name, e))
                .await);
        }
        Ok(name)
    }

    /// Strictly increasing timestamps keep backup names unique
    fn next_backup_time(&self) -> DateTime<Utc> {
        let now = Utc::now();
        let now_millis = now.timestamp_millis();
        let previous = self
            .last_backup_millis
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                Some(now_millis.max(prev + 1))
            })
            .unwrap_or(now_millis);
        let millis = now_millis.max(previous + 1);
        Utc.timestamp_millis_opt(millis).single().unwrap_or(now)
    }

    fn cooldown_remaining(&self, policy: &SelfRemediationPolicy, key: &RemediationKey) -> Option<Duration> {
        let cooldown = match policy.cooldown() {
            Ok(Some(cooldown)) => cooldown,
            Ok(None) => return None,
            Err(e) => {
                warn!(policy = %policy.key(), error = %e, "Ignoring unparseable cooldownPeriod");
                return None;
            }
        };
        let last = *self.cooldowns.get(key)?;
        let elapsed = last.elapsed();
        (elapsed < cooldown).then(|| cooldown - elapsed)
    }

    fn payload(
        &self,
        phase: HookPhase,
        policy: &SelfRemediationPolicy,
        action: &Action,
        plan: &Plan,
    ) -> HookPayload {
        HookPayload {
            phase,
            policy: policy.name_any(),
            namespace: policy.namespace().unwrap_or_default(),
            action_type: action.action_type.to_string(),
            target: ResourceReference::from(&plan.object.key),
            original_value: plan.original,
            requested_value: plan.value,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    async fn fail(&self, policy: &SelfRemediationPolicy, error: String) -> ActionOutcome {
        warn!(policy = %policy.key(), error = %error, "Remediation failed");
        let outcome = ActionOutcome::Failed { error };
        self.warn_event(policy, REASON_REMEDIATION_FAILED, &outcome).await;
        outcome
    }

    async fn warn_event(&self, policy: &SelfRemediationPolicy, reason: &str, outcome: &ActionOutcome) {
        if let Err(e) = self.events.warning(policy, reason, &outcome.to_string()).await {
            warn!(policy = %policy.key(), error = %e, "Failed to publish event");
        }
    }
}

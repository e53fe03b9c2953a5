//! Policy poll loop
//!
//! Lists policies on a fixed interval and evaluates each one as its own task.
//! A policy whose previous evaluation is still running (for example inside a
//! sustain window) is not started again until it finishes. Shutdown cancels
//! in-flight evaluations and waits for them; pending reversions are not tied
//! to the loop and keep their timers.

use crate::cluster::ClusterStore;
use crate::evaluator::{EvaluationError, EvaluationReport, PolicyEvaluator};
use crate::health::{components, HealthRegistry};
use crate::models::PolicyKey;
use crate::observability::MedicMetrics;
use crate::tracker::StateTracker;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Time between policy listings (default: 30 seconds)
    pub poll_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
        }
    }
}

type EvaluationResult = (PolicyKey, Result<EvaluationReport, EvaluationError>);

/// Policies with a running evaluation, keyed by policy and by task
#[derive(Default)]
struct InFlight {
    policies: HashSet<PolicyKey>,
    tasks: HashMap<Id, PolicyKey>,
}

impl InFlight {
    fn len(&self) -> usize {
        self.policies.len()
    }

    /// Returns false when the policy already has a running evaluation
    fn claim(&mut self, key: &PolicyKey) -> bool {
        self.policies.insert(key.clone())
    }

    fn started(&mut self, id: Id, key: PolicyKey) {
        self.tasks.insert(id, key);
    }

    /// Release the policy a finished task was evaluating, panicked tasks included
    fn finish(&mut self, joined: Result<(Id, EvaluationResult), JoinError>) {
        match joined {
            Ok((id, (key, result))) => {
                self.tasks.remove(&id);
                self.policies.remove(&key);
                log_result(&key, &result);
            }
            Err(e) => match self.tasks.remove(&e.id()) {
                Some(key) => {
                    warn!(policy = %key, error = %e, "Policy evaluation task panicked");
                    self.policies.remove(&key);
                }
                None => warn!(error = %e, "Policy evaluation task panicked"),
            },
        }
    }
}

pub struct Controller {
    store: Arc<dyn ClusterStore>,
    evaluator: Arc<PolicyEvaluator>,
    tracker: Arc<StateTracker>,
    health: HealthRegistry,
    config: ControllerConfig,
    metrics: MedicMetrics,
}

impl Controller {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        evaluator: Arc<PolicyEvaluator>,
        tracker: Arc<StateTracker>,
        health: HealthRegistry,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            evaluator,
            tracker,
            health,
            config,
            metrics: MedicMetrics::new(),
        }
    }

    /// Run until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.config.poll_interval.as_secs(),
            "Starting policy poll loop"
        );
        self.health.register(components::CONTROLLER).await;

        let evaluations = shutdown.child_token();
        let mut tasks: JoinSet<EvaluationResult> = JoinSet::new();
        let mut in_flight = InFlight::default();
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!(in_flight = in_flight.len(), "Shutting down policy poll loop");
                    break;
                }
                Some(joined) = tasks.join_next_with_id() => in_flight.finish(joined),
                _ = ticker.tick() => {
                    self.poll(&mut tasks, &mut in_flight, &evaluations).await;
                }
            }
        }

        evaluations.cancel();
        while let Some(joined) = tasks.join_next_with_id().await {
            in_flight.finish(joined);
        }
    }

    /// List policies and start an evaluation for each idle one
    async fn poll(
        &self,
        tasks: &mut JoinSet<EvaluationResult>,
        in_flight: &mut InFlight,
        cancel: &CancellationToken,
    ) {
        let policies = match self.store.list_policies().await {
            Ok(policies) => policies,
            Err(e) => {
                warn!(error = %e, "Failed to list policies");
                self.health
                    .set_degraded(components::CONTROLLER, format!("policy list failed: {}", e))
                    .await;
                return;
            }
        };
        self.health.set_healthy(components::CONTROLLER).await;

        let mut started = 0;
        for policy in policies {
            let key = policy.key();
            if !in_flight.claim(&key) {
                debug!(policy = %key, "Previous evaluation still running");
                continue;
            }
            let evaluator = self.evaluator.clone();
            let cancel = cancel.clone();
            let task_key = key.clone();
            let handle = tasks.spawn(async move {
                let result = evaluator.evaluate(&task_key, &cancel).await;
                (task_key, result)
            });
            in_flight.started(handle.id(), key);
            started += 1;
        }

        let removed = self.tracker.cleanup(self.store.as_ref()).await;
        self.metrics
            .set_tracked_remediations(self.tracker.len() as i64);
        self.metrics
            .set_pending_reversions(self.evaluator.executor().reversions().pending_count() as i64);
        debug!(
            started,
            in_flight = in_flight.len(),
            tracker_removed = removed,
            "Poll cycle complete"
        );
    }
}

fn log_result(key: &PolicyKey, result: &Result<EvaluationReport, EvaluationError>) {
    match result {
        Ok(report) => debug!(
            policy = %key,
            active = report.active(),
            applied = report.applied().count(),
            skipped_targets = report.skipped_targets,
            "Policy evaluated"
        ),
        Err(EvaluationError::Cancelled) => debug!(policy = %key, "Policy evaluation cancelled"),
        Err(EvaluationError::PolicyNotFound(_)) => debug!(policy = %key, "Policy deleted before evaluation"),
        Err(e) => warn!(policy = %key, error = %e, "Policy evaluation failed"),
    }
}

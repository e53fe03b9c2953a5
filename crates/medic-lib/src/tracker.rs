//! Registry of active remediations
//!
//! Entries are keyed by (policy, target) and refreshed every time an action
//! runs for the pair. `cleanup` drops entries whose policy or target is gone,
//! or which have not been touched within the staleness window. The tracker is
//! bookkeeping only and never gates execution.

use crate::cluster::ClusterStore;
use crate::models::{ObjectKey, PolicyKey};
use dashmap::DashMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Entries untouched for longer than this are dropped by `cleanup`
pub const STALENESS_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Identity of one remediation: the policy and the target it acts on
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemediationKey {
    pub policy: PolicyKey,
    pub target: ObjectKey,
}

impl RemediationKey {
    pub fn new(policy: PolicyKey, target: ObjectKey) -> Self {
        Self { policy, target }
    }
}

impl fmt::Display for RemediationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.policy, self.target)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemediationState {
    pub last_checked: Instant,
}

pub struct StateTracker {
    entries: DashMap<RemediationKey, RemediationState>,
    staleness: Duration,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTracker {
    pub fn new() -> Self {
        Self::with_staleness(STALENESS_WINDOW)
    }

    pub fn with_staleness(staleness: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            staleness,
        }
    }

    /// Insert or refresh the entry for a (policy, target) pair
    pub fn track(&self, policy: &PolicyKey, target: &ObjectKey) {
        self.entries.insert(
            RemediationKey::new(policy.clone(), target.clone()),
            RemediationState {
                last_checked: Instant::now(),
            },
        );
    }

    pub fn get(&self, key: &RemediationKey) -> Option<RemediationState> {
        self.entries.get(key).map(|e| *e)
    }

    pub fn contains(&self, policy: &PolicyKey, target: &ObjectKey) -> bool {
        self.entries
            .contains_key(&RemediationKey::new(policy.clone(), target.clone()))
    }

    /// Point-in-time copy of all entries
    pub fn snapshot(&self) -> Vec<(RemediationKey, RemediationState)> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop stale entries and entries whose policy or target no longer
    /// exists. Returns the number of entries removed.
    ///
    /// An entry refreshed by a concurrent `track` after the snapshot is kept.
    pub async fn cleanup(&self, store: &dyn ClusterStore) -> usize {
        let now = Instant::now();
        let mut removed = 0;

        for (key, state) in self.snapshot() {
            let reason = if now.duration_since(state.last_checked) > self.staleness {
                Some("stale")
            } else {
                match self.orphan_reason(store, &key).await {
                    Ok(reason) => reason,
                    Err(e) => {
                        warn!(remediation = %key, error = %e, "Skipping cleanup check");
                        None
                    }
                }
            };

            let Some(reason) = reason else {
                continue;
            };
            let was_removed = self
                .entries
                .remove_if(&key, |_, current| current.last_checked == state.last_checked)
                .is_some();
            if was_removed {
                debug!(remediation = %key, reason, "Removed remediation state");
                removed += 1;
            }
        }

        removed
    }

    async fn orphan_reason(
        &self,
        store: &dyn ClusterStore,
        key: &RemediationKey,
    ) -> Result<Option<&'static str>, crate::cluster::ClusterError> {
        if store
            .get_policy(&key.policy.namespace, &key.policy.name)
            .await?
            .is_none()
        {
            return Ok(Some("policy deleted"));
        }
        if store.get_object(&key.target).await?.is_none() {
            return Ok(Some("target deleted"));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryCluster;
    use crate::crd::{SelfRemediationPolicy, SelfRemediationPolicySpec};
    use std::sync::Arc;

    fn setup() -> (InMemoryCluster, PolicyKey, ObjectKey) {
        let cluster = InMemoryCluster::new();
        let target = cluster.insert_deployment("shop", "web", 1);
        cluster.insert_policy(SelfRemediationPolicy::in_namespace(
            "shop",
            "web-policy",
            SelfRemediationPolicySpec::default(),
        ));
        (cluster, PolicyKey::new("shop", "web-policy"), target)
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_is_idempotent_upsert() {
        let tracker = StateTracker::new();
        let policy = PolicyKey::new("shop", "p");
        let target = ObjectKey::new(crate::models::TargetKind::Deployment, "shop", "web");

        tracker.track(&policy, &target);
        let first = tracker
            .get(&RemediationKey::new(policy.clone(), target.clone()))
            .unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        tracker.track(&policy, &target);
        let second = tracker
            .get(&RemediationKey::new(policy.clone(), target.clone()))
            .unwrap();

        assert_eq!(tracker.len(), 1);
        assert!(second.last_checked > first.last_checked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_keeps_live_entries() {
        let (cluster, policy, target) = setup();
        let tracker = StateTracker::new();
        tracker.track(&policy, &target);

        assert_eq!(tracker.cleanup(&cluster).await, 0);
        assert!(tracker.contains(&policy, &target));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_removes_stale_entries() {
        let (cluster, policy, target) = setup();
        let tracker = StateTracker::new();
        tracker.track(&policy, &target);

        tokio::time::advance(STALENESS_WINDOW + Duration::from_secs(1)).await;

        assert_eq!(tracker.cleanup(&cluster).await, 1);
        assert!(tracker.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_removes_orphans() {
        let (cluster, policy, target) = setup();
        let tracker = StateTracker::new();
        tracker.track(&policy, &target);
        let other = cluster.insert_deployment("shop", "api", 1);
        tracker.track(&policy, &other);

        cluster.remove_object(&other);
        assert_eq!(tracker.cleanup(&cluster).await, 1);
        assert!(tracker.contains(&policy, &target));

        cluster.remove_policy(&policy);
        assert_eq!(tracker.cleanup(&cluster).await, 1);
        assert!(tracker.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_track_and_cleanup() {
        let (cluster, policy, _) = setup();
        let cluster = Arc::new(cluster);
        let tracker = Arc::new(StateTracker::new());

        let mut handles = Vec::new();
        for i in 0..8 {
            let tracker = tracker.clone();
            let cluster = cluster.clone();
            let policy = policy.clone();
            handles.push(tokio::spawn(async move {
                let target = cluster.insert_deployment("shop", &format!("web-{}", i), 1);
                for _ in 0..50 {
                    tracker.track(&policy, &target);
                    tracker.cleanup(cluster.as_ref()).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(tracker.len(), 8);
    }
}

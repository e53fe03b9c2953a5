//! Delayed restoration of remediated targets
//!
//! Every scheduled reversion is a pending record keyed by (target, field)
//! and backed by a spawned timer task. Records can be listed, cancelled and
//! run early. Rescheduling a pending slot keeps the first captured original
//! value so a re-fired remediation never becomes the value that is restored.
//!
//! When a timer fires, the target is re-read and the original value is taken
//! from, in order: the verified RemediationBackup, the target's
//! original-value annotation, the value captured in the pending record.

use crate::cluster::{ClusterError, ClusterStore};
use crate::executor::backup::{original_value, verify_backup};
use crate::models::{Mutation, ObjectKey, PolicyKey, ScaleField, BACKUP_ANNOTATION};
use crate::observability::{MedicMetrics, StructuredLogger};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ReversionError {
    #[error("no pending reversion for {0}")]
    NotPending(String),

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// What a reversion did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReversionOutcome {
    Reverted { value: i32, source: ValueSource },
    /// Target already holds the original value and carries no marker
    AlreadyReverted,
    /// Target was deleted; nothing to revert
    TargetGone,
}

/// Where the restored value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Backup,
    Annotation,
    Record,
}

impl ValueSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueSource::Backup => "backup",
            ValueSource::Annotation => "annotation",
            ValueSource::Record => "record",
        }
    }
}

/// What to restore and where
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReversionRequest {
    pub target: ObjectKey,
    pub field: ScaleField,
    pub original: i32,
    /// Name of the backup in the target namespace
    pub backup: Option<String>,
    pub policy: PolicyKey,
}

/// A scheduled reversion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingReversion {
    pub id: u64,
    pub request: ReversionRequest,
    pub due_at: Instant,
}

struct PendingEntry {
    record: PendingReversion,
    handle: JoinHandle<()>,
}

type Slot = (ObjectKey, ScaleField);

struct SchedulerInner {
    store: Arc<dyn ClusterStore>,
    pending: DashMap<Slot, PendingEntry>,
    next_id: AtomicU64,
    metrics: MedicMetrics,
    logger: StructuredLogger,
}

/// Cancellable registry of delayed reversions
#[derive(Clone)]
pub struct ReversionScheduler {
    inner: Arc<SchedulerInner>,
}

impl ReversionScheduler {
    pub fn new(store: Arc<dyn ClusterStore>) -> Self {
        Self::with_logger(store, StructuredLogger::default())
    }

    pub fn with_logger(store: Arc<dyn ClusterStore>, logger: StructuredLogger) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                pending: DashMap::new(),
                next_id: AtomicU64::new(1),
                metrics: MedicMetrics::new(),
                logger,
            }),
        }
    }

    /// Pending record for a slot, if any
    pub fn pending_for(&self, target: &ObjectKey, field: ScaleField) -> Option<PendingReversion> {
        self.inner
            .pending
            .get(&(target.clone(), field))
            .map(|e| e.record.clone())
    }

    pub fn pending(&self) -> Vec<PendingReversion> {
        let mut records: Vec<_> = self
            .inner
            .pending
            .iter()
            .map(|e| e.record.clone())
            .collect();
        records.sort_by_key(|r| r.id);
        records
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Schedule a reversion after `delay`.
    ///
    /// An existing reversion for the same slot is replaced, but its original
    /// value and backup are carried into the new record.
    pub fn schedule(&self, mut request: ReversionRequest, delay: Duration) -> PendingReversion {
        let slot = (request.target.clone(), request.field);
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);

        // The shard lock is held until the new entry is in place, so the new
        // task cannot observe the slot before its own record exists
        let entry = self.inner.pending.entry(slot.clone());
        if let Entry::Occupied(existing) = &entry {
            let previous = &existing.get().record;
            request.original = previous.request.original;
            request.backup = previous.request.backup.clone();
            existing.get().handle.abort();
            debug!(
                resource = %slot.0,
                field = %slot.1,
                previous_id = previous.id,
                "Rescheduling pending reversion"
            );
        }

        let record = PendingReversion {
            id,
            request,
            due_at: Instant::now() + delay,
        };

        let inner = self.inner.clone();
        let task_record = record.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.run(&task_record).await;
            let slot = (task_record.request.target.clone(), task_record.request.field);
            inner
                .pending
                .remove_if(&slot, |_, e| e.record.id == task_record.id);
            inner.metrics.set_pending_reversions(inner.pending.len() as i64);
        });

        drop(entry.insert(PendingEntry {
            record: record.clone(),
            handle,
        }));

        self.inner.metrics.inc_reversions_scheduled();
        self.inner
            .metrics
            .set_pending_reversions(self.inner.pending.len() as i64);
        record
    }

    /// Cancel a pending reversion; returns the cancelled record
    pub fn cancel(&self, target: &ObjectKey, field: ScaleField) -> Option<PendingReversion> {
        let (_, entry) = self.inner.pending.remove(&(target.clone(), field))?;
        entry.handle.abort();
        self.inner
            .metrics
            .set_pending_reversions(self.inner.pending.len() as i64);
        Some(entry.record)
    }

    /// Run a pending reversion immediately instead of waiting for its timer
    pub async fn revert_now(
        &self,
        target: &ObjectKey,
        field: ScaleField,
    ) -> Result<ReversionOutcome, ReversionError> {
        let record = self
            .cancel(target, field)
            .ok_or_else(|| ReversionError::NotPending(format!("{} {}", target, field)))?;
        self.inner.revert(&record.request).await
    }

    /// Restore a target from a request without scheduling
    pub async fn revert(&self, request: &ReversionRequest) -> Result<ReversionOutcome, ReversionError> {
        self.inner.revert(request).await
    }
}

impl SchedulerInner {
    async fn run(&self, record: &PendingReversion) {
        let request = &record.request;
        match self.revert(request).await {
            Ok(outcome) => {
                self.metrics.inc_reversions_completed();
                debug!(resource = %request.target, outcome = ?outcome, "Reversion finished");
            }
            Err(e) => {
                self.metrics.inc_reversions_failed();
                self.logger.log_reversion_failed(
                    &request.target.to_string(),
                    &request.field.to_string(),
                    &e.to_string(),
                );
            }
        }
    }

    async fn revert(&self, request: &ReversionRequest) -> Result<ReversionOutcome, ReversionError> {
        let field = request.field;
        let Some(current) = self.store.get_object(&request.target).await? else {
            debug!(resource = %request.target, "Target deleted before reversion");
            return Ok(ReversionOutcome::TargetGone);
        };

        let backup_name = request
            .backup
            .clone()
            .or_else(|| current.annotations.get(BACKUP_ANNOTATION).cloned());
        let annotation_value = current
            .annotations
            .get(field.annotation())
            .and_then(|v| v.parse::<i32>().ok());

        let (original, source) = match self.backup_value(request, backup_name.as_deref()).await {
            Some(value) => (value, ValueSource::Backup),
            None => match annotation_value {
                Some(value) => (value, ValueSource::Annotation),
                None => (request.original, ValueSource::Record),
            },
        };

        if let Some(annotated) = annotation_value.filter(|v| *v != original) {
            warn!(
                resource = %request.target,
                field = %field,
                annotation = annotated,
                restored = original,
                "Original-value annotation disagrees with backup"
            );
        }

        let has_marker = current.annotations.contains_key(field.annotation())
            || current.annotations.contains_key(BACKUP_ANNOTATION);
        if current.field_value(field) == Some(original) && !has_marker {
            return Ok(ReversionOutcome::AlreadyReverted);
        }

        let mutation = Mutation::new(field, original)
            .remove_annotation(field.annotation())
            .remove_annotation(BACKUP_ANNOTATION);
        self.store.apply_mutation(&request.target, &mutation).await?;

        self.logger.log_reversion_completed(
            &request.target.to_string(),
            &field.to_string(),
            original,
            source.as_str(),
        );
        Ok(ReversionOutcome::Reverted {
            value: original,
            source,
        })
    }

    async fn backup_value(&self, request: &ReversionRequest, name: Option<&str>) -> Option<i32> {
        let name = name?;
        let backup = match self.store.get_backup(&request.target.namespace, name).await {
            Ok(Some(backup)) => backup,
            Ok(None) => {
                debug!(resource = %request.target, backup = %name, "Backup missing");
                return None;
            }
            Err(e) => {
                warn!(resource = %request.target, backup = %name, error = %e, "Failed to read backup");
                return None;
            }
        };

        let errors = verify_backup(&backup);
        if !errors.is_empty() {
            warn!(
                resource = %request.target,
                backup = %name,
                errors = ?errors,
                "Backup failed verification"
            );
            return None;
        }
        original_value(&backup, request.field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryCluster;
    use crate::models::ORIGINAL_REPLICAS_ANNOTATION;

    fn request(target: &ObjectKey, original: i32) -> ReversionRequest {
        ReversionRequest {
            target: target.clone(),
            field: ScaleField::Replicas,
            original,
            backup: None,
            policy: PolicyKey::new("shop", "web-policy"),
        }
    }

    async fn remediate(cluster: &InMemoryCluster, target: &ObjectKey, value: i32, original: i32) {
        let mutation = Mutation::new(ScaleField::Replicas, value)
            .set_annotation(ORIGINAL_REPLICAS_ANNOTATION, original.to_string());
        cluster.apply_mutation(target, &mutation).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_reversion_restores_original() {
        let cluster = Arc::new(InMemoryCluster::new());
        let web = cluster.insert_deployment("shop", "web", 1);
        remediate(&cluster, &web, 3, 1).await;
        let scheduler = ReversionScheduler::new(cluster.clone());

        scheduler.schedule(request(&web, 1), Duration::from_secs(60));
        assert_eq!(scheduler.pending_count(), 1);

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(cluster.object(&web).unwrap().replicas(), Some(3));

        tokio::time::sleep(Duration::from_secs(2)).await;
        let object = cluster.object(&web).unwrap();
        assert_eq!(object.replicas(), Some(1));
        assert!(!object.annotations.contains_key(ORIGINAL_REPLICAS_ANNOTATION));
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reversion_is_idempotent() {
        let cluster = Arc::new(InMemoryCluster::new());
        let web = cluster.insert_deployment("shop", "web", 1);
        remediate(&cluster, &web, 3, 1).await;
        let scheduler = ReversionScheduler::new(cluster.clone());

        let first = scheduler.revert(&request(&web, 1)).await.unwrap();
        assert_eq!(
            first,
            ReversionOutcome::Reverted {
                value: 1,
                source: ValueSource::Annotation
            }
        );
        let writes = cluster.write_count();

        let second = scheduler.revert(&request(&web, 1)).await.unwrap();
        assert_eq!(second, ReversionOutcome::AlreadyReverted);
        assert_eq!(cluster.write_count(), writes);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleted_target_is_noop() {
        let cluster = Arc::new(InMemoryCluster::new());
        let web = cluster.insert_deployment("shop", "web", 3);
        let scheduler = ReversionScheduler::new(cluster.clone());

        scheduler.schedule(request(&web, 1), Duration::from_secs(10));
        cluster.remove_object(&web);
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(scheduler.pending_count(), 0);
        assert_eq!(
            scheduler.revert(&request(&web, 1)).await.unwrap(),
            ReversionOutcome::TargetGone
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_value_used_when_annotation_cleared() {
        let cluster = Arc::new(InMemoryCluster::new());
        let web = cluster.insert_deployment("shop", "web", 4);
        let scheduler = ReversionScheduler::new(cluster.clone());

        let outcome = scheduler.revert(&request(&web, 2)).await.unwrap();

        assert_eq!(
            outcome,
            ReversionOutcome::Reverted {
                value: 2,
                source: ValueSource::Record
            }
        );
        assert_eq!(cluster.object(&web).unwrap().replicas(), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_carries_first_original() {
        let cluster = Arc::new(InMemoryCluster::new());
        let web = cluster.insert_deployment("shop", "web", 1);
        remediate(&cluster, &web, 3, 1).await;
        let scheduler = ReversionScheduler::new(cluster.clone());

        let first = scheduler.schedule(request(&web, 1), Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(30)).await;
        // A second firing would have captured the remediated value
        let second = scheduler.schedule(request(&web, 3), Duration::from_secs(60));

        assert_ne!(first.id, second.id);
        assert_eq!(second.request.original, 1);
        assert_eq!(scheduler.pending().len(), 1);

        // The first timer is gone; nothing happens at t=60
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(cluster.object(&web).unwrap().replicas(), Some(3));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(cluster.object(&web).unwrap().replicas(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_and_revert_now() {
        let cluster = Arc::new(InMemoryCluster::new());
        let web = cluster.insert_deployment("shop", "web", 1);
        remediate(&cluster, &web, 3, 1).await;
        let scheduler = ReversionScheduler::new(cluster.clone());

        scheduler.schedule(request(&web, 1), Duration::from_secs(60));
        assert!(scheduler.cancel(&web, ScaleField::Replicas).is_some());
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(cluster.object(&web).unwrap().replicas(), Some(3));

        scheduler.schedule(request(&web, 1), Duration::from_secs(60));
        let outcome = scheduler.revert_now(&web, ScaleField::Replicas).await.unwrap();
        assert!(matches!(outcome, ReversionOutcome::Reverted { value: 1, .. }));
        assert!(matches!(
            scheduler.revert_now(&web, ScaleField::Replicas).await,
            Err(ReversionError::NotPending(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_is_contained() {
        let cluster = Arc::new(InMemoryCluster::new());
        let web = cluster.insert_deployment("shop", "web", 1);
        remediate(&cluster, &web, 3, 1).await;
        cluster.set_fail_writes(true);
        let scheduler = ReversionScheduler::new(cluster.clone());

        scheduler.schedule(request(&web, 1), Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(scheduler.pending_count(), 0);
        assert_eq!(cluster.object(&web).unwrap().replicas(), Some(3));
    }
}

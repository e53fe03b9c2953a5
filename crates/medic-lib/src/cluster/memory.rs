//! In-memory cluster store
//!
//! Backs unit and integration tests and dry runs. Counts target writes and can
//! be told to fail reads or writes so error paths are observable.

use super::{ClusterError, ClusterResult, ClusterStore, EventSink};
use crate::crd::{RemediationBackup, SelfRemediationPolicy, SelfRemediationPolicyStatus};
use crate::models::{
    ClusterObject, Mutation, ObjectKey, PolicyKey, ScaleField, ScaleSpec, ScaleTargetRef,
    TargetKind,
};
use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// An event captured by the in-memory sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub policy: PolicyKey,
    pub reason: String,
    pub message: String,
}

/// Build a workload object with the given replica count
pub fn workload(kind: TargetKind, namespace: &str, name: &str, replicas: i32) -> ClusterObject {
    ClusterObject {
        key: ObjectKey::new(kind, namespace, name),
        labels: BTreeMap::new(),
        annotations: BTreeMap::new(),
        scale: ScaleSpec::Workload {
            replicas: Some(replicas),
            selector: BTreeMap::from([("app".to_string(), name.to_string())]),
            container_requests: Vec::new(),
        },
        raw: json!({
            "apiVersion": "apps/v1",
            "kind": kind.as_str(),
            "metadata": { "name": name, "namespace": namespace },
            "spec": { "replicas": replicas },
        }),
    }
}

/// Build an autoscaler object scaling the given workload
pub fn autoscaler(
    namespace: &str,
    name: &str,
    min_replicas: Option<i32>,
    max_replicas: i32,
    target: &ObjectKey,
) -> ClusterObject {
    ClusterObject {
        key: ObjectKey::new(TargetKind::HorizontalPodAutoscaler, namespace, name),
        labels: BTreeMap::new(),
        annotations: BTreeMap::new(),
        scale: ScaleSpec::Autoscaler {
            min_replicas,
            max_replicas,
            scale_target: Some(ScaleTargetRef {
                kind: target.kind.as_str().to_string(),
                name: target.name.clone(),
            }),
        },
        raw: json!({
            "apiVersion": "autoscaling/v2",
            "kind": "HorizontalPodAutoscaler",
            "metadata": { "name": name, "namespace": namespace },
            "spec": {
                "minReplicas": min_replicas,
                "maxReplicas": max_replicas,
                "scaleTargetRef": { "kind": target.kind.as_str(), "name": target.name },
            },
        }),
    }
}

/// `DashMap` backed `ClusterStore` and `EventSink`
#[derive(Default)]
pub struct InMemoryCluster {
    objects: DashMap<ObjectKey, ClusterObject>,
    namespaces: DashMap<String, BTreeMap<String, String>>,
    quotas: DashMap<(String, String), BTreeMap<String, Quantity>>,
    policies: DashMap<PolicyKey, SelfRemediationPolicy>,
    backups: DashMap<(String, String), RemediationBackup>,
    events: Mutex<Vec<RecordedEvent>>,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
    fail_backups: AtomicBool,
    fail_reads: AtomicBool,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_object(&self, object: ClusterObject) {
        self.objects.insert(object.key.clone(), object);
    }

    pub fn insert_deployment(&self, namespace: &str, name: &str, replicas: i32) -> ObjectKey {
        let object = workload(TargetKind::Deployment, namespace, name, replicas);
        let key = object.key.clone();
        self.insert_object(object);
        key
    }

    pub fn insert_statefulset(&self, namespace: &str, name: &str, replicas: i32) -> ObjectKey {
        let object = workload(TargetKind::StatefulSet, namespace, name, replicas);
        let key = object.key.clone();
        self.insert_object(object);
        key
    }

    pub fn insert_hpa(
        &self,
        namespace: &str,
        name: &str,
        min_replicas: Option<i32>,
        max_replicas: i32,
        target: &ObjectKey,
    ) -> ObjectKey {
        let object = autoscaler(namespace, name, min_replicas, max_replicas, target);
        let key = object.key.clone();
        self.insert_object(object);
        key
    }

    pub fn insert_namespace(&self, name: &str, labels: &[(&str, &str)]) {
        let labels = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.namespaces.insert(name.to_string(), labels);
    }

    pub fn insert_quota(&self, namespace: &str, name: &str, hard: &[(&str, &str)]) {
        let hard = hard
            .iter()
            .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
            .collect();
        self.quotas
            .insert((namespace.to_string(), name.to_string()), hard);
    }

    pub fn insert_policy(&self, policy: SelfRemediationPolicy) {
        self.policies.insert(policy.key(), policy);
    }

    pub fn remove_object(&self, key: &ObjectKey) {
        self.objects.remove(key);
    }

    pub fn remove_policy(&self, key: &PolicyKey) {
        self.policies.remove(key);
    }

    /// Edit a stored object in place, bypassing the write counter
    pub fn edit_object(&self, key: &ObjectKey, edit: impl FnOnce(&mut ClusterObject)) {
        if let Some(mut object) = self.objects.get_mut(key) {
            edit(&mut object);
        }
    }

    pub fn object(&self, key: &ObjectKey) -> Option<ClusterObject> {
        self.objects.get(key).map(|o| o.clone())
    }

    pub fn policy(&self, key: &PolicyKey) -> Option<SelfRemediationPolicy> {
        self.policies.get(key).map(|p| p.clone())
    }

    pub fn backups(&self) -> Vec<RemediationBackup> {
        self.backups.iter().map(|b| b.value().clone()).collect()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Number of successful target writes
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_backups(&self, fail: bool) {
        self.fail_backups.store(fail, Ordering::SeqCst);
    }

    /// Fail object and namespace reads
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn check_read(&self) -> ClusterResult<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(ClusterError::Api("injected read failure".to_string()));
        }
        Ok(())
    }
}

fn apply_to_object(object: &mut ClusterObject, mutation: &Mutation) -> ClusterResult<()> {
    match (&mut object.scale, mutation.field) {
        (ScaleSpec::Workload { replicas, .. }, ScaleField::Replicas) => {
            *replicas = Some(mutation.value);
        }
        (ScaleSpec::Autoscaler { max_replicas, .. }, ScaleField::MaxReplicas) => {
            *max_replicas = mutation.value;
        }
        _ => {
            return Err(ClusterError::Unsupported(format!(
                "{} has no {} field",
                object.key.kind, mutation.field
            )))
        }
    }

    for (key, value) in &mutation.annotations {
        match value {
            Some(value) => {
                object.annotations.insert(key.clone(), value.clone());
            }
            None => {
                object.annotations.remove(key);
            }
        }
    }

    if let Some(field) = object.raw.pointer_mut(mutation.field.json_pointer()) {
        *field = Value::from(mutation.value);
    }
    if let Some(metadata) = object.raw.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.insert("annotations".to_string(), json!(object.annotations));
    }
    Ok(())
}

#[async_trait]
impl ClusterStore for InMemoryCluster {
    async fn get_object(&self, key: &ObjectKey) -> ClusterResult<Option<ClusterObject>> {
        self.check_read()?;
        Ok(self.object(key))
    }

    async fn list_autoscalers(&self, namespace: &str) -> ClusterResult<Vec<ClusterObject>> {
        self.check_read()?;
        Ok(self
            .objects
            .iter()
            .filter(|o| {
                o.key.kind == TargetKind::HorizontalPodAutoscaler && o.key.namespace == namespace
            })
            .map(|o| o.value().clone())
            .collect())
    }

    async fn apply_mutation(&self, key: &ObjectKey, mutation: &Mutation) -> ClusterResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ClusterError::Api("injected write failure".to_string()));
        }
        let mut object = self
            .objects
            .get_mut(key)
            .ok_or_else(|| ClusterError::NotFound(key.to_string()))?;
        apply_to_object(&mut object, mutation)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn namespace_labels(
        &self,
        name: &str,
    ) -> ClusterResult<Option<BTreeMap<String, String>>> {
        self.check_read()?;
        Ok(self.namespaces.get(name).map(|l| l.clone()))
    }

    async fn resource_quota(
        &self,
        namespace: &str,
        name: &str,
    ) -> ClusterResult<Option<BTreeMap<String, Quantity>>> {
        Ok(self
            .quotas
            .get(&(namespace.to_string(), name.to_string()))
            .map(|q| q.clone()))
    }

    async fn get_policy(
        &self,
        namespace: &str,
        name: &str,
    ) -> ClusterResult<Option<SelfRemediationPolicy>> {
        Ok(self.policy(&PolicyKey::new(namespace, name)))
    }

    async fn list_policies(&self) -> ClusterResult<Vec<SelfRemediationPolicy>> {
        Ok(self.policies.iter().map(|p| p.value().clone()).collect())
    }

    async fn update_policy_status(
        &self,
        namespace: &str,
        name: &str,
        status: &SelfRemediationPolicyStatus,
    ) -> ClusterResult<()> {
        let key = PolicyKey::new(namespace, name);
        let mut policy = self
            .policies
            .get_mut(&key)
            .ok_or_else(|| ClusterError::NotFound(key.to_string()))?;
        policy.status = Some(status.clone());
        Ok(())
    }

    async fn create_backup(&self, backup: &RemediationBackup) -> ClusterResult<()> {
        if self.fail_backups.load(Ordering::SeqCst) {
            return Err(ClusterError::Api("injected backup failure".to_string()));
        }
        let key = (backup.namespace().unwrap_or_default(), backup.name_any());
        if self.backups.contains_key(&key) {
            return Err(ClusterError::Conflict(format!("backup {} exists", key.1)));
        }
        self.backups.insert(key, backup.clone());
        Ok(())
    }

    async fn get_backup(
        &self,
        namespace: &str,
        name: &str,
    ) -> ClusterResult<Option<RemediationBackup>> {
        Ok(self
            .backups
            .get(&(namespace.to_string(), name.to_string()))
            .map(|b| b.clone()))
    }
}

#[async_trait]
impl EventSink for InMemoryCluster {
    async fn warning(
        &self,
        policy: &SelfRemediationPolicy,
        reason: &str,
        message: &str,
    ) -> ClusterResult<()> {
        let event = RecordedEvent {
            policy: policy.key(),
            reason: reason.to_string(),
            message: message.to_string(),
        };
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ORIGINAL_REPLICAS_ANNOTATION;

    #[tokio::test]
    async fn test_apply_mutation_updates_replicas_and_raw() {
        let cluster = InMemoryCluster::new();
        let key = cluster.insert_deployment("shop", "web", 1);

        let mutation = Mutation::new(ScaleField::Replicas, 3)
            .set_annotation(ORIGINAL_REPLICAS_ANNOTATION, "1");
        cluster.apply_mutation(&key, &mutation).await.unwrap();

        let object = cluster.object(&key).unwrap();
        assert_eq!(object.replicas(), Some(3));
        assert_eq!(object.raw["spec"]["replicas"], 3);
        assert_eq!(object.annotations[ORIGINAL_REPLICAS_ANNOTATION], "1");
        assert_eq!(cluster.write_count(), 1);
    }

    #[tokio::test]
    async fn test_apply_mutation_rejects_wrong_field() {
        let cluster = InMemoryCluster::new();
        let key = cluster.insert_deployment("shop", "web", 1);

        let result = cluster
            .apply_mutation(&key, &Mutation::new(ScaleField::MaxReplicas, 3))
            .await;

        assert!(matches!(result, Err(ClusterError::Unsupported(_))));
        assert_eq!(cluster.write_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let cluster = InMemoryCluster::new();
        let key = ObjectKey::new(TargetKind::Deployment, "shop", "ghost");

        assert!(cluster.get_object(&key).await.unwrap().is_none());
        let err = cluster
            .apply_mutation(&key, &Mutation::new(ScaleField::Replicas, 2))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_injected_write_failure() {
        let cluster = InMemoryCluster::new();
        let key = cluster.insert_deployment("shop", "web", 1);
        cluster.set_fail_writes(true);

        assert!(cluster
            .apply_mutation(&key, &Mutation::new(ScaleField::Replicas, 2))
            .await
            .is_err());
        assert_eq!(cluster.object(&key).unwrap().replicas(), Some(1));
    }

    #[tokio::test]
    async fn test_list_autoscalers_filters_namespace() {
        let cluster = InMemoryCluster::new();
        let web = cluster.insert_deployment("shop", "web", 1);
        cluster.insert_hpa("shop", "web-hpa", Some(1), 4, &web);
        cluster.insert_hpa("other", "web-hpa", Some(1), 4, &web);

        let hpas = cluster.list_autoscalers("shop").await.unwrap();
        assert_eq!(hpas.len(), 1);
        assert!(hpas[0].scales(&web));
    }
}

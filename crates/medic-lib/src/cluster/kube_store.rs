//! Kubernetes API backed cluster store and event sink

use super::{ClusterError, ClusterResult, ClusterStore, EventSink, KindRegistry};
use crate::crd::{RemediationBackup, SelfRemediationPolicy, SelfRemediationPolicyStatus};
use crate::models::{ClusterObject, Mutation, ObjectKey, TargetKind};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, ResourceQuota};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::debug;

/// `ClusterStore` implementation talking to a live API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    registry: KindRegistry,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            registry: KindRegistry::new(),
        }
    }

    pub fn with_registry(client: Client, registry: KindRegistry) -> Self {
        Self { client, registry }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get_object(&self, key: &ObjectKey) -> ClusterResult<Option<ClusterObject>> {
        let handle = self.registry.get(key.kind)?;
        handle.fetch(&self.client, &key.namespace, &key.name).await
    }

    async fn list_autoscalers(&self, namespace: &str) -> ClusterResult<Vec<ClusterObject>> {
        let handle = self.registry.get(TargetKind::HorizontalPodAutoscaler)?;
        handle.list(&self.client, namespace).await
    }

    async fn apply_mutation(&self, key: &ObjectKey, mutation: &Mutation) -> ClusterResult<()> {
        let handle = self.registry.get(key.kind)?;
        debug!(resource = %key, field = %mutation.field, value = mutation.value, "Patching target");
        handle
            .patch(&self.client, &key.namespace, &key.name, mutation)
            .await
    }

    async fn namespace_labels(
        &self,
        name: &str,
    ) -> ClusterResult<Option<BTreeMap<String, String>>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?.map(|ns| ns.labels().clone()))
    }

    async fn resource_quota(
        &self,
        namespace: &str,
        name: &str,
    ) -> ClusterResult<Option<BTreeMap<String, Quantity>>> {
        let api: Api<ResourceQuota> = Api::namespaced(self.client.clone(), namespace);
        let Some(quota) = api.get_opt(name).await? else {
            return Ok(None);
        };

        // Enforced limits live in status; fall back to spec before the quota
        // controller has populated it
        let hard = quota
            .status
            .and_then(|s| s.hard)
            .or_else(|| quota.spec.and_then(|s| s.hard))
            .unwrap_or_default();
        Ok(Some(hard))
    }

    async fn get_policy(
        &self,
        namespace: &str,
        name: &str,
    ) -> ClusterResult<Option<SelfRemediationPolicy>> {
        let api: Api<SelfRemediationPolicy> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_policies(&self) -> ClusterResult<Vec<SelfRemediationPolicy>> {
        let api: Api<SelfRemediationPolicy> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn update_policy_status(
        &self,
        namespace: &str,
        name: &str,
        status: &SelfRemediationPolicyStatus,
    ) -> ClusterResult<()> {
        let api: Api<SelfRemediationPolicy> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn create_backup(&self, backup: &RemediationBackup) -> ClusterResult<()> {
        let namespace = backup
            .namespace()
            .ok_or_else(|| ClusterError::Unsupported("backup without namespace".to_string()))?;
        let name = backup.name_any();
        let api: Api<RemediationBackup> = Api::namespaced(self.client.clone(), &namespace);

        api.create(&PostParams::default(), backup).await?;

        // Status is a subresource and is dropped on create
        if let Some(status) = &backup.status {
            let patch = json!({ "status": status });
            api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
        }
        Ok(())
    }

    async fn get_backup(
        &self,
        namespace: &str,
        name: &str,
    ) -> ClusterResult<Option<RemediationBackup>> {
        let api: Api<RemediationBackup> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}

/// Publishes Kubernetes events against the policy that triggered them
#[derive(Clone)]
pub struct KubeEventSink {
    client: Client,
    reporter: Reporter,
}

impl KubeEventSink {
    pub fn new(client: Client, controller: impl Into<String>) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: controller.into(),
                instance: std::env::var("POD_NAME").ok(),
            },
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn warning(
        &self,
        policy: &SelfRemediationPolicy,
        reason: &str,
        message: &str,
    ) -> ClusterResult<()> {
        let recorder = Recorder::new(
            self.client.clone(),
            self.reporter.clone(),
            policy.object_ref(&()),
        );
        recorder
            .publish(Event {
                type_: EventType::Warning,
                reason: reason.to_string(),
                note: Some(message.to_string()),
                action: "Remediate".to_string(),
                secondary: None,
            })
            .await?;
        Ok(())
    }
}

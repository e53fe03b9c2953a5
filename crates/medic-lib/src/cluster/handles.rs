//! Per-kind object handles for the Kubernetes backend
//!
//! Each handle converts its typed object into a `ClusterObject` and renders
//! a `Mutation` as a JSON merge patch. `KindRegistry` selects the handle by
//! `TargetKind` so no other code switches on concrete types.

use super::{ClusterError, ClusterResult};
use crate::models::{ClusterObject, Mutation, ObjectKey, ScaleField, ScaleSpec, ScaleTargetRef, TargetKind};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

/// Capability interface over one concrete resource kind
#[async_trait]
pub trait KindHandle: Send + Sync {
    fn kind(&self) -> TargetKind;

    async fn fetch(
        &self,
        client: &Client,
        namespace: &str,
        name: &str,
    ) -> ClusterResult<Option<ClusterObject>>;

    async fn list(&self, client: &Client, namespace: &str) -> ClusterResult<Vec<ClusterObject>>;

    /// The scale field this kind exposes
    fn scale_field(&self) -> ScaleField;

    async fn patch(
        &self,
        client: &Client,
        namespace: &str,
        name: &str,
        mutation: &Mutation,
    ) -> ClusterResult<()>;
}

/// Render a mutation as a JSON merge patch for a kind exposing `field`
pub fn merge_patch(kind: TargetKind, field: ScaleField, mutation: &Mutation) -> ClusterResult<Value> {
    if mutation.field != field {
        return Err(ClusterError::Unsupported(format!(
            "{} has no {} field",
            kind, mutation.field
        )));
    }

    let spec_key = match field {
        ScaleField::Replicas => "replicas",
        ScaleField::MaxReplicas => "maxReplicas",
    };

    let mut patch = json!({ "spec": { spec_key: mutation.value } });
    if !mutation.annotations.is_empty() {
        let annotations: Map<String, Value> = mutation
            .annotations
            .iter()
            .map(|(key, value)| {
                let value = value.clone().map(Value::String).unwrap_or(Value::Null);
                (key.clone(), value)
            })
            .collect();
        patch["metadata"] = json!({ "annotations": annotations });
    }
    Ok(patch)
}

fn raw_snapshot<K: Serialize>(obj: &K) -> ClusterResult<Value> {
    let mut raw = serde_json::to_value(obj)?;
    if let Some(metadata) = raw.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.remove("managedFields");
    }
    Ok(raw)
}

fn object_key(kind: TargetKind, meta: &ObjectMeta) -> ObjectKey {
    ObjectKey::new(
        kind,
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

fn workload_object<K: Serialize>(
    kind: TargetKind,
    obj: &K,
    meta: &ObjectMeta,
    replicas: Option<i32>,
    selector: &LabelSelector,
    template: &PodTemplateSpec,
) -> ClusterResult<ClusterObject> {
    let container_requests = template
        .spec
        .as_ref()
        .map(|spec| {
            spec.containers
                .iter()
                .map(|c| {
                    c.resources
                        .as_ref()
                        .and_then(|r| r.requests.clone())
                        .unwrap_or_default()
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(ClusterObject {
        key: object_key(kind, meta),
        labels: meta.labels.clone().unwrap_or_default(),
        annotations: meta.annotations.clone().unwrap_or_default(),
        scale: ScaleSpec::Workload {
            replicas,
            selector: selector.match_labels.clone().unwrap_or_default(),
            container_requests,
        },
        raw: raw_snapshot(obj)?,
    })
}

async fn fetch_typed<K>(client: &Client, namespace: &str, name: &str) -> ClusterResult<Option<K>>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    Ok(api.get_opt(name).await?)
}

async fn list_typed<K>(client: &Client, namespace: &str) -> ClusterResult<Vec<K>>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    Ok(api.list(&ListParams::default()).await?.items)
}

async fn patch_typed<K>(client: &Client, namespace: &str, name: &str, patch: Value) -> ClusterResult<()>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

pub struct DeploymentHandle;

impl DeploymentHandle {
    fn convert(deployment: &Deployment) -> ClusterResult<ClusterObject> {
        let spec = deployment.spec.clone().unwrap_or_default();
        workload_object(
            TargetKind::Deployment,
            deployment,
            &deployment.metadata,
            spec.replicas,
            &spec.selector,
            &spec.template,
        )
    }
}

#[async_trait]
impl KindHandle for DeploymentHandle {
    fn kind(&self) -> TargetKind {
        TargetKind::Deployment
    }

    async fn fetch(&self, client: &Client, namespace: &str, name: &str) -> ClusterResult<Option<ClusterObject>> {
        fetch_typed::<Deployment>(client, namespace, name)
            .await?
            .as_ref()
            .map(Self::convert)
            .transpose()
    }

    async fn list(&self, client: &Client, namespace: &str) -> ClusterResult<Vec<ClusterObject>> {
        list_typed::<Deployment>(client, namespace)
            .await?
            .iter()
            .map(Self::convert)
            .collect()
    }

    fn scale_field(&self) -> ScaleField {
        ScaleField::Replicas
    }

    async fn patch(&self, client: &Client, namespace: &str, name: &str, mutation: &Mutation) -> ClusterResult<()> {
        let patch = merge_patch(self.kind(), self.scale_field(), mutation)?;
        patch_typed::<Deployment>(client, namespace, name, patch).await
    }
}

pub struct StatefulSetHandle;

impl StatefulSetHandle {
    fn convert(statefulset: &StatefulSet) -> ClusterResult<ClusterObject> {
        let spec = statefulset.spec.clone().unwrap_or_default();
        workload_object(
            TargetKind::StatefulSet,
            statefulset,
            &statefulset.metadata,
            spec.replicas,
            &spec.selector,
            &spec.template,
        )
    }
}

#[async_trait]
impl KindHandle for StatefulSetHandle {
    fn kind(&self) -> TargetKind {
        TargetKind::StatefulSet
    }

    async fn fetch(&self, client: &Client, namespace: &str, name: &str) -> ClusterResult<Option<ClusterObject>> {
        fetch_typed::<StatefulSet>(client, namespace, name)
            .await?
            .as_ref()
            .map(Self::convert)
            .transpose()
    }

    async fn list(&self, client: &Client, namespace: &str) -> ClusterResult<Vec<ClusterObject>> {
        list_typed::<StatefulSet>(client, namespace)
            .await?
            .iter()
            .map(Self::convert)
            .collect()
    }

    fn scale_field(&self) -> ScaleField {
        ScaleField::Replicas
    }

    async fn patch(&self, client: &Client, namespace: &str, name: &str, mutation: &Mutation) -> ClusterResult<()> {
        let patch = merge_patch(self.kind(), self.scale_field(), mutation)?;
        patch_typed::<StatefulSet>(client, namespace, name, patch).await
    }
}

pub struct AutoscalerHandle;

impl AutoscalerHandle {
    fn convert(hpa: &HorizontalPodAutoscaler) -> ClusterResult<ClusterObject> {
        let spec = hpa.spec.clone().unwrap_or_default();
        let scale_target = if spec.scale_target_ref.name.is_empty() {
            None
        } else {
            Some(ScaleTargetRef {
                kind: spec.scale_target_ref.kind.clone(),
                name: spec.scale_target_ref.name.clone(),
            })
        };

        Ok(ClusterObject {
            key: object_key(TargetKind::HorizontalPodAutoscaler, &hpa.metadata),
            labels: hpa.metadata.labels.clone().unwrap_or_default(),
            annotations: hpa.metadata.annotations.clone().unwrap_or_default(),
            scale: ScaleSpec::Autoscaler {
                min_replicas: spec.min_replicas,
                max_replicas: spec.max_replicas,
                scale_target,
            },
            raw: raw_snapshot(hpa)?,
        })
    }
}

#[async_trait]
impl KindHandle for AutoscalerHandle {
    fn kind(&self) -> TargetKind {
        TargetKind::HorizontalPodAutoscaler
    }

    async fn fetch(&self, client: &Client, namespace: &str, name: &str) -> ClusterResult<Option<ClusterObject>> {
        fetch_typed::<HorizontalPodAutoscaler>(client, namespace, name)
            .await?
            .as_ref()
            .map(Self::convert)
            .transpose()
    }

    async fn list(&self, client: &Client, namespace: &str) -> ClusterResult<Vec<ClusterObject>> {
        list_typed::<HorizontalPodAutoscaler>(client, namespace)
            .await?
            .iter()
            .map(Self::convert)
            .collect()
    }

    fn scale_field(&self) -> ScaleField {
        ScaleField::MaxReplicas
    }

    async fn patch(&self, client: &Client, namespace: &str, name: &str, mutation: &Mutation) -> ClusterResult<()> {
        let patch = merge_patch(self.kind(), self.scale_field(), mutation)?;
        patch_typed::<HorizontalPodAutoscaler>(client, namespace, name, patch).await
    }
}

/// Kind-keyed registry of object handles
#[derive(Clone)]
pub struct KindRegistry {
    handles: HashMap<TargetKind, Arc<dyn KindHandle>>,
}

impl Default for KindRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl KindRegistry {
    /// Registry with the Deployment, StatefulSet and HorizontalPodAutoscaler handles
    pub fn new() -> Self {
        let mut registry = Self {
            handles: HashMap::new(),
        };
        registry.register(Arc::new(DeploymentHandle));
        registry.register(Arc::new(StatefulSetHandle));
        registry.register(Arc::new(AutoscalerHandle));
        registry
    }

    pub fn register(&mut self, handle: Arc<dyn KindHandle>) {
        self.handles.insert(handle.kind(), handle);
    }

    pub fn get(&self, kind: TargetKind) -> ClusterResult<Arc<dyn KindHandle>> {
        self.handles
            .get(&kind)
            .cloned()
            .ok_or_else(|| ClusterError::Unsupported(format!("no handle registered for {}", kind)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ORIGINAL_REPLICAS_ANNOTATION;
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::api::autoscaling::v2::{CrossVersionObjectReference, HorizontalPodAutoscalerSpec};
    use k8s_openapi::api::core::v1::{Container, PodSpec, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use std::collections::BTreeMap;

    #[test]
    fn test_merge_patch_sets_replicas_and_annotations() {
        let mutation = Mutation::new(ScaleField::Replicas, 3)
            .set_annotation(ORIGINAL_REPLICAS_ANNOTATION, "1")
            .remove_annotation("kubemedic.io/backup");

        let patch = merge_patch(TargetKind::Deployment, ScaleField::Replicas, &mutation).unwrap();

        assert_eq!(patch["spec"]["replicas"], 3);
        assert_eq!(patch["metadata"]["annotations"][ORIGINAL_REPLICAS_ANNOTATION], "1");
        assert!(patch["metadata"]["annotations"]["kubemedic.io/backup"].is_null());
    }

    #[test]
    fn test_merge_patch_rejects_foreign_field() {
        let mutation = Mutation::new(ScaleField::Replicas, 3);
        let result = merge_patch(
            TargetKind::HorizontalPodAutoscaler,
            ScaleField::MaxReplicas,
            &mutation,
        );
        assert!(matches!(result, Err(ClusterError::Unsupported(_))));
    }

    #[test]
    fn test_deployment_conversion() {
        let mut requests = BTreeMap::new();
        requests.insert("cpu".to_string(), Quantity("250m".to_string()));
        let deployment = Deployment {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("shop".to_string()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(2),
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "app".to_string(),
                            resources: Some(ResourceRequirements {
                                requests: Some(requests),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        };

        let object = DeploymentHandle::convert(&deployment).unwrap();

        assert_eq!(object.key, ObjectKey::new(TargetKind::Deployment, "shop", "web"));
        assert_eq!(object.replicas(), Some(2));
        assert_eq!(object.raw["spec"]["replicas"], 2);
        match object.scale {
            ScaleSpec::Workload { container_requests, .. } => {
                assert_eq!(container_requests.len(), 1);
                assert_eq!(container_requests[0]["cpu"].0, "250m");
            }
            other => panic!("unexpected scale spec {:?}", other),
        }
    }

    #[test]
    fn test_autoscaler_conversion() {
        let hpa = HorizontalPodAutoscaler {
            metadata: ObjectMeta {
                name: Some("web-hpa".to_string()),
                namespace: Some("shop".to_string()),
                ..Default::default()
            },
            spec: Some(HorizontalPodAutoscalerSpec {
                max_replicas: 5,
                min_replicas: Some(2),
                scale_target_ref: CrossVersionObjectReference {
                    api_version: Some("apps/v1".to_string()),
                    kind: "Deployment".to_string(),
                    name: "web".to_string(),
                },
                ..Default::default()
            }),
            ..Default::default()
        };

        let object = AutoscalerHandle::convert(&hpa).unwrap();

        assert_eq!(object.autoscaler_bounds(), Some((Some(2), 5)));
        assert!(object.scales(&ObjectKey::new(TargetKind::Deployment, "shop", "web")));
    }

    #[test]
    fn test_registry_resolves_every_kind() {
        let registry = KindRegistry::new();
        for kind in [
            TargetKind::Deployment,
            TargetKind::StatefulSet,
            TargetKind::HorizontalPodAutoscaler,
        ] {
            assert_eq!(registry.get(kind).unwrap().kind(), kind);
        }
    }
}

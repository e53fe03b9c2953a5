//! Target resolution and quota arithmetic
//!
//! Shared by the action executor and the admission validator so a policy
//! that passes admission resolves to the same objects at execution time.

use crate::cluster::{ClusterError, ClusterStore, COMPUTE_QUOTA_NAME};
use crate::crd::Target;
use crate::models::{ClusterObject, ObjectKey, ScaleField, ScaleSpec, TargetKind};
use crate::quantity::{parse_quantity, parse_resource_list, QuantityError};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("target kind and name must not be empty")]
    MissingField,

    #[error("resource type {0} is not allowed")]
    KindNotAllowed(String),

    #[error("target {0} not found")]
    NotFound(ObjectKey),

    #[error("target {0} is protected from remediation")]
    Protected(ObjectKey),

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// A policy target resolved against the cluster
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    /// The object the action names
    pub object: ClusterObject,
    /// Autoscaler governing the workload, or the object itself for HPA targets
    pub autoscaler: Option<ClusterObject>,
    /// Workload whose pods are measured, or the HPA's scale target
    pub workload: Option<ClusterObject>,
}

impl ResolvedTarget {
    pub fn key(&self) -> &ObjectKey {
        &self.object.key
    }

    /// Object whose usage conditions are measured against
    pub fn metrics_target(&self) -> Option<&ClusterObject> {
        self.workload.as_ref()
    }

    /// Scale field an action writes on the named object
    pub fn scale_field(&self) -> ScaleField {
        if self.object.key.kind.is_workload() {
            ScaleField::Replicas
        } else {
            ScaleField::MaxReplicas
        }
    }

    /// Current replica count, or maxReplicas for autoscaler targets
    pub fn current_value(&self) -> i32 {
        self.object.field_value(self.scale_field()).unwrap_or(1)
    }
}

/// Resolves policy targets to cluster objects
#[derive(Clone)]
pub struct TargetResolver {
    store: Arc<dyn ClusterStore>,
}

impl TargetResolver {
    pub fn new(store: Arc<dyn ClusterStore>) -> Self {
        Self { store }
    }

    /// Validate a target's kind and name and build its key
    pub fn target_key(target: &Target, policy_namespace: &str) -> Result<ObjectKey, ResolveError> {
        if target.kind.trim().is_empty() || target.name.trim().is_empty() {
            return Err(ResolveError::MissingField);
        }
        let kind = TargetKind::parse(&target.kind)
            .ok_or_else(|| ResolveError::KindNotAllowed(target.kind.clone()))?;
        Ok(ObjectKey::new(
            kind,
            target.namespace_or(policy_namespace),
            target.name.trim(),
        ))
    }

    /// Resolve a target to an existing, unprotected object plus its
    /// governing autoscaler and measured workload
    pub async fn resolve(
        &self,
        target: &Target,
        policy_namespace: &str,
    ) -> Result<ResolvedTarget, ResolveError> {
        let key = Self::target_key(target, policy_namespace)?;
        self.resolve_key(&key).await
    }

    pub async fn resolve_key(&self, key: &ObjectKey) -> Result<ResolvedTarget, ResolveError> {
        let object = self
            .store
            .get_object(key)
            .await?
            .ok_or_else(|| ResolveError::NotFound(key.clone()))?;
        if object.is_protected() {
            return Err(ResolveError::Protected(key.clone()));
        }

        match key.kind {
            TargetKind::Deployment | TargetKind::StatefulSet => {
                let autoscaler = self.find_autoscaler(key).await?;
                Ok(ResolvedTarget {
                    workload: Some(object.clone()),
                    autoscaler,
                    object,
                })
            }
            TargetKind::HorizontalPodAutoscaler => {
                let workload = self.scale_target(&object).await?;
                Ok(ResolvedTarget {
                    autoscaler: Some(object.clone()),
                    workload,
                    object,
                })
            }
        }
    }

    /// First autoscaler in the workload's namespace whose scale target is the workload
    pub async fn find_autoscaler(
        &self,
        workload: &ObjectKey,
    ) -> Result<Option<ClusterObject>, ClusterError> {
        let autoscalers = self.store.list_autoscalers(&workload.namespace).await?;
        Ok(autoscalers.into_iter().find(|hpa| hpa.scales(workload)))
    }

    async fn scale_target(
        &self,
        autoscaler: &ClusterObject,
    ) -> Result<Option<ClusterObject>, ClusterError> {
        let ScaleSpec::Autoscaler {
            scale_target: Some(target),
            ..
        } = &autoscaler.scale
        else {
            return Ok(None);
        };
        let Some(kind) = TargetKind::parse(&target.kind).filter(TargetKind::is_workload) else {
            return Ok(None);
        };
        let key = ObjectKey::new(kind, autoscaler.key.namespace.clone(), target.name.clone());
        self.store.get_object(&key).await
    }

    /// Hard limits of the namespace compute quota, if one exists
    pub async fn compute_quota(
        &self,
        namespace: &str,
    ) -> Result<Option<BTreeMap<String, Quantity>>, ClusterError> {
        self.store.resource_quota(namespace, COMPUTE_QUOTA_NAME).await
    }
}

/// Summed resource requests of one replica of a workload
pub fn per_replica_requests(workload: &ClusterObject) -> Result<BTreeMap<String, f64>, QuantityError> {
    let mut total = BTreeMap::new();
    if let ScaleSpec::Workload {
        container_requests, ..
    } = &workload.scale
    {
        for requests in container_requests {
            for (name, value) in parse_resource_list(requests)? {
                *total.entry(name).or_insert(0.0) += value;
            }
        }
    }
    Ok(total)
}

/// A quota line the requested replica count would exceed
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaViolation {
    pub resource: String,
    pub requested: f64,
    pub hard: f64,
}

/// First quota line exceeded by `replicas` copies of `requests`.
///
/// Quota keys match both the bare resource name (`cpu`) and the
/// `requests.`-prefixed form (`requests.cpu`).
pub fn quota_violation(
    requests: &BTreeMap<String, f64>,
    replicas: i32,
    hard: &BTreeMap<String, Quantity>,
) -> Result<Option<QuotaViolation>, QuantityError> {
    for (name, limit) in hard {
        let resource = name.strip_prefix("requests.").unwrap_or(name);
        let Some(per_replica) = requests.get(resource) else {
            continue;
        };
        let requested = per_replica * f64::from(replicas.max(0));
        let hard = parse_quantity(&limit.0)?;
        if requested > hard {
            return Ok(Some(QuotaViolation {
                resource: name.clone(),
                requested,
                hard,
            }));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryCluster;
    use crate::models::PROTECTED_LABEL;

    fn target(kind: &str, name: &str) -> Target {
        Target {
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: None,
        }
    }

    fn requests(pairs: &[(&str, &str)]) -> BTreeMap<String, Quantity> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
            .collect()
    }

    #[test]
    fn test_target_key_validation() {
        assert!(matches!(
            TargetResolver::target_key(&target("", "web"), "shop"),
            Err(ResolveError::MissingField)
        ));
        assert!(matches!(
            TargetResolver::target_key(&target("DaemonSet", "agent"), "shop"),
            Err(ResolveError::KindNotAllowed(_))
        ));
        assert_eq!(
            TargetResolver::target_key(&target("deployment", "web"), "shop").unwrap(),
            ObjectKey::new(TargetKind::Deployment, "shop", "web")
        );
    }

    #[tokio::test]
    async fn test_resolve_workload_finds_autoscaler() {
        let cluster = Arc::new(InMemoryCluster::new());
        let web = cluster.insert_deployment("shop", "web", 2);
        cluster.insert_hpa("shop", "web-hpa", Some(1), 4, &web);
        let resolver = TargetResolver::new(cluster.clone());

        let resolved = resolver.resolve(&target("Deployment", "web"), "shop").await.unwrap();

        assert_eq!(resolved.key(), &web);
        assert_eq!(resolved.current_value(), 2);
        assert_eq!(resolved.scale_field(), ScaleField::Replicas);
        assert_eq!(
            resolved.autoscaler.map(|a| a.key.name),
            Some("web-hpa".to_string())
        );
    }

    #[tokio::test]
    async fn test_resolve_autoscaler_finds_scale_target() {
        let cluster = Arc::new(InMemoryCluster::new());
        let web = cluster.insert_deployment("shop", "web", 2);
        cluster.insert_hpa("shop", "web-hpa", Some(1), 4, &web);
        let resolver = TargetResolver::new(cluster.clone());

        let resolved = resolver
            .resolve(&target("HorizontalPodAutoscaler", "web-hpa"), "shop")
            .await
            .unwrap();

        assert_eq!(resolved.scale_field(), ScaleField::MaxReplicas);
        assert_eq!(resolved.current_value(), 4);
        assert_eq!(resolved.metrics_target().map(|w| &w.key), Some(&web));
    }

    #[tokio::test]
    async fn test_resolve_missing_and_protected() {
        let cluster = Arc::new(InMemoryCluster::new());
        let web = cluster.insert_deployment("shop", "web", 1);
        cluster.edit_object(&web, |o| {
            o.labels.insert(PROTECTED_LABEL.to_string(), "true".to_string());
        });
        let resolver = TargetResolver::new(cluster.clone());

        assert!(matches!(
            resolver.resolve(&target("Deployment", "ghost"), "shop").await,
            Err(ResolveError::NotFound(_))
        ));
        assert!(matches!(
            resolver.resolve(&target("Deployment", "web"), "shop").await,
            Err(ResolveError::Protected(_))
        ));
    }

    #[test]
    fn test_quota_arithmetic() {
        let mut workload = crate::cluster::memory::workload(TargetKind::Deployment, "shop", "web", 1);
        if let ScaleSpec::Workload {
            container_requests, ..
        } = &mut workload.scale
        {
            container_requests.push(requests(&[("cpu", "500m"), ("memory", "256Mi")]));
            container_requests.push(requests(&[("cpu", "250m")]));
        }

        let per_replica = per_replica_requests(&workload).unwrap();
        assert_eq!(per_replica["cpu"], 0.75);

        let hard = requests(&[("requests.cpu", "2")]);
        assert_eq!(quota_violation(&per_replica, 2, &hard).unwrap(), None);

        let violation = quota_violation(&per_replica, 3, &hard).unwrap().unwrap();
        assert_eq!(violation.resource, "requests.cpu");
        assert_eq!(violation.requested, 2.25);

        let bare = requests(&[("memory", "512Mi"), ("pods", "10")]);
        assert_eq!(quota_violation(&per_replica, 2, &bare).unwrap(), None);
        assert!(quota_violation(&per_replica, 3, &bare).unwrap().is_some());
    }
}

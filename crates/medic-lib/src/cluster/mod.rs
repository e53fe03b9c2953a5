//! Cluster store abstraction
//!
//! The engine treats the Kubernetes API as a possibly-failing object store.
//! `KubeStore` talks to a real API server through a kind-keyed registry of
//! object handles; `InMemoryCluster` backs tests and dry runs.

mod handles;
mod kube_store;
pub mod memory;

pub use handles::{AutoscalerHandle, DeploymentHandle, KindHandle, KindRegistry, StatefulSetHandle};
pub use kube_store::{KubeEventSink, KubeStore};
pub use memory::{InMemoryCluster, RecordedEvent};

use crate::crd::{RemediationBackup, SelfRemediationPolicy, SelfRemediationPolicyStatus};
use crate::models::{ClusterObject, Mutation, ObjectKey};
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;
use thiserror::Error;

pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors from cluster reads and writes
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("cluster API error: {0}")]
    Api(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }
}

impl From<kube::Error> for ClusterError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(response) if response.code == 404 => {
                ClusterError::NotFound(response.message.clone())
            }
            kube::Error::Api(response) if response.code == 409 => {
                ClusterError::Conflict(response.message.clone())
            }
            _ => ClusterError::Api(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        ClusterError::Serialization(err.to_string())
    }
}

/// Name of the namespace quota consulted by the admission gate
pub const COMPUTE_QUOTA_NAME: &str = "compute-resources";

/// Object store operations the engine depends on
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Fetch a target object; `Ok(None)` when it does not exist
    async fn get_object(&self, key: &ObjectKey) -> ClusterResult<Option<ClusterObject>>;

    /// All autoscalers in a namespace
    async fn list_autoscalers(&self, namespace: &str) -> ClusterResult<Vec<ClusterObject>>;

    /// Apply one mutation to a target in a single write
    async fn apply_mutation(&self, key: &ObjectKey, mutation: &Mutation) -> ClusterResult<()>;

    /// Labels of a namespace; `Ok(None)` when the namespace does not exist
    async fn namespace_labels(&self, name: &str)
        -> ClusterResult<Option<BTreeMap<String, String>>>;

    /// Hard limits of a ResourceQuota; `Ok(None)` when it does not exist
    async fn resource_quota(
        &self,
        namespace: &str,
        name: &str,
    ) -> ClusterResult<Option<BTreeMap<String, Quantity>>>;

    async fn get_policy(
        &self,
        namespace: &str,
        name: &str,
    ) -> ClusterResult<Option<SelfRemediationPolicy>>;

    async fn list_policies(&self) -> ClusterResult<Vec<SelfRemediationPolicy>>;

    async fn update_policy_status(
        &self,
        namespace: &str,
        name: &str,
        status: &SelfRemediationPolicyStatus,
    ) -> ClusterResult<()>;

    /// Persist a backup including its status block
    async fn create_backup(&self, backup: &RemediationBackup) -> ClusterResult<()>;

    async fn get_backup(
        &self,
        namespace: &str,
        name: &str,
    ) -> ClusterResult<Option<RemediationBackup>>;
}

/// Sink for human-facing cluster events about a policy
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn warning(
        &self,
        policy: &SelfRemediationPolicy,
        reason: &str,
        message: &str,
    ) -> ClusterResult<()>;
}

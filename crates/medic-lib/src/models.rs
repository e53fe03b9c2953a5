//! Core data models shared by the evaluator, executor, reversion scheduler
//! and admission validator

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Annotation holding the replica count captured before a scale action
pub const ORIGINAL_REPLICAS_ANNOTATION: &str = "kubemedic.io/original-replicas";

/// Annotation holding the autoscaler maxReplicas captured before an HPA adjustment
pub const ORIGINAL_HPA_MAX_ANNOTATION: &str = "kubemedic.io/original-hpa-max-replicas";

/// Annotation naming the RemediationBackup written for the last mutation
pub const BACKUP_ANNOTATION: &str = "kubemedic.io/backup";

/// Namespace label that opts a namespace out of remediation
pub const EXCLUDE_LABEL: &str = "kubemedic.io/exclude";

/// Object label that protects a workload from remediation
pub const PROTECTED_LABEL: &str = "kubemedic.io/protected";

/// Resource kinds an action may target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TargetKind {
    Deployment,
    StatefulSet,
    HorizontalPodAutoscaler,
}

impl TargetKind {
    /// Parse a kind from a policy target. Matching is case-insensitive and
    /// accepts the plural resource names and the `HPA` short form.
    pub fn parse(kind: &str) -> Option<Self> {
        match kind.trim().to_ascii_lowercase().as_str() {
            "deployment" | "deployments" => Some(TargetKind::Deployment),
            "statefulset" | "statefulsets" => Some(TargetKind::StatefulSet),
            "horizontalpodautoscaler" | "horizontalpodautoscalers" | "hpa" => {
                Some(TargetKind::HorizontalPodAutoscaler)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Deployment => "Deployment",
            TargetKind::StatefulSet => "StatefulSet",
            TargetKind::HorizontalPodAutoscaler => "HorizontalPodAutoscaler",
        }
    }

    /// API group of the kind, as recorded in backup references
    pub fn api_group(&self) -> &'static str {
        match self {
            TargetKind::Deployment | TargetKind::StatefulSet => "apps",
            TargetKind::HorizontalPodAutoscaler => "autoscaling",
        }
    }

    /// Returns true for kinds that own a replica count
    pub fn is_workload(&self) -> bool {
        matches!(self, TargetKind::Deployment | TargetKind::StatefulSet)
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a cluster object an action applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub kind: TargetKind,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: TargetKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Identity of a SelfRemediationPolicy
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyKey {
    pub namespace: String,
    pub name: String,
}

impl PolicyKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Reference from an autoscaler to the workload it scales
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleTargetRef {
    pub kind: String,
    pub name: String,
}

/// Scaling-relevant view of a cluster object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScaleSpec {
    Workload {
        /// Desired replicas; `None` means the API default of 1
        replicas: Option<i32>,
        /// Pod selector labels, used to find the workload's pods
        selector: BTreeMap<String, String>,
        /// Per-container resource requests of the pod template
        container_requests: Vec<BTreeMap<String, Quantity>>,
    },
    Autoscaler {
        min_replicas: Option<i32>,
        max_replicas: i32,
        scale_target: Option<ScaleTargetRef>,
    },
}

/// A cluster object as seen by the engine, independent of its concrete kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterObject {
    pub key: ObjectKey,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub scale: ScaleSpec,
    /// Full object as read from the store, used for backups
    pub raw: serde_json::Value,
}

impl ClusterObject {
    /// Current replica count of a workload, defaulting to 1 when unset
    pub fn replicas(&self) -> Option<i32> {
        match &self.scale {
            ScaleSpec::Workload { replicas, .. } => Some(replicas.unwrap_or(1)),
            ScaleSpec::Autoscaler { .. } => None,
        }
    }

    /// Autoscaler bounds as (minReplicas, maxReplicas)
    pub fn autoscaler_bounds(&self) -> Option<(Option<i32>, i32)> {
        match &self.scale {
            ScaleSpec::Autoscaler {
                min_replicas,
                max_replicas,
                ..
            } => Some((*min_replicas, *max_replicas)),
            ScaleSpec::Workload { .. } => None,
        }
    }

    /// Returns true when this autoscaler scales the given workload
    pub fn scales(&self, workload: &ObjectKey) -> bool {
        match &self.scale {
            ScaleSpec::Autoscaler {
                scale_target: Some(target),
                ..
            } => {
                self.key.namespace == workload.namespace
                    && target.name == workload.name
                    && TargetKind::parse(&target.kind) == Some(workload.kind)
            }
            _ => false,
        }
    }

    /// Current value of a scale field, if the object carries it
    pub fn field_value(&self, field: ScaleField) -> Option<i32> {
        match field {
            ScaleField::Replicas => self.replicas(),
            ScaleField::MaxReplicas => self.autoscaler_bounds().map(|(_, max)| max),
        }
    }

    pub fn is_protected(&self) -> bool {
        self.labels.get(PROTECTED_LABEL).map(String::as_str) == Some("true")
    }
}

/// The single numeric field a remediation mutates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ScaleField {
    /// `spec.replicas` of a Deployment or StatefulSet
    Replicas,
    /// `spec.maxReplicas` of a HorizontalPodAutoscaler
    MaxReplicas,
}

impl ScaleField {
    /// Annotation that caches the original value of this field
    pub fn annotation(&self) -> &'static str {
        match self {
            ScaleField::Replicas => ORIGINAL_REPLICAS_ANNOTATION,
            ScaleField::MaxReplicas => ORIGINAL_HPA_MAX_ANNOTATION,
        }
    }

    /// JSON pointer of the field inside a serialized object
    pub fn json_pointer(&self) -> &'static str {
        match self {
            ScaleField::Replicas => "/spec/replicas",
            ScaleField::MaxReplicas => "/spec/maxReplicas",
        }
    }
}

impl fmt::Display for ScaleField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScaleField::Replicas => f.write_str("replicas"),
            ScaleField::MaxReplicas => f.write_str("maxReplicas"),
        }
    }
}

/// One write against a target: a scale field plus annotation edits.
///
/// An annotation mapped to `None` is removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub field: ScaleField,
    pub value: i32,
    pub annotations: BTreeMap<String, Option<String>>,
}

impl Mutation {
    pub fn new(field: ScaleField, value: i32) -> Self {
        Self {
            field,
            value,
            annotations: BTreeMap::new(),
        }
    }

    pub fn set_annotation(mut self, key: &str, value: impl Into<String>) -> Self {
        self.annotations.insert(key.to_string(), Some(value.into()));
        self
    }

    pub fn remove_annotation(mut self, key: &str) -> Self {
        self.annotations.insert(key.to_string(), None);
        self
    }
}

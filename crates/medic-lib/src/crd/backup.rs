//! RemediationBackup custom resource

use super::preserve_unknown_fields;
use crate::models::ObjectKey;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Information to find a Kubernetes resource
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceReference {
    #[serde(default)]
    pub api_group: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

impl From<&ObjectKey> for ResourceReference {
    fn from(key: &ObjectKey) -> Self {
        Self {
            api_group: key.kind.api_group().to_string(),
            kind: key.kind.as_str().to_string(),
            name: key.name.clone(),
            namespace: key.namespace.clone(),
        }
    }
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "remediation.kubemedic.io",
    version = "v1alpha1",
    kind = "RemediationBackup",
    namespaced,
    status = "RemediationBackupStatus",
    printcolumn = r#"{"name":"Valid", "type":"boolean", "jsonPath":".status.isValid"}"#,
    printcolumn = r#"{"name":"Resource", "type":"string", "jsonPath":".spec.resourceRef.kind"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RemediationBackupSpec {
    /// Full object as it was before remediation
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub original_state: serde_json::Value,

    pub resource_ref: ResourceReference,

    /// Policy whose rule triggered the action
    pub policy_ref: ResourceReference,

    pub action_type: String,

    /// RFC 3339 timestamp of the capture
    pub backup_time: String,

    /// Retention hint for external housekeeping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub original_labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub original_annotations: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemediationBackupStatus {
    /// Whether this backup can be used for reversion
    #[serde(default)]
    pub is_valid: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_validation_time: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation_errors: Vec<String>,

    #[serde(default)]
    pub backup_size_bytes: i64,

    /// Hex SHA-256 of the serialized original state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

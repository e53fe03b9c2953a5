//! RemediationBackup construction and integrity checks

use crate::crd::{
    ActionType, RemediationBackup, RemediationBackupSpec, RemediationBackupStatus,
    ResourceReference, SelfRemediationPolicy,
};
use crate::models::{ClusterObject, ScaleField};
use chrono::{DateTime, SecondsFormat, Utc};
use kube::ResourceExt;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Retention hint recorded on every backup
pub const BACKUP_TTL: &str = "24h";

/// Label linking a backup to its policy
pub const POLICY_LABEL: &str = "kubemedic.io/policy";

const MAX_NAME_LEN: usize = 253;

/// `{target}-{action}-{millis}`, lowercased and truncated to a valid object name
pub fn backup_name(target: &str, action: &ActionType, at: DateTime<Utc>) -> String {
    let suffix = format!("-{}-{}", action.slug(), at.timestamp_millis());
    let mut prefix: String = target
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '-' })
        .collect();
    prefix.truncate(MAX_NAME_LEN.saturating_sub(suffix.len()));
    prefix + &suffix
}

/// Hex SHA-256 over the serialized original state
pub fn content_hash(state: &Value) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(state)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Snapshot `object` before `action` mutates it
pub fn build_backup(
    policy: &SelfRemediationPolicy,
    object: &ClusterObject,
    action: &ActionType,
    now: DateTime<Utc>,
) -> Result<RemediationBackup, serde_json::Error> {
    let name = backup_name(&object.key.name, action, now);
    let policy_ref = ResourceReference {
        api_group: "remediation.kubemedic.io".to_string(),
        kind: "SelfRemediationPolicy".to_string(),
        name: policy.name_any(),
        namespace: policy.namespace().unwrap_or_default(),
    };

    let spec = RemediationBackupSpec {
        original_state: object.raw.clone(),
        resource_ref: ResourceReference::from(&object.key),
        policy_ref,
        action_type: action.to_string(),
        backup_time: now.to_rfc3339_opts(SecondsFormat::Secs, true),
        ttl: Some(BACKUP_TTL.to_string()),
        original_labels: object.labels.clone(),
        original_annotations: object.annotations.clone(),
    };

    let size = serde_json::to_vec(&spec.original_state)?.len();
    let status = RemediationBackupStatus {
        is_valid: true,
        last_validation_time: Some(spec.backup_time.clone()),
        validation_errors: Vec::new(),
        backup_size_bytes: i64::try_from(size).unwrap_or(i64::MAX),
        content_hash: Some(content_hash(&spec.original_state)?),
    };

    let mut backup = RemediationBackup::new(&name, spec);
    backup.metadata.namespace = Some(object.key.namespace.clone());
    backup.metadata.labels = Some(BTreeMap::from([(
        POLICY_LABEL.to_string(),
        policy.name_any(),
    )]));
    backup.status = Some(status);
    Ok(backup)
}

/// Re-check a backup's integrity; returns the list of problems found
pub fn verify_backup(backup: &RemediationBackup) -> Vec<String> {
    let mut errors = Vec::new();
    let Some(status) = &backup.status else {
        errors.push("backup has no status".to_string());
        return errors;
    };

    if !status.is_valid {
        errors.push("backup is marked invalid".to_string());
    }
    if backup.spec.original_state.is_null() {
        errors.push("original state is empty".to_string());
    }

    match (&status.content_hash, content_hash(&backup.spec.original_state)) {
        (Some(expected), Ok(actual)) if *expected != actual => {
            errors.push(format!("content hash mismatch: expected {}, got {}", expected, actual));
        }
        (None, _) => errors.push("backup has no content hash".to_string()),
        (_, Err(e)) => errors.push(format!("original state not serializable: {}", e)),
        _ => {}
    }
    errors
}

/// Original value of a scale field as captured in the backup
pub fn original_value(backup: &RemediationBackup, field: ScaleField) -> Option<i32> {
    match backup.spec.original_state.pointer(field.json_pointer()) {
        Some(value) => value.as_i64().and_then(|v| i32::try_from(v).ok()),
        // An unset replica count is the API default of one
        None if field == ScaleField::Replicas => Some(1),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::workload;
    use crate::crd::SelfRemediationPolicySpec;
    use crate::models::TargetKind;
    use chrono::TimeZone;

    fn fixture() -> RemediationBackup {
        let policy = SelfRemediationPolicy::in_namespace(
            "shop",
            "web-policy",
            SelfRemediationPolicySpec::default(),
        );
        let object = workload(TargetKind::Deployment, "shop", "web", 2);
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        build_backup(&policy, &object, &ActionType::ScaleUp, now).unwrap()
    }

    #[test]
    fn test_backup_name_format() {
        let at = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        assert_eq!(
            backup_name("Web_API", &ActionType::AdjustHpaLimits, at),
            "web-api-adjusthpalimits-1700000000000"
        );

        let long = "a".repeat(300);
        assert!(backup_name(&long, &ActionType::ScaleUp, at).len() <= MAX_NAME_LEN);
    }

    #[test]
    fn test_build_backup_records_integrity() {
        let backup = fixture();

        assert_eq!(backup.metadata.namespace.as_deref(), Some("shop"));
        assert_eq!(backup.spec.resource_ref.kind, "Deployment");
        assert_eq!(backup.spec.policy_ref.name, "web-policy");
        assert_eq!(backup.spec.backup_time, "2024-05-01T12:00:00Z");
        let status = backup.status.as_ref().unwrap();
        assert!(status.is_valid);
        assert_eq!(status.content_hash.as_ref().unwrap().len(), 64);
        assert!(status.backup_size_bytes > 0);
        assert!(verify_backup(&backup).is_empty());
        assert_eq!(original_value(&backup, ScaleField::Replicas), Some(2));
    }

    #[test]
    fn test_verify_detects_tampering() {
        let mut backup = fixture();
        backup.spec.original_state["spec"]["replicas"] = serde_json::json!(9);

        let errors = verify_backup(&backup);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("content hash mismatch"));
    }

    #[test]
    fn test_original_value_for_autoscaler_requires_field() {
        let mut backup = fixture();
        assert_eq!(original_value(&backup, ScaleField::MaxReplicas), None);

        backup.spec.original_state = serde_json::json!({"spec": {}});
        assert_eq!(original_value(&backup, ScaleField::Replicas), Some(1));
    }
}

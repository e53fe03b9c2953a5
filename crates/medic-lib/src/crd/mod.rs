//! Custom resources owned by the remediation engine
//!
//! - `SelfRemediationPolicy`: rules mapping monitored conditions to actions
//! - `RemediationBackup`: durable snapshot of a target before it is mutated

mod backup;
mod policy;

pub use backup::{RemediationBackup, RemediationBackupSpec, RemediationBackupStatus, ResourceReference};
pub use policy::{
    Action, ActionType, Condition, ConflictResolution, GrafanaIntegration, Rule,
    ScalingParameters, SelfRemediationPolicy, SelfRemediationPolicySpec,
    SelfRemediationPolicyStatus, SignalType, Target,
};

use schemars::schema::{InstanceType, Schema, SchemaObject};
use std::time::Duration;

/// Parse a duration such as "90s", "5m" or "1h30m"
pub fn parse_duration(raw: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(raw.trim())
}

fn string_schema(_: &mut schemars::gen::SchemaGenerator) -> Schema {
    Schema::Object(SchemaObject {
        instance_type: Some(InstanceType::String.into()),
        ..Default::default()
    })
}

fn preserve_unknown_fields(_: &mut schemars::gen::SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(schema)
}

//! SelfRemediationPolicy custom resource

use super::{parse_duration, string_schema};
use crate::models::PolicyKey;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Monitored signal of a condition
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SignalType {
    CpuUsage,
    MemoryUsage,
    ErrorRate,
    PodRestarts,
    Other(String),
}

impl SignalType {
    /// Returns true when the source reports this signal as a percentage already
    pub fn is_ratio(&self) -> bool {
        matches!(self, SignalType::ErrorRate)
    }
}

impl From<String> for SignalType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "CPUUsage" => SignalType::CpuUsage,
            "MemoryUsage" => SignalType::MemoryUsage,
            "ErrorRate" => SignalType::ErrorRate,
            "PodRestarts" => SignalType::PodRestarts,
            _ => SignalType::Other(value),
        }
    }
}

impl From<SignalType> for String {
    fn from(value: SignalType) -> Self {
        value.to_string()
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalType::CpuUsage => f.write_str("CPUUsage"),
            SignalType::MemoryUsage => f.write_str("MemoryUsage"),
            SignalType::ErrorRate => f.write_str("ErrorRate"),
            SignalType::PodRestarts => f.write_str("PodRestarts"),
            SignalType::Other(other) => f.write_str(other),
        }
    }
}

impl JsonSchema for SignalType {
    fn schema_name() -> String {
        "SignalType".to_string()
    }

    fn is_referenceable() -> bool {
        false
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        string_schema(gen)
    }
}

/// Remediation action type.
///
/// Unknown values survive decoding so the admission gate can name them in
/// its denial instead of failing the whole request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ActionType {
    ScaleUp,
    ScaleDown,
    RestartPod,
    RollbackDeployment,
    UpdateResources,
    AdjustHpaLimits,
    Other(String),
}

impl ActionType {
    /// Action types whose execution writes a replica count or ceiling
    pub fn is_scaling(&self) -> bool {
        matches!(
            self,
            ActionType::ScaleUp | ActionType::ScaleDown | ActionType::AdjustHpaLimits
        )
    }

    /// Lowercase name used in generated object names
    pub fn slug(&self) -> String {
        self.to_string().to_ascii_lowercase()
    }
}

impl From<String> for ActionType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "ScaleUp" => ActionType::ScaleUp,
            "ScaleDown" => ActionType::ScaleDown,
            "RestartPod" => ActionType::RestartPod,
            "RollbackDeployment" => ActionType::RollbackDeployment,
            "UpdateResources" => ActionType::UpdateResources,
            "AdjustHPALimits" => ActionType::AdjustHpaLimits,
            _ => ActionType::Other(value),
        }
    }
}

impl From<ActionType> for String {
    fn from(value: ActionType) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionType::ScaleUp => f.write_str("ScaleUp"),
            ActionType::ScaleDown => f.write_str("ScaleDown"),
            ActionType::RestartPod => f.write_str("RestartPod"),
            ActionType::RollbackDeployment => f.write_str("RollbackDeployment"),
            ActionType::UpdateResources => f.write_str("UpdateResources"),
            ActionType::AdjustHpaLimits => f.write_str("AdjustHPALimits"),
            ActionType::Other(other) => f.write_str(other),
        }
    }
}

impl JsonSchema for ActionType {
    fn schema_name() -> String {
        "ActionType".to_string()
    }

    fn is_referenceable() -> bool {
        false
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        string_schema(gen)
    }
}

/// How a scale action reacts to an autoscaler that would clamp it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictResolution {
    /// Skip the action and emit a warning event
    #[default]
    Skip,
    /// Raise the autoscaler's maxReplicas instead of writing replicas
    AdjustHpaLimits,
}

impl ConflictResolution {
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("AdjustHPALimits") => {
                ConflictResolution::AdjustHpaLimits
            }
            _ => ConflictResolution::Skip,
        }
    }
}

/// What to monitor
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub signal: SignalType,

    /// Threshold as a string, e.g. "80%", "500m", "2"
    pub threshold: String,

    /// How long the signal must stay above threshold
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
}

impl Condition {
    pub fn sustain(&self) -> Result<Duration, humantime::DurationError> {
        match self.duration.as_deref().map(str::trim) {
            None | Some("") => Ok(Duration::ZERO),
            Some(raw) => parse_duration(raw),
        }
    }
}

/// Resource a remediation applies to
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    #[serde(default)]
    pub kind: String,

    #[serde(default)]
    pub name: String,

    /// Defaults to the policy namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl Target {
    /// Effective namespace of the target for a policy in `policy_namespace`
    pub fn namespace_or<'a>(&'a self, policy_namespace: &'a str) -> &'a str {
        match self.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => ns,
            _ => policy_namespace,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ScalingParameters {
    /// Replica count (or autoscaler ceiling) applied while remediating
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporary_max_replicas: Option<i32>,

    /// How long to hold the temporary scaling before reverting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaling_duration: Option<String>,

    /// Gradual or Immediate; reversion is currently always immediate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revert_strategy: Option<String>,

    /// Notified after a scaling decision is applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_webhook: Option<String>,
}

impl ScalingParameters {
    pub fn duration(&self) -> Result<Option<Duration>, humantime::DurationError> {
        match self.scaling_duration.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => parse_duration(raw).map(Some),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    #[serde(rename = "type")]
    pub action_type: ActionType,

    #[serde(default)]
    pub target: Target,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaling_params: Option<ScalingParameters>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_action_hook: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_action_hook: Option<String>,

    /// Skip (default) or AdjustHPALimits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_resolution: Option<String>,
}

impl Action {
    pub fn replica_ceiling(&self) -> Option<i32> {
        self.scaling_params
            .as_ref()
            .and_then(|p| p.temporary_max_replicas)
    }

    pub fn conflict_resolution(&self) -> ConflictResolution {
        ConflictResolution::parse(self.conflict_resolution.as_deref())
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub name: String,

    /// Any true condition fires the rule
    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub actions: Vec<Action>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct GrafanaIntegration {
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[kube(
    group = "remediation.kubemedic.io",
    version = "v1alpha1",
    kind = "SelfRemediationPolicy",
    namespaced,
    status = "SelfRemediationPolicyStatus",
    shortname = "srp"
)]
#[serde(rename_all = "camelCase")]
pub struct SelfRemediationPolicySpec {
    #[serde(default)]
    pub rules: Vec<Rule>,

    /// Minimum time between remediations of the same target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_period: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grafana_integration: Option<GrafanaIntegration>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SelfRemediationPolicyStatus {
    /// RFC 3339 timestamp of the last evaluation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_evaluation_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_remediation_action: Option<String>,

    /// Active or Idle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    /// Whether any rule fired during the last evaluation
    #[serde(default)]
    pub active: bool,
}

impl SelfRemediationPolicy {
    /// Build a policy object in a namespace
    pub fn in_namespace(namespace: &str, name: &str, spec: SelfRemediationPolicySpec) -> Self {
        let mut policy = Self::new(name, spec);
        policy.metadata.namespace = Some(namespace.to_string());
        policy
    }

    pub fn key(&self) -> PolicyKey {
        PolicyKey::new(self.namespace().unwrap_or_default(), self.name_any())
    }

    pub fn cooldown(&self) -> Result<Option<Duration>, humantime::DurationError> {
        match self.spec.cooldown_period.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => parse_duration(raw).map(Some),
        }
    }
}

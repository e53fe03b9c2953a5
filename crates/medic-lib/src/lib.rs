//! Remediation engine library
//!
//! This crate provides the core functionality for:
//! - Sustained-threshold evaluation of workload usage
//! - Temporary scaling remediations with backups and timed reversion
//! - Autoscaler conflict detection
//! - Admission validation of remediation policies
//! - Health checks and observability

pub mod admission;
pub mod cluster;
pub mod controller;
pub mod crd;
pub mod evaluator;
pub mod executor;
pub mod health;
pub mod models;
pub mod observability;
pub mod quantity;
pub mod resolve;
pub mod reversion;
pub mod server;
pub mod tracker;
pub mod usage;

pub use admission::{AdmissionError, PolicyValidator, SafetyLimits};
pub use cluster::{ClusterError, ClusterStore, EventSink, InMemoryCluster, KubeEventSink, KubeStore};
pub use controller::{Controller, ControllerConfig};
pub use evaluator::{EvaluationError, EvaluationReport, PolicyEvaluator};
pub use executor::{ActionExecutor, ActionOutcome};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{MedicMetrics, StructuredLogger};
pub use reversion::{ReversionRequest, ReversionScheduler};
pub use tracker::StateTracker;
pub use usage::{KubeMetricsSource, MetricsGateway, MetricsSource};

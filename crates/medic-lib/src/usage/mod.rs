//! Usage sampling and sustained-threshold evaluation
//!
//! A `MetricsSource` reports point-in-time usage for a workload; the
//! `MetricsGateway` polls it to decide whether a signal stayed above its
//! threshold for a contiguous sustain window.

mod gateway;
mod metrics_server;

pub use gateway::{MetricsGateway, DEFAULT_SAMPLE_INTERVAL};
pub use metrics_server::KubeMetricsSource;

use crate::crd::SignalType;
use crate::models::ClusterObject;
use crate::quantity::QuantityError;
use async_trait::async_trait;
use thiserror::Error;

/// A point-in-time usage reading for one signal of one workload
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageSample {
    /// Cores, bytes, restart count, or percent for ratio signals
    pub usage: f64,
    /// Summed resource limit in the same unit, when the pods declare one
    pub limit: Option<f64>,
}

impl UsageSample {
    pub fn new(usage: f64, limit: Option<f64>) -> Self {
        Self { usage, limit }
    }
}

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("no usage reported for {0}")]
    NoUsage(String),

    #[error("no resource limits set for {0}")]
    NoLimits(String),

    #[error("signal {0} is not supported by this metrics source")]
    UnsupportedSignal(String),

    #[error("invalid threshold: {0}")]
    InvalidThreshold(#[from] QuantityError),

    #[error("invalid sustain duration {0:?}")]
    InvalidDuration(String),

    #[error("usage query cancelled")]
    Cancelled,

    #[error("metrics source error: {0}")]
    Source(String),
}

impl From<kube::Error> for MetricsError {
    fn from(err: kube::Error) -> Self {
        MetricsError::Source(err.to_string())
    }
}

/// Source of point-in-time usage readings
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn sample(
        &self,
        target: &ClusterObject,
        signal: &SignalType,
    ) -> Result<UsageSample, MetricsError>;
}

//! Sustained-threshold evaluation over a metrics source

use super::{MetricsError, MetricsSource, UsageSample};
use crate::crd::{Condition, SignalType};
use crate::health::{components, HealthRegistry};
use crate::models::ClusterObject;
use crate::quantity::Threshold;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Interval between usage samples while a sustain window is open
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Answers "is this workload over threshold for at least D"
#[derive(Clone)]
pub struct MetricsGateway {
    source: Arc<dyn MetricsSource>,
    sample_interval: Duration,
    health: Option<HealthRegistry>,
}

impl MetricsGateway {
    pub fn new(source: Arc<dyn MetricsSource>) -> Self {
        Self::with_interval(source, DEFAULT_SAMPLE_INTERVAL)
    }

    pub fn with_interval(source: Arc<dyn MetricsSource>, sample_interval: Duration) -> Self {
        Self {
            source,
            sample_interval,
            health: None,
        }
    }

    /// Report source availability under `metrics_source` on every sample
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn sample_interval(&self) -> Duration {
        self.sample_interval
    }

    /// Current usage of a signal
    pub async fn current_usage(
        &self,
        target: &ClusterObject,
        signal: &SignalType,
    ) -> Result<UsageSample, MetricsError> {
        let sample = self.source.sample(target, signal).await;
        self.report(&sample).await;
        sample
    }

    /// Evaluate one policy condition against a workload
    pub async fn evaluate_condition(
        &self,
        target: &ClusterObject,
        condition: &Condition,
        cancel: &CancellationToken,
    ) -> Result<bool, MetricsError> {
        let threshold = Threshold::parse(&condition.threshold, &condition.signal)?;
        let sustain = condition
            .sustain()
            .map_err(|_| MetricsError::InvalidDuration(condition.duration.clone().unwrap_or_default()))?;
        self.usage_over_threshold(target, &condition.signal, threshold, sustain, cancel)
            .await
    }

    /// Poll until the signal has been above `threshold` contiguously for
    /// `sustain`, or until `sustain` plus one sample interval has passed.
    ///
    /// Any sample at or below the threshold resets the window. Returns
    /// `MetricsError::Cancelled` as soon as `cancel` fires.
    pub async fn usage_over_threshold(
        &self,
        target: &ClusterObject,
        signal: &SignalType,
        threshold: Threshold,
        sustain: Duration,
        cancel: &CancellationToken,
    ) -> Result<bool, MetricsError> {
        let deadline = Instant::now() + sustain + self.sample_interval;
        let mut above_since: Option<Instant> = None;

        loop {
            let sample = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(MetricsError::Cancelled),
                sample = self.current_usage(target, signal) => sample?,
            };
            let now = Instant::now();

            if exceeds(&sample, signal, threshold, &target.key.to_string())? {
                let since = *above_since.get_or_insert(now);
                trace!(
                    resource = %target.key,
                    signal = %signal,
                    usage = sample.usage,
                    above_ms = now.duration_since(since).as_millis() as u64,
                    "Sample above threshold"
                );
                if now.duration_since(since) >= sustain {
                    debug!(resource = %target.key, signal = %signal, "Threshold sustained");
                    return Ok(true);
                }
            } else {
                above_since = None;
            }

            if now >= deadline {
                return Ok(false);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(MetricsError::Cancelled),
                _ = sleep(self.sample_interval) => {}
            }
        }
    }
}

impl MetricsGateway {
    /// Only source failures change health; missing usage or limits are
    /// properties of one workload
    async fn report(&self, sample: &Result<UsageSample, MetricsError>) {
        let Some(health) = &self.health else {
            return;
        };
        match sample {
            Ok(_) => health.set_healthy(components::METRICS_SOURCE).await,
            Err(MetricsError::Source(message)) => {
                health
                    .set_degraded(components::METRICS_SOURCE, message.clone())
                    .await
            }
            Err(_) => {}
        }
    }
}

fn exceeds(
    sample: &UsageSample,
    signal: &SignalType,
    threshold: Threshold,
    target: &str,
) -> Result<bool, MetricsError> {
    match threshold {
        Threshold::Absolute(value) => Ok(sample.usage > value),
        Threshold::Percent(percent) if signal.is_ratio() => Ok(sample.usage > percent),
        Threshold::Percent(percent) => {
            let limit = sample
                .limit
                .filter(|limit| *limit > 0.0)
                .ok_or_else(|| MetricsError::NoLimits(target.to_string()))?;
            Ok(sample.usage / limit * 100.0 > percent)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::workload;
    use crate::models::TargetKind;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays usage values; repeats the last one when exhausted
    struct ScriptedSource {
        values: Mutex<VecDeque<f64>>,
        limit: Option<f64>,
    }

    impl ScriptedSource {
        fn new(values: &[f64], limit: Option<f64>) -> Arc<Self> {
            Arc::new(Self {
                values: Mutex::new(values.iter().copied().collect()),
                limit,
            })
        }
    }

    #[async_trait]
    impl MetricsSource for ScriptedSource {
        async fn sample(
            &self,
            _target: &ClusterObject,
            _signal: &SignalType,
        ) -> Result<UsageSample, MetricsError> {
            let mut values = self.values.lock().unwrap();
            let usage = if values.len() > 1 {
                values.pop_front().unwrap()
            } else {
                *values.front().unwrap()
            };
            Ok(UsageSample::new(usage, self.limit))
        }
    }

    fn target() -> ClusterObject {
        workload(TargetKind::Deployment, "shop", "web", 1)
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_signal_fires_when_sustained() {
        let gateway = MetricsGateway::new(ScriptedSource::new(&[0.9], Some(1.0)));
        let start = Instant::now();

        let fired = gateway
            .usage_over_threshold(
                &target(),
                &SignalType::CpuUsage,
                Threshold::Percent(80.0),
                Duration::from_secs(10),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(fired);
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dip_below_threshold_resets_clock() {
        // above, below, above, above: never 10s contiguous inside the window
        let gateway = MetricsGateway::new(ScriptedSource::new(
            &[0.9, 0.5, 0.9, 0.9],
            Some(1.0),
        ));

        let fired = gateway
            .usage_over_threshold(
                &target(),
                &SignalType::CpuUsage,
                Threshold::Percent(80.0),
                Duration::from_secs(10),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!fired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_sustain_fires_on_first_sample() {
        let gateway = MetricsGateway::new(ScriptedSource::new(&[4.0], None));

        let fired = gateway
            .usage_over_threshold(
                &target(),
                &SignalType::PodRestarts,
                Threshold::Absolute(3.0),
                Duration::ZERO,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(fired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_percent_without_limit_is_error() {
        let gateway = MetricsGateway::new(ScriptedSource::new(&[0.9], None));

        let result = gateway
            .usage_over_threshold(
                &target(),
                &SignalType::CpuUsage,
                Threshold::Percent(80.0),
                Duration::from_secs(10),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(MetricsError::NoLimits(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ratio_signal_needs_no_limit() {
        let gateway = MetricsGateway::new(ScriptedSource::new(&[7.5], None));

        let fired = gateway
            .usage_over_threshold(
                &target(),
                &SignalType::ErrorRate,
                Threshold::Percent(5.0),
                Duration::ZERO,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(fired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_returns_error() {
        let gateway = MetricsGateway::new(ScriptedSource::new(&[0.1], Some(1.0)));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = gateway
            .usage_over_threshold(
                &target(),
                &SignalType::CpuUsage,
                Threshold::Percent(80.0),
                Duration::from_secs(60),
                &cancel,
            )
            .await;

        assert!(matches!(result, Err(MetricsError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_evaluate_condition_parses_threshold() {
        let gateway = MetricsGateway::new(ScriptedSource::new(&[0.9], Some(1.0)));
        let condition = Condition {
            signal: SignalType::CpuUsage,
            threshold: "80%".to_string(),
            duration: Some("5s".to_string()),
        };

        assert!(gateway
            .evaluate_condition(&target(), &condition, &CancellationToken::new())
            .await
            .unwrap());

        let invalid = Condition {
            threshold: "lots".to_string(),
            ..condition
        };
        assert!(matches!(
            gateway
                .evaluate_condition(&target(), &invalid, &CancellationToken::new())
                .await,
            Err(MetricsError::InvalidThreshold(_))
        ));
    }

    /// Fails with a source error while `down` is set
    struct FlakySource {
        down: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl MetricsSource for FlakySource {
        async fn sample(
            &self,
            target: &ClusterObject,
            _signal: &SignalType,
        ) -> Result<UsageSample, MetricsError> {
            if self.down.load(std::sync::atomic::Ordering::SeqCst) {
                Err(MetricsError::Source("metrics API unavailable".to_string()))
            } else if target.key.name == "fresh" {
                Err(MetricsError::NoUsage(target.key.to_string()))
            } else {
                Ok(UsageSample::new(0.5, Some(1.0)))
            }
        }
    }

    #[tokio::test]
    async fn test_source_failures_degrade_metrics_health() {
        let health = HealthRegistry::new();
        let source = Arc::new(FlakySource {
            down: std::sync::atomic::AtomicBool::new(true),
        });
        let gateway = MetricsGateway::new(source.clone()).with_health(health.clone());

        assert!(gateway.current_usage(&target(), &SignalType::CpuUsage).await.is_err());
        let report = health.health().await;
        let metrics = &report.components[components::METRICS_SOURCE];
        assert_eq!(metrics.status, crate::health::ComponentStatus::Degraded);
        assert_eq!(metrics.message.as_deref(), Some("metrics API unavailable"));

        source.down.store(false, std::sync::atomic::Ordering::SeqCst);
        gateway.current_usage(&target(), &SignalType::CpuUsage).await.unwrap();
        assert_eq!(
            health.health().await.components[components::METRICS_SOURCE].status,
            crate::health::ComponentStatus::Healthy
        );

        // A workload without usage says nothing about the source
        let fresh = workload(TargetKind::Deployment, "shop", "fresh", 1);
        assert!(matches!(
            gateway.current_usage(&fresh, &SignalType::CpuUsage).await,
            Err(MetricsError::NoUsage(_))
        ));
        assert_eq!(
            health.health().await.components[components::METRICS_SOURCE].status,
            crate::health::ComponentStatus::Healthy
        );
    }
}

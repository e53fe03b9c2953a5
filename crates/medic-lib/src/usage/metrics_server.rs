//! Usage source backed by the `metrics.k8s.io` API and pod specs

use super::{MetricsError, MetricsSource, UsageSample};
use crate::crd::SignalType;
use crate::models::{ClusterObject, ScaleSpec};
use crate::quantity::parse_quantity;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, ListParams};
use kube::Client;
use serde_json::Value;
use std::collections::BTreeMap;

/// Reads PodMetrics for the pods selected by a workload
#[derive(Clone)]
pub struct KubeMetricsSource {
    client: Client,
    pod_metrics: ApiResource,
}

impl KubeMetricsSource {
    pub fn new(client: Client) -> Self {
        let gvk = GroupVersionKind::gvk("metrics.k8s.io", "v1beta1", "PodMetrics");
        Self {
            client,
            pod_metrics: ApiResource::from_gvk_with_plural(&gvk, "pods"),
        }
    }

    async fn pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, MetricsError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default().labels(selector)).await?.items)
    }

    async fn container_usage(
        &self,
        target: &ClusterObject,
        selector: &str,
        resource: &str,
    ) -> Result<f64, MetricsError> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &target.key.namespace, &self.pod_metrics);
        let metrics = api.list(&ListParams::default().labels(selector)).await?;
        summed_usage(&metrics.items, resource, &target.key.to_string())
    }
}

/// Sum of container usage for `resource` across PodMetrics items.
///
/// Fails with `NoUsage` when no container reports the resource, which is
/// what metrics-server returns for freshly started pods.
fn summed_usage(items: &[DynamicObject], resource: &str, target: &str) -> Result<f64, MetricsError> {
    let mut total = 0.0;
    let mut reported = false;
    for item in items {
        let containers = item
            .data
            .get("containers")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for container in containers {
            if let Some(raw) = container
                .get("usage")
                .and_then(|u| u.get(resource))
                .and_then(Value::as_str)
            {
                total += parse_quantity(raw).map_err(|e| MetricsError::Source(e.to_string()))?;
                reported = true;
            }
        }
    }
    if !reported {
        return Err(MetricsError::NoUsage(target.to_string()));
    }
    Ok(total)
}

fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Sum of container limits for `resource`; `None` unless every container sets one
fn summed_limits(pods: &[Pod], resource: &str) -> Option<f64> {
    let mut total = 0.0;
    for pod in pods {
        let containers = pod.spec.as_ref().map(|s| s.containers.as_slice()).unwrap_or_default();
        for container in containers {
            let raw = container
                .resources
                .as_ref()
                .and_then(|r| r.limits.as_ref())
                .and_then(|l| l.get(resource))?;
            total += parse_quantity(&raw.0).ok()?;
        }
    }
    (total > 0.0).then_some(total)
}

fn restart_count(pods: &[Pod]) -> f64 {
    pods.iter()
        .filter_map(|p| p.status.as_ref())
        .filter_map(|s| s.container_statuses.as_ref())
        .flatten()
        .map(|c| c.restart_count as f64)
        .sum()
}

#[async_trait]
impl MetricsSource for KubeMetricsSource {
    async fn sample(
        &self,
        target: &ClusterObject,
        signal: &SignalType,
    ) -> Result<UsageSample, MetricsError> {
        let ScaleSpec::Workload { selector, .. } = &target.scale else {
            return Err(MetricsError::NoUsage(target.key.to_string()));
        };
        if selector.is_empty() {
            return Err(MetricsError::NoUsage(target.key.to_string()));
        }

        let selector = selector_string(selector);
        let pods = self.pods(&target.key.namespace, &selector).await?;
        if pods.is_empty() {
            return Err(MetricsError::NoUsage(target.key.to_string()));
        }

        match signal {
            SignalType::CpuUsage | SignalType::MemoryUsage => {
                let resource = if matches!(signal, SignalType::CpuUsage) {
                    "cpu"
                } else {
                    "memory"
                };
                let usage = self.container_usage(target, &selector, resource).await?;
                Ok(UsageSample::new(usage, summed_limits(&pods, resource)))
            }
            SignalType::PodRestarts => Ok(UsageSample::new(restart_count(&pods), None)),
            SignalType::ErrorRate | SignalType::Other(_) => {
                Err(MetricsError::UnsupportedSignal(signal.to_string()))
            }
        }
    }
}

//! Outbound action hooks
//!
//! A pre-action hook must answer 2xx before a mutation is written; post-action
//! hooks and notification webhooks are best effort.

use crate::crd::ResourceReference;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Default per-request timeout for hook calls
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum HookError {
    #[error("invalid hook url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("hook {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("hook {url} returned status {status}")]
    Status { url: String, status: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HookPhase {
    Pre,
    Post,
}

/// JSON body POSTed to hooks
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HookPayload {
    pub phase: HookPhase,
    pub policy: String,
    pub namespace: String,
    pub action_type: String,
    pub target: ResourceReference,
    pub original_value: i32,
    pub requested_value: i32,
    pub timestamp: String,
}

#[derive(Clone)]
pub struct HookClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl Default for HookClient {
    fn default() -> Self {
        Self::new(DEFAULT_HOOK_TIMEOUT)
    }
}

impl HookClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            timeout,
        }
    }

    /// POST `payload` to `url`; any non-2xx status is an error
    pub async fn notify(&self, url: &str, payload: &HookPayload) -> Result<(), HookError> {
        let parsed = url::Url::parse(url).map_err(|e| HookError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(HookError::InvalidUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme {}", parsed.scheme()),
            });
        }

        let response = self
            .http
            .post(parsed)
            .timeout(self.timeout)
            .json(payload)
            .send()
            .await
            .map_err(|source| HookError::Transport {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(HookError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> HookPayload {
        HookPayload {
            phase: HookPhase::Pre,
            policy: "web-policy".to_string(),
            namespace: "shop".to_string(),
            action_type: "ScaleUp".to_string(),
            target: ResourceReference {
                api_group: "apps".to_string(),
                kind: "Deployment".to_string(),
                name: "web".to_string(),
                namespace: "shop".to_string(),
            },
            original_value: 1,
            requested_value: 3,
            timestamp: "2024-05-01T12:00:00Z".to_string(),
        }
    }

    #[tokio::test]
    async fn test_notify_posts_json() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/pre")
            .match_header("content-type", "application/json")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "phase": "pre",
                "actionType": "ScaleUp",
                "requestedValue": 3
            })))
            .with_status(200)
            .create_async()
            .await;

        let client = HookClient::default();
        client
            .notify(&format!("{}/pre", server.url()), &payload())
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_notify_rejects_error_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/pre")
            .with_status(503)
            .create_async()
            .await;

        let err = HookClient::default()
            .notify(&format!("{}/pre", server.url()), &payload())
            .await
            .unwrap_err();

        assert!(matches!(err, HookError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_notify_rejects_bad_url() {
        let client = HookClient::default();
        assert!(matches!(
            client.notify("not a url", &payload()).await,
            Err(HookError::InvalidUrl { .. })
        ));
        assert!(matches!(
            client.notify("ftp://example.com/hook", &payload()).await,
            Err(HookError::InvalidUrl { .. })
        ));
    }
}

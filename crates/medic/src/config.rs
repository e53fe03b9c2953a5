//! Controller configuration

use anyhow::Result;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Controller configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct MedicConfig {
    /// Port for health, metrics and the admission endpoint
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Policy poll interval in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Usage sampling interval inside a sustain window, in seconds
    #[serde(default = "default_sample_interval")]
    pub sample_interval_secs: u64,

    /// Per-request timeout for action hooks, in seconds
    #[serde(default = "default_hook_timeout")]
    pub hook_timeout_secs: u64,

    /// Reporter name on emitted events
    #[serde(default = "default_reporter")]
    pub reporter: String,
}

fn default_api_port() -> u16 {
    8080
}

fn default_poll_interval() -> u64 {
    30
}

fn default_sample_interval() -> u64 {
    5
}

fn default_hook_timeout() -> u64 {
    10
}

fn default_reporter() -> String {
    "kubemedic".to_string()
}

impl Default for MedicConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            poll_interval_secs: default_poll_interval(),
            sample_interval_secs: default_sample_interval(),
            hook_timeout_secs: default_hook_timeout(),
            reporter: default_reporter(),
        }
    }
}

impl MedicConfig {
    /// Load from an optional file, overridden by `KUBEMEDIC_*` environment variables
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path));
        }
        let config = builder
            .add_source(config::Environment::with_prefix("KUBEMEDIC").try_parsing(true))
            .build()?;

        let loaded: MedicConfig = config.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            anyhow::bail!("poll_interval_secs must be greater than zero");
        }
        if self.sample_interval_secs == 0 {
            anyhow::bail!("sample_interval_secs must be greater than zero");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_secs(self.hook_timeout_secs)
    }
}

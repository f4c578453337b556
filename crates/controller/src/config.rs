//! Controller configuration
//!
//! Read from the mounted `config.yaml`; every field has a default so a
//! partial file (or none at all) still yields a usable configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

/// Main controller configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ControllerConfig {
    /// Shard owned by this replica; empty means unsharded
    pub shard_key: String,

    /// Evaluation jobs running at once
    pub workers: usize,

    /// `HealthPolicy` reconciles running at once
    pub concurrent_reconciles: u16,

    /// Re-evaluation period for every matched cluster
    pub evaluation_interval_seconds: u64,

    /// Upper bound for a single evaluation job
    pub job_timeout_seconds: u64,

    /// Upper bound for a single remote report or add-on status read
    pub remote_call_timeout_seconds: u64,

    /// Re-read/merge/write attempts on status conflicts
    pub status_update_retries: u32,

    /// Requeue delay after a failed reconcile
    pub error_requeue_seconds: u64,

    pub capability: CapabilityConfig,
}

/// Cluster API detection settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct CapabilityConfig {
    pub max_attempts: u32,
    pub backoff_seconds: u64,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            backoff_seconds: 1,
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            shard_key: String::new(),
            workers: 20,
            concurrent_reconciles: 10,
            evaluation_interval_seconds: 60,
            job_timeout_seconds: 120,
            remote_call_timeout_seconds: 30,
            status_update_retries: 5,
            error_requeue_seconds: 30,
            capability: CapabilityConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from a mounted YAML file
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or parsed.
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        Self::from_yaml(&config_str)
    }

    /// Parse configuration from YAML text
    ///
    /// # Errors
    /// Returns an error when the YAML does not describe a `ControllerConfig`.
    pub fn from_yaml(config_str: &str) -> Result<Self, anyhow::Error> {
        serde_yaml::from_str(config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))
    }

    /// Apply environment overrides (`SHARD_KEY`)
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(shard_key) = std::env::var("SHARD_KEY") {
            info!("Using shard key '{}' from SHARD_KEY", shard_key);
            self.shard_key = shard_key;
        }
        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    /// Returns an error naming the first out-of-range setting.
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.workers == 0 {
            return Err(anyhow::anyhow!("workers must be at least 1"));
        }
        if self.concurrent_reconciles == 0 {
            return Err(anyhow::anyhow!("concurrentReconciles must be at least 1"));
        }
        if self.evaluation_interval_seconds == 0 {
            return Err(anyhow::anyhow!("evaluationIntervalSeconds must be positive"));
        }
        if self.remote_call_timeout_seconds == 0
            || self.remote_call_timeout_seconds > self.job_timeout_seconds
        {
            return Err(anyhow::anyhow!(
                "remoteCallTimeoutSeconds must be positive and not exceed jobTimeoutSeconds ({})",
                self.job_timeout_seconds
            ));
        }
        if self.status_update_retries == 0 {
            return Err(anyhow::anyhow!("statusUpdateRetries must be at least 1"));
        }
        if self.capability.max_attempts == 0 {
            return Err(anyhow::anyhow!("capability.maxAttempts must be at least 1"));
        }
        Ok(())
    }

    /// Shard key, `None` when this replica is unsharded
    #[must_use]
    pub fn shard(&self) -> Option<String> {
        Some(self.shard_key.clone()).filter(|key| !key.is_empty())
    }

    #[must_use]
    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_secs(self.evaluation_interval_seconds)
    }

    #[must_use]
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_seconds)
    }

    #[must_use]
    pub fn remote_call_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_call_timeout_seconds)
    }

    #[must_use]
    pub fn error_requeue(&self) -> Duration {
        Duration::from_secs(self.error_requeue_seconds)
    }

    #[must_use]
    pub fn capability_backoff(&self) -> Duration {
        Duration::from_secs(self.capability.backoff_seconds)
    }
}

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BatchError, Result};

/// Kernel configuration with all tuning parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Identity recorded on every job execution this kernel runs
    pub server_id: String,
    /// Maximum number of job work units running at once
    pub max_concurrent_jobs: usize,
    /// Capacity of a partitioned step's reply channel (None = one slot per partition)
    pub partition_reply_capacity: Option<usize>,
    /// How long a partitioned step waits without any partition reporting
    /// before declaring the outstanding partitions unreachable
    pub partition_reply_timeout: Duration,
    /// How long coordinators wait for acknowledgements after asking children to stop
    pub stop_grace_period: Duration,
    /// Bounded wait for in-flight work during shutdown
    pub shutdown_timeout: Duration,
    /// Directory of the sled execution repository (None = in-memory)
    pub db_path: Option<PathBuf>,
    /// Level passed to the tracing subscriber
    pub log_level: String,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            server_id: format!("batchkernel-{}", uuid::Uuid::new_v4()),
            max_concurrent_jobs: 64,
            partition_reply_capacity: None,
            partition_reply_timeout: Duration::from_secs(600),
            stop_grace_period: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(60),
            db_path: None,
            log_level: "info".to_string(),
        }
    }
}

impl KernelConfig {
    /// Create a new builder for KernelConfig
    pub fn builder() -> KernelConfigBuilder {
        KernelConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.server_id.trim().is_empty() {
            return Err(BatchError::InvalidConfiguration(
                "server_id must not be empty".to_string(),
            ));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(BatchError::InvalidConfiguration(
                "max_concurrent_jobs must be greater than 0".to_string(),
            ));
        }
        if self.partition_reply_capacity == Some(0) {
            return Err(BatchError::InvalidConfiguration(
                "partition_reply_capacity must be greater than 0".to_string(),
            ));
        }
        if self.partition_reply_timeout.is_zero() {
            return Err(BatchError::InvalidConfiguration(
                "partition_reply_timeout must be greater than 0".to_string(),
            ));
        }
        if self.stop_grace_period > self.shutdown_timeout {
            return Err(BatchError::InvalidConfiguration(
                "stop_grace_period cannot exceed shutdown_timeout".to_string(),
            ));
        }
        if self.log_level.parse::<tracing::Level>().is_err() {
            return Err(BatchError::InvalidConfiguration(format!(
                "unknown log_level {}",
                self.log_level
            )));
        }
        Ok(())
    }

    /// Parse a YAML document; unspecified fields keep their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: KernelConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Create a configuration for development/testing: short waits, debug logging
    pub fn development() -> Self {
        Self {
            max_concurrent_jobs: 8,
            partition_reply_timeout: Duration::from_secs(30),
            stop_grace_period: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(5),
            log_level: "debug".to_string(),
            ..Default::default()
        }
    }

    /// Create a configuration for production
    pub fn production(db_path: impl Into<PathBuf>) -> Self {
        Self {
            max_concurrent_jobs: 256,
            partition_reply_timeout: Duration::from_secs(3600),
            stop_grace_period: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(120),
            db_path: Some(db_path.into()),
            ..Default::default()
        }
    }
}

/// Builder for KernelConfig
pub struct KernelConfigBuilder {
    config: KernelConfig,
}

impl KernelConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: KernelConfig::default(),
        }
    }

    pub fn server_id(mut self, server_id: impl Into<String>) -> Self {
        self.config.server_id = server_id.into();
        self
    }

    pub fn max_concurrent_jobs(mut self, max: usize) -> Self {
        self.config.max_concurrent_jobs = max;
        self
    }

    pub fn partition_reply_capacity(mut self, capacity: usize) -> Self {
        self.config.partition_reply_capacity = Some(capacity);
        self
    }

    pub fn partition_reply_timeout(mut self, timeout: Duration) -> Self {
        self.config.partition_reply_timeout = timeout;
        self
    }

    pub fn stop_grace_period(mut self, grace: Duration) -> Self {
        self.config.stop_grace_period = grace;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    pub fn db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.db_path = Some(path.into());
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.log_level = level.into();
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<KernelConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for KernelConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = KernelConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.server_id.starts_with("batchkernel-"));
    }

    #[test]
    fn test_presets_validate() {
        assert!(KernelConfig::development().validate().is_ok());
        let prod = KernelConfig::production("/var/lib/batch");
        assert!(prod.validate().is_ok());
        assert_eq!(prod.db_path, Some(PathBuf::from("/var/lib/batch")));
    }

    #[test]
    fn test_validation_errors() {
        let mut config = KernelConfig::default();

        config.max_concurrent_jobs = 0;
        assert!(config.validate().is_err());
        config.max_concurrent_jobs = 4;

        config.partition_reply_capacity = Some(0);
        assert!(config.validate().is_err());
        config.partition_reply_capacity = None;

        config.stop_grace_period = config.shutdown_timeout + Duration::from_secs(1);
        assert!(config.validate().is_err());
        config.stop_grace_period = Duration::from_secs(1);

        config.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder() {
        let config = KernelConfig::builder()
            .server_id("node-a")
            .max_concurrent_jobs(3)
            .partition_reply_capacity(16)
            .partition_reply_timeout(Duration::from_millis(250))
            .stop_grace_period(Duration::from_millis(100))
            .build()
            .unwrap();

        assert_eq!(config.server_id, "node-a");
        assert_eq!(config.max_concurrent_jobs, 3);
        assert_eq!(config.partition_reply_capacity, Some(16));
        assert_eq!(config.partition_reply_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_from_yaml_keeps_defaults() {
        let config = KernelConfig::from_yaml_str(
            "server_id: node-b\nmax_concurrent_jobs: 2\nlog_level: warn\n",
        )
        .unwrap();
        assert_eq!(config.server_id, "node-b");
        assert_eq!(config.max_concurrent_jobs, 2);
        assert_eq!(config.stop_grace_period, Duration::from_secs(30));

        assert!(KernelConfig::from_yaml_str("max_concurrent_jobs: 0\n").is_err());
    }
}

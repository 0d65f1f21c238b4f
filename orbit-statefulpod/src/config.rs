//! Operator configuration.
//!
//! Loaded once at startup from a TOML (or YAML) file; every field has a default
//! so an empty file, or no file at all, is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    pub node: NodeConfig,
    pub pod: PodConfig,
    pub reconcile: ReconcileConfig,
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// How long a node may report not-ready before its replicas are evicted
    #[serde(alias = "timeout")]
    pub unhealthy_grace_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            unhealthy_grace_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PodConfig {
    /// How long a replica may stay un-ready after creation before it is recreated
    #[serde(alias = "timeout")]
    pub creation_timeout_secs: u64,
}

impl Default for PodConfig {
    fn default() -> Self {
        Self {
            creation_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Delay before re-checking an operation that is still in flight
    pub requeue_secs: u64,
    /// Periodic resync of converged workloads
    pub resync_secs: u64,
    /// Delay after a failed pass
    pub error_backoff_secs: u64,
    /// Attempts of the optimistic status write before giving up for this pass
    pub max_status_retries: u32,
    /// Workloads reconciled in parallel
    pub concurrency: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            requeue_secs: 5,
            resync_secs: 300,
            error_backoff_secs: 60,
            max_status_retries: 8,
            concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Annotation marking a replica (or volume) whose volume is retained elsewhere
    pub exempt_annotation: String,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            exempt_annotation: "redis-slave".to_string(),
        }
    }
}

impl OperatorConfig {
    /// Load configuration from file; `.yaml`/`.yml` are parsed as YAML,
    /// everything else as TOML.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: Self = match path.extension().and_then(|s| s.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content).map_err(|e| {
                Error::configuration(format!("Failed to parse YAML config: {}", e))
            })?,
            _ => toml::from_str(&content).map_err(|e| {
                Error::configuration(format!("Failed to parse TOML config: {}", e))
            })?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pod.creation_timeout_secs == 0 {
            return Err(Error::configuration(
                "pod.creation_timeout_secs must be greater than 0",
            ));
        }
        if self.reconcile.requeue_secs == 0 {
            return Err(Error::configuration(
                "reconcile.requeue_secs must be greater than 0",
            ));
        }
        if self.reconcile.resync_secs == 0 {
            return Err(Error::configuration(
                "reconcile.resync_secs must be greater than 0",
            ));
        }
        if self.reconcile.error_backoff_secs == 0 {
            return Err(Error::configuration(
                "reconcile.error_backoff_secs must be greater than 0",
            ));
        }
        if self.reconcile.max_status_retries == 0 {
            return Err(Error::configuration(
                "reconcile.max_status_retries must be greater than 0",
            ));
        }
        if self.reconcile.concurrency == 0 {
            return Err(Error::configuration(
                "reconcile.concurrency must be greater than 0",
            ));
        }
        if self.retention.exempt_annotation.is_empty() {
            return Err(Error::configuration(
                "retention.exempt_annotation must not be empty",
            ));
        }
        Ok(())
    }

    pub fn node_grace(&self) -> Duration {
        Duration::from_secs(self.node.unhealthy_grace_secs)
    }

    pub fn creation_timeout(&self) -> Duration {
        Duration::from_secs(self.pod.creation_timeout_secs)
    }

    pub fn requeue(&self) -> Duration {
        Duration::from_secs(self.reconcile.requeue_secs)
    }

    pub fn resync(&self) -> Duration {
        Duration::from_secs(self.reconcile.resync_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.reconcile.error_backoff_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = OperatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.node_grace(), Duration::from_secs(300));
        assert_eq!(config.creation_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn test_load_toml_with_legacy_keys() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[node]\ntimeout = 40\n\n[pod]\ntimeout = 90\n\n[reconcile]\nconcurrency = 8"
        )
        .unwrap();

        let config = OperatorConfig::from_file(file.path()).unwrap();
        assert_eq!(config.node.unhealthy_grace_secs, 40);
        assert_eq!(config.pod.creation_timeout_secs, 90);
        assert_eq!(config.reconcile.concurrency, 8);
        assert_eq!(config.reconcile.requeue_secs, 5);
        assert_eq!(config.retention.exempt_annotation, "redis-slave");
    }

    #[test]
    fn test_load_yaml() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "retention:\n  exempt_annotation: replica-role").unwrap();

        let config = OperatorConfig::from_file(file.path()).unwrap();
        assert_eq!(config.retention.exempt_annotation, "replica-role");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[pod]\ncreation_timeout_secs = 0").unwrap();

        let err = OperatorConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_zero_delays_rejected() {
        let mut config = OperatorConfig::default();
        config.reconcile.resync_secs = 0;
        assert!(config.validate().is_err());

        let mut config = OperatorConfig::default();
        config.reconcile.error_backoff_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("error_backoff_secs"));
    }
}

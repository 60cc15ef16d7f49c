//! Host configuration.
//!
//! Loaded from TOML; carries the call depth limit, the shard layout, the
//! gas schedule table and the logging setup handed to
//! [`crate::telemetry::build_dispatch`].

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::dispatcher::ShardCoordinator;
use crate::error::VmError;
use crate::gas_metering::{GasSchedule, GasTable};
use crate::MAX_CALL_DEPTH;

/// Host configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Maximum number of nested frames
    pub max_call_depth: usize,
    /// Shard layout
    pub shards: ShardConfig,
    /// Gas costs, by category and operation
    pub gas_schedule: GasTable,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            max_call_depth: MAX_CALL_DEPTH,
            shards: ShardConfig::default(),
            gas_schedule: GasSchedule::default().to_table(),
            logging: LoggingConfig::default(),
        }
    }
}

impl HostConfig {
    /// Single shard, free host operations. Contract-declared gas is the
    /// only thing the ledgers see.
    pub fn zero_cost() -> Self {
        Self {
            gas_schedule: GasSchedule::zero().to_table(),
            ..Self::default()
        }
    }

    /// Load configuration from file.
    /// Paths containing `..` are refused.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        if path.to_string_lossy().contains("..") {
            anyhow::bail!("Invalid path: directory traversal detected");
        }

        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e))?;
        let config: HostConfig = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file '{}': {}", path.display(), e))?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn to_file(&self, path: &Path) -> anyhow::Result<()> {
        if path.to_string_lossy().contains("..") {
            anyhow::bail!("Invalid path: directory traversal detected");
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .map_err(|e| anyhow::anyhow!("Failed to write config file '{}': {}", path.display(), e))?;
        Ok(())
    }

    /// Validate configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_call_depth == 0 {
            anyhow::bail!("max_call_depth cannot be 0");
        }
        self.shard_coordinator()?;
        self.schedule()?;
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            anyhow::bail!("Unknown log format '{}'", self.logging.format);
        }
        Ok(())
    }

    pub fn schedule(&self) -> Result<GasSchedule, VmError> {
        GasSchedule::from_table(&self.gas_schedule)
    }

    pub fn shard_coordinator(&self) -> Result<ShardCoordinator, VmError> {
        ShardCoordinator::new(self.shards.num_shards, self.shards.self_shard)
    }
}

/// Shard layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardConfig {
    /// Number of shards in the network
    pub num_shards: u32,
    /// Shard this host executes for
    pub self_shard: u32,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            num_shards: 1,
            self_shard: 0,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `strata::async=trace`
    pub level: String,
    /// Log format (json|pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = HostConfig::default();
        assert_eq!(config.max_call_depth, MAX_CALL_DEPTH);
        assert_eq!(config.schedule().unwrap(), GasSchedule::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = HostConfig::default();
        config.shards = ShardConfig {
            num_shards: 2,
            self_shard: 2,
        };
        assert!(config.validate().is_err());

        let mut config = HostConfig::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());

        let mut config = HostConfig::default();
        config.gas_schedule.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_file_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("host.toml");
        let mut config = HostConfig::zero_cost();
        config.shards.num_shards = 3;
        config.to_file(&path).unwrap();

        let loaded = HostConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.schedule().unwrap(), GasSchedule::zero());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("host.toml");
        std::fs::write(&path, "max_call_depth = 8\n").unwrap();
        let loaded = HostConfig::from_file(&path).unwrap();
        assert_eq!(loaded.max_call_depth, 8);
        assert_eq!(loaded.shards, ShardConfig::default());
    }

    #[test]
    fn test_rejects_traversal() {
        assert!(HostConfig::from_file(&PathBuf::from("../host.toml")).is_err());
        assert!(HostConfig::default().to_file(&PathBuf::from("a/../b.toml")).is_err());
    }
}

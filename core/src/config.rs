use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the feature-flag coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlagConfig {
    /// Path of the persisted enabled-flag record
    pub enabled_file: PathBuf,
    /// Timeout applied to every peer RPC, in milliseconds. `None` means
    /// unbounded.
    pub rpc_timeout_ms: Option<u64>,
}

impl Default for FeatureFlagConfig {
    fn default() -> Self {
        Self {
            enabled_file: PathBuf::from("./data/feature_flags_enabled.json"),
            rpc_timeout_ms: None,
        }
    }
}

impl FeatureFlagConfig {
    /// Store the persisted enabled-flag record at the given path
    pub fn with_enabled_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.enabled_file = path.into();
        self
    }

    /// Bound every peer RPC by the given timeout
    pub fn with_rpc_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.rpc_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn rpc_timeout(&self) -> Option<Duration> {
        self.rpc_timeout_ms.map(Duration::from_millis)
    }

    /// Validate configuration bounds
    pub fn validate(&self) -> crate::Result<()> {
        if self.enabled_file.as_os_str().is_empty() {
            return Err(crate::PulsemqError::Config(
                "enabled_file must not be empty".to_string(),
            ));
        }
        if self.rpc_timeout_ms == Some(0) {
            return Err(crate::PulsemqError::Config(
                "rpc_timeout_ms must be > 0 when set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for the memory-pressure feedback controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryMonitorConfig {
    /// Interval between periodic control-loop passes, in milliseconds
    pub update_interval_ms: u64,
}

impl Default for MemoryMonitorConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: 2500,
        }
    }
}

impl MemoryMonitorConfig {
    pub fn with_update_interval_ms(mut self, interval_ms: u64) -> Self {
        self.update_interval_ms = interval_ms;
        self
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    /// Validate configuration bounds
    pub fn validate(&self) -> crate::Result<()> {
        if self.update_interval_ms == 0 {
            return Err(crate::PulsemqError::Config(
                "update_interval_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

//! VM memory oracle
//!
//! Supplies the raw byte budget the controller derives its working limit
//! from, plus the current usage sampled on every control-loop pass.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Source of the node's memory budget and current usage
pub trait MemoryOracle: Send + Sync {
    /// Raw byte budget, or `None` when memory monitoring is unavailable
    fn limit_bytes(&self) -> Option<u64>;

    /// Bytes currently in use
    fn used_bytes(&self) -> u64;
}

/// Fixed-budget oracle with adjustable usage, for hosts that compute their
/// own budget and for tests
#[derive(Debug)]
pub struct FixedMemoryOracle {
    limit: Option<u64>,
    used: AtomicU64,
}

impl FixedMemoryOracle {
    pub fn new(limit_bytes: u64, used_bytes: u64) -> Self {
        Self {
            limit: Some(limit_bytes),
            used: AtomicU64::new(used_bytes),
        }
    }

    /// An oracle reporting no budget at all
    pub fn unavailable(used_bytes: u64) -> Self {
        Self {
            limit: None,
            used: AtomicU64::new(used_bytes),
        }
    }

    pub fn set_used(&self, used_bytes: u64) {
        self.used.store(used_bytes, Ordering::Relaxed);
    }
}

impl MemoryOracle for FixedMemoryOracle {
    fn limit_bytes(&self) -> Option<u64> {
        self.limit
    }

    fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }
}

/// Oracle backed by the kernel's `/proc/meminfo`
///
/// Usage is `MemTotal - MemAvailable`. An unreadable or unparseable source
/// reports the budget as unavailable and usage as zero.
#[derive(Debug, Clone)]
pub struct ProcMemoryOracle {
    meminfo: PathBuf,
}

impl ProcMemoryOracle {
    pub fn new() -> Self {
        Self {
            meminfo: PathBuf::from("/proc/meminfo"),
        }
    }

    /// Read from an alternate meminfo-formatted file
    pub fn with_source(meminfo: impl Into<PathBuf>) -> Self {
        Self {
            meminfo: meminfo.into(),
        }
    }

    fn field_bytes(text: &str, key: &str) -> Option<u64> {
        let line = text.lines().find(|line| line.starts_with(key))?;
        let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
        Some(kib * 1024)
    }

    fn read(&self) -> Option<(u64, u64)> {
        let text = match std::fs::read_to_string(&self.meminfo) {
            Ok(text) => text,
            Err(err) => {
                warn!("Failed to read {}: {}", self.meminfo.display(), err);
                return None;
            }
        };
        let total = Self::field_bytes(&text, "MemTotal:")?;
        let available = Self::field_bytes(&text, "MemAvailable:")?;
        Some((total, available))
    }
}

impl Default for ProcMemoryOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryOracle for ProcMemoryOracle {
    fn limit_bytes(&self) -> Option<u64> {
        self.read().map(|(total, _)| total)
    }

    fn used_bytes(&self) -> u64 {
        self.read()
            .map(|(total, available)| total.saturating_sub(available))
            .unwrap_or(0)
    }
}

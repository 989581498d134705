//! Persisted enabled-flag record

use super::FlagName;
use std::io::ErrorKind;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

/// Failures reading or writing the enabled-flag record
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed enabled-flag record: {0}")]
    Format(#[from] serde_json::Error),
}

/// Reads and writes the persisted list of enabled flag names
///
/// The record is a single JSON array of names. Writes go to a temporary file
/// in the same directory which is then renamed over the record, so readers
/// never observe a half-written list.
#[derive(Debug, Clone)]
pub struct EnabledStore {
    path: PathBuf,
}

impl EnabledStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// The persisted names, or an empty list when the record does not exist
    pub async fn read(&self) -> Result<Vec<FlagName>, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    /// Atomically replace the record with the given names
    pub async fn write(&self, names: &[FlagName]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let payload = serde_json::to_vec_pretty(names)?;
        let staging = self.path.with_extension("tmp");
        tokio::fs::write(&staging, payload).await?;
        tokio::fs::rename(&staging, &self.path).await?;
        debug!("Persisted {} enabled feature flags", names.len());
        Ok(())
    }
}

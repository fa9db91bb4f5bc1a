//! Configuration structures for MartenDB.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Storage configuration shared by the paged-file layer and everything
/// built on top of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for data and index files.
    pub data_dir: PathBuf,
    /// Enable fsync after page writes.
    pub fsync_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            fsync_enabled: true,
        }
    }
}

impl StorageConfig {
    /// Creates a config rooted at `data_dir` with fsync disabled, as used
    /// by tests and bulk loads.
    pub fn ephemeral(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            fsync_enabled: false,
        }
    }
}

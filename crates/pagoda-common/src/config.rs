//! Configuration types for Pagoda
//!
//! Loading configuration from files or the environment is left to the
//! embedding node; these structures only carry values and defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for a partition replica
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Version chain store configuration
    pub storage: StorageConfig,
    /// Garbage collection configuration
    pub gc: GcConfig,
    /// Snapshot transfer configuration
    pub snapshot: SnapshotConfig,
}

/// Version chain store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding page files and index checkpoints
    pub data_dir: PathBuf,
    /// Page size in bytes (default: 4 KB)
    pub page_size: usize,
    /// Number of pages kept in the page cache
    pub page_cache_pages: usize,
    /// Sync page file on every checkpoint
    pub sync_on_checkpoint: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/pagoda"),
            page_size: 4096,
            page_cache_pages: 4096, // 16 MB at the default page size
            sync_on_checkpoint: true,
        }
    }
}

impl StorageConfig {
    /// Create config with a custom data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Path of the page file for a partition
    #[must_use]
    pub fn page_file(&self, table: &str, partition_id: u16) -> PathBuf {
        self.data_dir
            .join(table)
            .join(format!("part-{partition_id}.pages"))
    }
}

/// Garbage collection configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GcConfig {
    /// Run the background sweeper
    pub enabled: bool,
    /// Interval between sweeps in milliseconds
    pub interval_ms: u64,
    /// Row ids read per batch while sweeping
    pub batch_size: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 10_000,
            batch_size: 256,
        }
    }
}

impl GcConfig {
    /// Sweep interval as a duration
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Snapshot transfer configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Byte budget of a row-version batch
    pub mv_batch_bytes: u64,
    /// Maximum transactions per tx-data batch
    pub tx_batch_size: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            mv_batch_bytes: 1024 * 1024,
            tx_batch_size: 1000,
        }
    }
}

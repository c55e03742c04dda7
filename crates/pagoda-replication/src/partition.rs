//! Partition storage bundle

use pagoda_common::config::StorageConfig;
use pagoda_common::{PartitionKey, Result, StorageFault};
use pagoda_storage::{TableIndexes, VersionChainStore};
use pagoda_tx_state::TxStateStorage;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// What replicated apply and snapshot transfer need from a partition
pub trait PartitionAccess: Send + Sync {
    fn partition_key(&self) -> PartitionKey;

    /// Row storage
    fn mv_partition_storage(&self) -> &VersionChainStore;

    /// Transaction metadata storage
    fn tx_state_storage(&self) -> &TxStateStorage;

    /// Indexes maintained alongside row storage
    fn indexes(&self) -> &TableIndexes;
}

/// Storage of one table partition on one node
pub struct Partition {
    key: PartitionKey,
    mv: Arc<VersionChainStore>,
    tx: TxStateStorage,
    indexes: TableIndexes,
    index_dir: Option<PathBuf>,
}

impl Partition {
    pub fn new(
        key: PartitionKey,
        mv: Arc<VersionChainStore>,
        tx: TxStateStorage,
        indexes: TableIndexes,
    ) -> Self {
        Self {
            key,
            mv,
            tx,
            indexes,
            index_dir: None,
        }
    }

    /// Open file-backed storage under `config.data_dir`
    ///
    /// Fails with [`StorageFault::NeedsRecovery`] when the row storage was
    /// left dirty; see [`Partition::recover`].
    pub fn open(key: PartitionKey, config: &StorageConfig, indexes: TableIndexes) -> Result<Self> {
        let paths = PartitionPaths::new(key, config);
        let mv = VersionChainStore::open(key.partition_id, &paths.pages, config)?;
        let tx = TxStateStorage::open(&paths.tx_state)?;

        let from_checkpoint = indexes.restore(&paths.indexes, &mv)?;
        info!(
            "Opened partition {} (indexes {})",
            key,
            if from_checkpoint { "from checkpoint" } else { "rebuilt" }
        );

        Ok(Self {
            key,
            mv: Arc::new(mv),
            tx,
            indexes,
            index_dir: Some(paths.indexes),
        })
    }

    /// Discard local state and open empty storage, ready for a snapshot install
    pub fn recover(key: PartitionKey, config: &StorageConfig, indexes: TableIndexes) -> Result<Self> {
        let paths = PartitionPaths::new(key, config);
        warn!("Discarding local state of partition {} for recovery", key);

        match std::fs::remove_file(&paths.pages) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageFault::Io(e)),
        }
        let mv = VersionChainStore::open(key.partition_id, &paths.pages, config)?;
        let tx = TxStateStorage::open(&paths.tx_state)?;
        tx.clear()?;
        indexes.clear();

        Ok(Self {
            key,
            mv: Arc::new(mv),
            tx,
            indexes,
            index_dir: Some(paths.indexes),
        })
    }

    /// Shared handle to row storage, e.g. for a GC worker
    pub fn mv_handle(&self) -> Arc<VersionChainStore> {
        Arc::clone(&self.mv)
    }

    /// Checkpoint row storage and indexes at the current applied index
    pub fn checkpoint(&self) -> Result<()> {
        let _barrier = self.mv.freeze_barrier();
        self.mv.flush()?;
        if let Some(dir) = &self.index_dir {
            self.indexes.checkpoint(dir, self.mv.last_applied_index())?;
        }
        Ok(())
    }
}

impl PartitionAccess for Partition {
    fn partition_key(&self) -> PartitionKey {
        self.key
    }

    fn mv_partition_storage(&self) -> &VersionChainStore {
        &self.mv
    }

    fn tx_state_storage(&self) -> &TxStateStorage {
        &self.tx
    }

    fn indexes(&self) -> &TableIndexes {
        &self.indexes
    }
}

struct PartitionPaths {
    pages: PathBuf,
    tx_state: PathBuf,
    indexes: PathBuf,
}

impl PartitionPaths {
    fn new(key: PartitionKey, config: &StorageConfig) -> Self {
        let table = key.table_id.to_string();
        let pages = config.page_file(&table, key.partition_id);
        let dir = pages
            .parent()
            .map_or_else(|| config.data_dir.clone(), std::path::Path::to_path_buf);
        Self {
            tx_state: dir.join(format!("part-{}.tx", key.partition_id)),
            indexes: dir.join(format!("part-{}.idx", key.partition_id)),
            pages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagoda_common::{BinaryRow, IndexId, TableId, Timestamp};
    use tempfile::tempdir;

    fn config(dir: &std::path::Path) -> StorageConfig {
        StorageConfig {
            page_size: 1024,
            ..StorageConfig::with_data_dir(dir)
        }
    }

    #[test]
    fn test_open_checkpoint_reopen() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let key = PartitionKey::new(TableId::new(), 2);
        let pk = IndexId::new();
        let row = BinaryRow::new(1, b"k", b"v");

        {
            let partition = Partition::open(key, &config, TableIndexes::with_primary_key(pk)).unwrap();
            let mv = partition.mv_partition_storage();
            let mut writer = mv.writer(1, 1).unwrap();
            let id = writer.allocate_row_id();
            writer.insert(id, row.clone(), Timestamp::new(1)).unwrap();
            writer.finish();
            partition.indexes().put_all(&row, id);
            partition.checkpoint().unwrap();
        }

        let partition = Partition::open(key, &config, TableIndexes::with_primary_key(pk)).unwrap();
        assert_eq!(partition.mv_partition_storage().last_applied_index(), 1);
        assert_eq!(partition.indexes().primary().get(&row).len(), 1);
    }

    #[test]
    fn test_dirty_partition_needs_recovery() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let key = PartitionKey::new(TableId::new(), 0);
        let pk = IndexId::new();

        {
            let partition = Partition::open(key, &config, TableIndexes::with_primary_key(pk)).unwrap();
            let mut writer = partition.mv_partition_storage().writer(1, 1).unwrap();
            let id = writer.allocate_row_id();
            writer
                .insert(id, BinaryRow::new(1, b"k", b"v"), Timestamp::new(1))
                .unwrap();
            writer.finish();
        }

        let err = Partition::open(key, &config, TableIndexes::with_primary_key(pk))
            .err()
            .unwrap();
        assert!(matches!(err, StorageFault::NeedsRecovery));

        let partition = Partition::recover(key, &config, TableIndexes::with_primary_key(pk)).unwrap();
        assert_eq!(partition.mv_partition_storage().row_count(), 0);
        assert_eq!(partition.mv_partition_storage().last_applied_index(), 0);
    }
}

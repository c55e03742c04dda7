//! Secondary index storage
//!
//! Index entries are derived from rows by resolvers fixed when the index is
//! created. An entry `(tuple, row id)` exists exactly while the row's latest
//! version is live and resolves to `tuple`.

mod schema_aware;
mod sorted;

pub use schema_aware::{
    IndexResolver, TableSchemaAwareIndexStorage, primary_key_resolver, resolver,
};
pub use sorted::{RowIdCursor, SortedIndexStorage};

use crate::chain::RowVersion;
use crate::gc::{IndexGuard, IndexInconsistency};
use crate::mv::VersionChainStore;
use pagoda_common::{BinaryRow, IndexId, Result, RowId, Timestamp};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

const REBUILD_BATCH: usize = 512;

/// Every index of a table partition, primary key first
#[derive(Clone, Debug)]
pub struct TableIndexes {
    indexes: Vec<TableSchemaAwareIndexStorage>,
}

impl TableIndexes {
    pub fn new(primary: TableSchemaAwareIndexStorage) -> Self {
        Self {
            indexes: vec![primary],
        }
    }

    /// Indexes with an empty primary-key index
    pub fn with_primary_key(id: IndexId) -> Self {
        Self::new(TableSchemaAwareIndexStorage::new(
            id,
            Arc::new(SortedIndexStorage::new()),
            primary_key_resolver(),
        ))
    }

    /// Add a secondary index
    #[must_use]
    pub fn with_index(mut self, index: TableSchemaAwareIndexStorage) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn primary(&self) -> &TableSchemaAwareIndexStorage {
        &self.indexes[0]
    }

    pub fn iter(&self) -> impl Iterator<Item = &TableSchemaAwareIndexStorage> {
        self.indexes.iter()
    }

    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }

    pub fn put_all(&self, row: &BinaryRow, row_id: RowId) {
        for index in &self.indexes {
            index.put(row, row_id);
        }
    }

    pub fn remove_all(&self, row: &BinaryRow, row_id: RowId) {
        for index in &self.indexes {
            index.remove(row, row_id);
        }
    }

    /// Move `row_id` from `old`'s tuples to `new`'s where they differ
    pub fn update(&self, old: &BinaryRow, new: &BinaryRow, row_id: RowId) {
        for index in &self.indexes {
            let before = index.resolve_index_row(old);
            let after = index.resolve_index_row(new);
            if before != after {
                index.storage().remove(&before, &row_id);
                index.storage().put(after, row_id);
            }
        }
    }

    pub fn clear(&self) {
        for index in &self.indexes {
            index.storage().clear();
        }
    }

    /// Re-derive every index from the latest live versions in `store`
    pub fn rebuild(&self, store: &VersionChainStore) -> Result<u64> {
        self.clear();
        let mut rows = 0;
        let mut after: Option<RowId> = None;
        loop {
            let batch = store.scan_row_ids(after.as_ref(), REBUILD_BATCH)?;
            let Some(last) = batch.last().copied() else {
                break;
            };
            for row_id in batch {
                if let Some(row) = store.get(&row_id, Timestamp::MAX)? {
                    self.put_all(&row, row_id);
                    rows += 1;
                }
            }
            after = Some(last);
        }
        info!(
            "Rebuilt {} indexes of partition {} from {} rows",
            self.indexes.len(),
            store.partition_id(),
            rows
        );
        Ok(rows)
    }

    /// Write one checkpoint file per index into `dir`
    pub fn checkpoint(&self, dir: &Path, applied_index: u64) -> Result<()> {
        for index in &self.indexes {
            index
                .storage()
                .checkpoint(&Self::checkpoint_path(dir, index.id()), applied_index)?;
        }
        Ok(())
    }

    /// Load checkpoints from `dir`, rebuilding from `store` unless every
    /// index was checkpointed at the store's applied index
    ///
    /// Returns true when the checkpoints were used.
    pub fn restore(&self, dir: &Path, store: &VersionChainStore) -> Result<bool> {
        let applied = store.last_applied_index();
        for index in &self.indexes {
            let loaded = index
                .storage()
                .load_checkpoint(&Self::checkpoint_path(dir, index.id()))?;
            if loaded != Some(applied) {
                info!(
                    "Index {} checkpoint at {:?} does not match applied index {}, rebuilding",
                    index.id(),
                    loaded,
                    applied
                );
                self.rebuild(store)?;
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn checkpoint_path(dir: &Path, id: IndexId) -> std::path::PathBuf {
        dir.join(format!("{id}.idx"))
    }
}

impl IndexGuard for TableIndexes {
    fn check(&self, row_id: &RowId, chain: &[RowVersion]) -> std::result::Result<(), IndexInconsistency> {
        let Some(head) = chain.first() else {
            return Ok(());
        };
        match &head.row {
            Some(row) => {
                for index in &self.indexes {
                    let tuple = index.resolve_index_row(row);
                    if !index.storage().contains(&tuple, row_id) {
                        return Err(IndexInconsistency {
                            row_id: *row_id,
                            index_id: index.id(),
                            reason: format!("live row missing under {tuple:?}"),
                        });
                    }
                }
            }
            None => {
                for row in chain.iter().filter_map(|v| v.row.as_ref()) {
                    for index in &self.indexes {
                        let tuple = index.resolve_index_row(row);
                        if index.storage().contains(&tuple, row_id) {
                            return Err(IndexInconsistency {
                                row_id: *row_id,
                                index_id: index.id(),
                                reason: format!("removed row still indexed under {tuple:?}"),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

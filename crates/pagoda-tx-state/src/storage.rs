//! Persistent tx state storage backed by redb.

use crate::error::{TxStateError, TxStateResult};
use crate::meta::TxMeta;
use crate::tables::{self, APPLIED, LAST_APPLIED_INDEX, LAST_APPLIED_TERM, TX_META};
use pagoda_common::{LogIndex, LogTerm, TxId};
use redb::{Database, ReadableTableMetadata};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

/// Transaction metadata of one partition
pub struct TxStateStorage {
    db: Database,
    path: PathBuf,
}

impl TxStateStorage {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> TxStateResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;
        Self::create_tables(&db)?;

        let storage = Self {
            db,
            path: path.to_path_buf(),
        };
        info!(
            "Opened tx state storage {:?} at applied index {}",
            storage.path,
            storage.last_applied_index()?
        );
        Ok(storage)
    }

    // Create tables eagerly so later read txns don't fail
    fn create_tables(db: &Database) -> TxStateResult<()> {
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(TX_META)?;
            let _t = write_txn.open_table(APPLIED)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn put(&self, tx_id: TxId, meta: &TxMeta) -> TxStateResult<()> {
        let bytes = bincode::serialize(meta)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TX_META)?;
            table.insert(tx_id.as_bytes().as_slice(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Store a batch of records in one transaction
    pub fn put_batch(&self, batch: &[(TxId, TxMeta)]) -> TxStateResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TX_META)?;
            for (tx_id, meta) in batch {
                let bytes = bincode::serialize(meta)?;
                table.insert(tx_id.as_bytes().as_slice(), bytes.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get(&self, tx_id: TxId) -> TxStateResult<Option<TxMeta>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TX_META)?;
        match table.get(tx_id.as_bytes().as_slice())? {
            Some(value) => Ok(Some(bincode::deserialize(value.value())?)),
            None => Ok(None),
        }
    }

    pub fn remove(&self, tx_id: TxId) -> TxStateResult<Option<TxMeta>> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(TX_META)?;
            let removed = table.remove(tx_id.as_bytes().as_slice())?;
            match removed {
                Some(value) => Some(bincode::deserialize(value.value())?),
                None => None,
            }
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// Up to `limit` records with tx id strictly after `after`, in tx id order
    pub fn scan(&self, after: Option<TxId>, limit: usize) -> TxStateResult<Vec<(TxId, TxMeta)>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TX_META)?;

        let after_key = after.map(|tx_id| *tx_id.as_bytes());
        let lower = match &after_key {
            Some(key) => Bound::Excluded(key.as_slice()),
            None => Bound::Unbounded,
        };

        let mut result = Vec::new();
        for entry in table.range::<&[u8]>((lower, Bound::Unbounded))? {
            if result.len() >= limit {
                break;
            }
            let (key, value) = entry?;
            let key = key.value();
            let raw: [u8; 16] = key.try_into().map_err(|_| TxStateError::BadKey(key.len()))?;
            let meta: TxMeta = bincode::deserialize(value.value())?;
            result.push((TxId::from_uuid(Uuid::from_bytes(raw)), meta));
        }
        Ok(result)
    }

    /// Number of stored records
    pub fn len(&self) -> TxStateResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TX_META)?;
        Ok(table.len()?)
    }

    pub fn is_empty(&self) -> TxStateResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn last_applied_index(&self) -> TxStateResult<LogIndex> {
        self.applied_value(LAST_APPLIED_INDEX)
    }

    pub fn last_applied_term(&self) -> TxStateResult<LogTerm> {
        self.applied_value(LAST_APPLIED_TERM)
    }

    pub fn set_last_applied(&self, index: LogIndex, term: LogTerm) -> TxStateResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(APPLIED)?;
            table.insert(LAST_APPLIED_INDEX, index)?;
            table.insert(LAST_APPLIED_TERM, term)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Drop every record and reset the applied position
    pub fn clear(&self) -> TxStateResult<()> {
        let write_txn = self.db.begin_write()?;
        write_txn.delete_table(TX_META)?;
        write_txn.delete_table(APPLIED)?;
        {
            let _t = write_txn.open_table(TX_META)?;
            let _t = write_txn.open_table(APPLIED)?;
        }
        write_txn.commit()?;
        debug!("Cleared tx state storage {:?}", self.path);
        Ok(())
    }

    fn applied_value(&self, key: &str) -> TxStateResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::APPLIED)?;
        Ok(table.get(key)?.map_or(0, |value| value.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::TxState;
    use pagoda_common::{PartitionKey, TableId, Timestamp};
    use tempfile::tempdir;

    fn open() -> (tempfile::TempDir, TxStateStorage) {
        let dir = tempdir().unwrap();
        let storage = TxStateStorage::open(dir.path().join("tx").join("part-0.redb")).unwrap();
        (dir, storage)
    }

    fn tx(n: u64) -> TxId {
        TxId::from_uuid(Uuid::from_u64_pair(0, n))
    }

    #[test]
    fn test_put_get_remove() {
        let (_dir, storage) = open();
        let partition = PartitionKey::new(TableId::new(), 3);
        let meta = TxMeta::committed(Timestamp::new(10), vec![partition]);

        storage.put(tx(1), &meta).unwrap();
        assert_eq!(storage.get(tx(1)).unwrap(), Some(meta.clone()));
        assert_eq!(storage.get(tx(2)).unwrap(), None);

        assert_eq!(storage.remove(tx(1)).unwrap(), Some(meta));
        assert!(storage.is_empty().unwrap());
    }

    #[test]
    fn test_scan_pages_in_tx_id_order() {
        let (_dir, storage) = open();
        let batch: Vec<(TxId, TxMeta)> = (1..=10)
            .rev()
            .map(|n| (tx(n), TxMeta::pending(Vec::new())))
            .collect();
        storage.put_batch(&batch).unwrap();

        let first = storage.scan(None, 4).unwrap();
        assert_eq!(first.len(), 4);
        assert_eq!(first[0].0, tx(1));

        let rest = storage.scan(Some(first[3].0), 100).unwrap();
        assert_eq!(rest.len(), 6);
        assert_eq!(rest[0].0, tx(5));
        assert!(rest.iter().all(|(_, m)| m.state == TxState::Pending));
    }

    #[test]
    fn test_applied_position_and_clear() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("part-0.redb");
        {
            let storage = TxStateStorage::open(&path).unwrap();
            assert_eq!(storage.last_applied_index().unwrap(), 0);
            storage.put(tx(1), &TxMeta::aborted(Vec::new())).unwrap();
            storage.set_last_applied(12, 2).unwrap();
        }

        let storage = TxStateStorage::open(&path).unwrap();
        assert_eq!(storage.last_applied_index().unwrap(), 12);
        assert_eq!(storage.last_applied_term().unwrap(), 2);
        assert_eq!(storage.len().unwrap(), 1);

        storage.clear().unwrap();
        assert_eq!(storage.last_applied_index().unwrap(), 0);
        assert!(storage.is_empty().unwrap());
    }
}

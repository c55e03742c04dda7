//! Ordered in-memory index storage with file checkpoints
//!
//! Checkpoint format:
//! - Header (28 bytes): magic, version, applied index, entry count, crc32c
//!   over the applied index and the body
//! - Body: bincode-encoded `Vec<(IndexTuple, RowId)>` in order

use bytes::{Buf, BufMut};
use pagoda_common::checksum::ChecksumCalculator;
use pagoda_common::{IndexTuple, LogIndex, Result, RowId, StorageFault};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::debug;

const CHECKPOINT_MAGIC: [u8; 4] = *b"PGIX";
const CHECKPOINT_VERSION: u32 = 1;
const CHECKPOINT_HEADER_SIZE: usize = 28;

/// Row ids stored under one tuple
pub struct RowIdCursor {
    inner: std::vec::IntoIter<RowId>,
}

impl Iterator for RowIdCursor {
    type Item = RowId;

    fn next(&mut self) -> Option<RowId> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for RowIdCursor {}

/// Ordered set of `(tuple, row id)` pairs
#[derive(Debug, Default)]
pub struct SortedIndexStorage {
    entries: RwLock<BTreeSet<(IndexTuple, RowId)>>,
}

impl SortedIndexStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Row ids stored under `tuple`, in row id order
    pub fn get(&self, tuple: &IndexTuple) -> RowIdCursor {
        let entries = self.entries.read();
        let row_ids: Vec<RowId> = entries
            .range((tuple.clone(), RowId::lowest(0))..)
            .take_while(|(t, _)| t == tuple)
            .map(|(_, row_id)| *row_id)
            .collect();
        RowIdCursor {
            inner: row_ids.into_iter(),
        }
    }

    /// Add an entry; returns false if it was already present
    pub fn put(&self, tuple: IndexTuple, row_id: RowId) -> bool {
        self.entries.write().insert((tuple, row_id))
    }

    /// Remove an entry; returns false if it was absent
    pub fn remove(&self, tuple: &IndexTuple, row_id: &RowId) -> bool {
        self.entries.write().remove(&(tuple.clone(), *row_id))
    }

    pub fn contains(&self, tuple: &IndexTuple, row_id: &RowId) -> bool {
        self.entries.read().contains(&(tuple.clone(), *row_id))
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Write every entry to `path`, tagged with `applied_index`
    ///
    /// Written to a temporary file and renamed into place.
    pub fn checkpoint(&self, path: &Path, applied_index: LogIndex) -> Result<()> {
        let entries: Vec<(IndexTuple, RowId)> = self.entries.read().iter().cloned().collect();
        let data = bincode::serialize(&entries)
            .map_err(|e| StorageFault::serialization(format!("index checkpoint: {e}")))?;
        let mut checksum = ChecksumCalculator::new();
        checksum.update(&applied_index.to_le_bytes());
        checksum.update(&data);
        let checksum = checksum.finalize();

        let mut header = Vec::with_capacity(CHECKPOINT_HEADER_SIZE);
        header.put_slice(&CHECKPOINT_MAGIC);
        header.put_u32_le(CHECKPOINT_VERSION);
        header.put_u64_le(applied_index);
        header.put_u64_le(entries.len() as u64);
        header.put_u32_le(checksum);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let temp_path = path.with_extension("tmp");
        {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&temp_path)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(&header)?;
            writer.write_all(&data)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        std::fs::rename(&temp_path, path)?;

        debug!(
            "Wrote index checkpoint {:?} ({} entries, applied index {})",
            path,
            entries.len(),
            applied_index
        );
        Ok(())
    }

    /// Replace the contents with the checkpoint at `path`
    ///
    /// Returns the applied index the checkpoint was taken at, or `None` if
    /// there is no checkpoint.
    pub fn load_checkpoint(&self, path: &Path) -> Result<Option<LogIndex>> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut reader = BufReader::new(file);

        let mut header = [0u8; CHECKPOINT_HEADER_SIZE];
        reader.read_exact(&mut header)?;
        let mut buf = &header[..];
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != CHECKPOINT_MAGIC {
            return Err(StorageFault::serialization("index checkpoint has bad magic"));
        }
        let version = buf.get_u32_le();
        if version != CHECKPOINT_VERSION {
            return Err(StorageFault::UnsupportedFormat {
                found: version,
                supported: CHECKPOINT_VERSION,
            });
        }
        let applied_index = buf.get_u64_le();
        let count = buf.get_u64_le();
        let expected = buf.get_u32_le();

        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        let mut checksum = ChecksumCalculator::new();
        checksum.update(&applied_index.to_le_bytes());
        checksum.update(&data);
        let actual = checksum.finalize();
        if actual != expected {
            return Err(StorageFault::serialization(format!(
                "index checkpoint checksum mismatch: expected {expected:#010x}, got {actual:#010x}"
            )));
        }

        let entries: Vec<(IndexTuple, RowId)> = bincode::deserialize(&data)
            .map_err(|e| StorageFault::serialization(format!("index checkpoint: {e}")))?;
        if entries.len() as u64 != count {
            return Err(StorageFault::serialization(format!(
                "index checkpoint holds {} entries, header says {count}",
                entries.len()
            )));
        }

        *self.entries.write() = entries.into_iter().collect();
        Ok(Some(applied_index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn tuple(s: &str) -> IndexTuple {
        IndexTuple::copy_from_slice(s.as_bytes())
    }

    fn id(n: u64) -> RowId {
        RowId::for_log_index(0, n, 0)
    }

    #[test]
    fn test_put_get_remove() {
        let index = SortedIndexStorage::new();
        assert!(index.put(tuple("a"), id(2)));
        assert!(index.put(tuple("a"), id(1)));
        assert!(index.put(tuple("b"), id(3)));
        assert!(!index.put(tuple("a"), id(1)));

        let ids: Vec<RowId> = index.get(&tuple("a")).collect();
        assert_eq!(ids, vec![id(1), id(2)]);
        assert_eq!(index.get(&tuple("c")).len(), 0);

        assert!(index.remove(&tuple("a"), &id(1)));
        assert!(!index.remove(&tuple("a"), &id(1)));
        assert!(!index.contains(&tuple("a"), &id(1)));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_get_does_not_match_prefixes() {
        let index = SortedIndexStorage::new();
        index.put(tuple("ab"), id(1));
        index.put(tuple("abc"), id(2));
        let ids: Vec<RowId> = index.get(&tuple("ab")).collect();
        assert_eq!(ids, vec![id(1)]);
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("idx").join("pk.idx");

        let index = SortedIndexStorage::new();
        for i in 0..100 {
            index.put(tuple(&format!("key-{i:03}")), id(i));
        }
        index.checkpoint(&path, 42).unwrap();

        let loaded = SortedIndexStorage::new();
        loaded.put(tuple("stale"), id(999));
        assert_eq!(loaded.load_checkpoint(&path).unwrap(), Some(42));
        assert_eq!(loaded.len(), 100);
        assert!(!loaded.contains(&tuple("stale"), &id(999)));
        assert!(loaded.contains(&tuple("key-007"), &id(7)));
    }

    #[test]
    fn test_missing_checkpoint() {
        let dir = tempdir().unwrap();
        let index = SortedIndexStorage::new();
        assert_eq!(index.load_checkpoint(&dir.path().join("none.idx")).unwrap(), None);
    }

    #[test]
    fn test_corrupted_checkpoint_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pk.idx");
        let index = SortedIndexStorage::new();
        index.put(tuple("a"), id(1));
        index.checkpoint(&path, 1).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        assert!(SortedIndexStorage::new().load_checkpoint(&path).is_err());
    }

    #[test]
    fn test_checkpoint_applied_index_is_checksummed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pk.idx");
        let index = SortedIndexStorage::new();
        index.put(tuple("a"), id(1));
        index.checkpoint(&path, 7).unwrap();

        // Applied index lives at bytes 8..16 of the header
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[8..16].copy_from_slice(&8u64.to_le_bytes());
        std::fs::write(&path, bytes).unwrap();

        assert!(SortedIndexStorage::new().load_checkpoint(&path).is_err());
    }
}

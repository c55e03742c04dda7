//! Replicated command state machine
//!
//! Commands are applied strictly in log order. Each command runs under the
//! shared side of the partition's snapshot barrier and a single
//! [`PartitionWriter`](pagoda_storage::PartitionWriter), so a snapshot freeze
//! observes either all of a command or none of it.
//!
//! A command whose outcome is decided by current data (duplicate key, failed
//! condition, missing row) is still applied: it advances the applied index
//! with no mutation. Decode and storage failures halt the partition instead.

use crate::command::WriteCommand;
use crate::error::ApplyError;
use crate::partition::PartitionAccess;
use crate::snapshot::message::SnapshotMeta;
use pagoda_common::{BinaryRow, LogIndex, LogTerm, RowId, RowValue};
use pagoda_storage::PartitionWriter;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, error, info};

/// Why a command was applied without a mutation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Insert of a primary key that already has a live row
    DuplicateKey,
    /// Replace whose expected old row is not the current row
    ConditionFailed,
    /// Remove of a key without a live row
    RowNotFound,
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::DuplicateKey => "duplicate key",
            Self::ConditionFailed => "condition failed",
            Self::RowNotFound => "row not found",
        };
        f.write_str(s)
    }
}

/// Result of applying one log entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Applied as a no-op; the applied index still advanced
    Ignored(IgnoreReason),
    /// Index at or below the applied index; nothing happened
    Skipped,
}

/// Apply counters
#[derive(Debug, Default)]
pub struct ListenerStats {
    pub applied: AtomicU64,
    pub ignored: AtomicU64,
    pub skipped: AtomicU64,
}

/// Applies committed commands to one partition
pub struct PartitionListener {
    partition: Arc<dyn PartitionAccess>,
    halted: AtomicBool,
    stats: ListenerStats,
}

impl PartitionListener {
    pub fn new(partition: Arc<dyn PartitionAccess>) -> Self {
        Self {
            partition,
            halted: AtomicBool::new(false),
            stats: ListenerStats::default(),
        }
    }

    pub fn partition(&self) -> &Arc<dyn PartitionAccess> {
        &self.partition
    }

    pub const fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Whether a previous failure stopped application
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Decode a log entry payload and apply it
    pub fn apply_encoded(
        &self,
        payload: &[u8],
        index: LogIndex,
        term: LogTerm,
    ) -> Result<ApplyOutcome, ApplyError> {
        self.check_halted()?;
        match WriteCommand::from_bytes(payload) {
            Ok(command) => self.apply(&command, index, term),
            Err(e) => Err(self.halt(index, ApplyError::decode(e.to_string()))),
        }
    }

    /// Apply the command committed at `index`
    pub fn apply(
        &self,
        command: &WriteCommand,
        index: LogIndex,
        term: LogTerm,
    ) -> Result<ApplyOutcome, ApplyError> {
        let mv = self.partition.mv_partition_storage();
        let _barrier = mv.apply_barrier();
        self.check_halted()?;

        let last_applied = mv.last_applied_index();
        if index <= last_applied {
            debug!(
                "Skipping {} at index {} (applied {})",
                command.kind(),
                index,
                last_applied
            );
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(ApplyOutcome::Skipped);
        }

        match self.apply_command(command, index, term) {
            Ok(outcome) => {
                match outcome {
                    ApplyOutcome::Ignored(reason) => {
                        debug!("{} at index {} ignored: {}", command.kind(), index, reason);
                        self.stats.ignored.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {
                        self.stats.applied.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Ok(outcome)
            }
            Err(e) => Err(self.halt(index, e)),
        }
    }

    /// Stop application before local state is replaced by a snapshot
    ///
    /// Waits for an in-flight command to finish. Application stays halted
    /// until [`Self::on_snapshot_installed`], also when the install fails.
    pub fn begin_snapshot_install(&self) {
        let _barrier = self.partition.mv_partition_storage().freeze_barrier();
        self.halted.store(true, Ordering::Release);
        info!(
            "Halting apply on partition {} for snapshot install",
            self.partition.partition_key()
        );
    }

    /// Resume application after a snapshot replaced local state
    pub fn on_snapshot_installed(&self, meta: &SnapshotMeta) {
        let was_halted = self.halted.swap(false, Ordering::AcqRel);
        info!(
            "Snapshot installed on partition {} at index {} term {}{}",
            self.partition.partition_key(),
            meta.last_included_index,
            meta.last_included_term,
            if was_halted { ", apply resumed" } else { "" }
        );
    }

    fn check_halted(&self) -> Result<(), ApplyError> {
        if self.is_halted() {
            return Err(ApplyError::Halted(self.partition.partition_key()));
        }
        Ok(())
    }

    fn halt(&self, index: LogIndex, e: ApplyError) -> ApplyError {
        self.halted.store(true, Ordering::Release);
        error!(
            "Halting apply on partition {} at index {}: {}",
            self.partition.partition_key(),
            index,
            e
        );
        e
    }

    fn apply_command(
        &self,
        command: &WriteCommand,
        index: LogIndex,
        term: LogTerm,
    ) -> Result<ApplyOutcome, ApplyError> {
        let mv = self.partition.mv_partition_storage();
        let indexes = self.partition.indexes();
        let mut writer = mv.writer(index, term)?;

        let outcome = match command {
            WriteCommand::Insert { row, timestamp } => {
                let row = decode(row)?;
                if self.find_live(&writer, &row)?.is_some() {
                    ApplyOutcome::Ignored(IgnoreReason::DuplicateKey)
                } else {
                    let row_id = writer.allocate_row_id();
                    writer.insert(row_id, row.clone(), *timestamp)?;
                    indexes.put_all(&row, row_id);
                    ApplyOutcome::Applied
                }
            }
            WriteCommand::Replace {
                old_row,
                new_row,
                timestamp,
            } => {
                let old_row = decode(old_row)?;
                let new_row = decode(new_row)?;
                match self.find_live(&writer, &old_row)? {
                    Some((row_id, current)) if current.as_bytes() == old_row.as_bytes() => {
                        writer.replace(row_id, new_row.clone(), *timestamp)?;
                        indexes.update(&current, &new_row, row_id);
                        ApplyOutcome::Applied
                    }
                    _ => ApplyOutcome::Ignored(IgnoreReason::ConditionFailed),
                }
            }
            WriteCommand::Remove { row_key, timestamp } => {
                let row_key = decode(row_key)?;
                match self.find_live(&writer, &row_key)? {
                    Some((row_id, current)) => {
                        writer.remove(row_id, *timestamp)?;
                        indexes.remove_all(&current, row_id);
                        ApplyOutcome::Applied
                    }
                    None => ApplyOutcome::Ignored(IgnoreReason::RowNotFound),
                }
            }
        };

        writer.finish();
        self.partition.tx_state_storage().set_last_applied(index, term)?;
        Ok(outcome)
    }

    /// Live row under `row`'s primary key, as of before this command
    fn find_live(
        &self,
        writer: &PartitionWriter<'_>,
        row: &BinaryRow,
    ) -> Result<Option<(RowId, BinaryRow)>, ApplyError> {
        for row_id in self.partition.indexes().primary().get(row) {
            if let Some(current) = writer.current(&row_id)? {
                return Ok(Some((row_id, current)));
            }
        }
        Ok(None)
    }
}

fn decode(value: &RowValue) -> Result<BinaryRow, ApplyError> {
    value.decode().map_err(|e| ApplyError::decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::Partition;
    use bytes::Bytes;
    use pagoda_common::{IndexId, PartitionKey, TableId, Timestamp};
    use pagoda_storage::{TableIndexes, VersionChainStore};
    use pagoda_tx_state::TxStateStorage;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        partition: Arc<Partition>,
        listener: PartitionListener,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let partition = Arc::new(Partition::new(
            PartitionKey::new(TableId::new(), 0),
            Arc::new(VersionChainStore::volatile(0, 1024).unwrap()),
            TxStateStorage::open(dir.path().join("tx.redb")).unwrap(),
            TableIndexes::with_primary_key(IndexId::new()),
        ));
        let listener = PartitionListener::new(Arc::clone(&partition) as Arc<dyn PartitionAccess>);
        Fixture {
            _dir: dir,
            partition,
            listener,
        }
    }

    fn row(key: &str, value: &str) -> BinaryRow {
        BinaryRow::new(1, key.as_bytes(), value.as_bytes())
    }

    fn insert(key: &str, value: &str, ts: u64) -> WriteCommand {
        WriteCommand::Insert {
            row: row(key, value).into(),
            timestamp: Timestamp::new(ts),
        }
    }

    fn latest(f: &Fixture, key: &str) -> Option<BinaryRow> {
        let lookup = BinaryRow::key_only(1, key.as_bytes());
        let mv = f.partition.mv_partition_storage();
        f.partition
            .indexes()
            .primary()
            .get(&lookup)
            .find_map(|id| mv.get(&id, Timestamp::MAX).unwrap())
    }

    #[test]
    fn test_insert_replace_remove() {
        let f = fixture();
        assert_eq!(
            f.listener.apply(&insert("k", "a", 1), 1, 1).unwrap(),
            ApplyOutcome::Applied
        );

        let replace = WriteCommand::Replace {
            old_row: row("k", "a").into(),
            new_row: row("k", "b").into(),
            timestamp: Timestamp::new(5),
        };
        assert_eq!(f.listener.apply(&replace, 2, 1).unwrap(), ApplyOutcome::Applied);
        assert_eq!(latest(&f, "k"), Some(row("k", "b")));

        let remove = WriteCommand::Remove {
            row_key: BinaryRow::key_only(1, b"k").into(),
            timestamp: Timestamp::new(8),
        };
        assert_eq!(f.listener.apply(&remove, 3, 1).unwrap(), ApplyOutcome::Applied);
        assert_eq!(latest(&f, "k"), None);
        assert!(f.partition.indexes().primary().storage().is_empty());

        let mv = f.partition.mv_partition_storage();
        assert_eq!(mv.last_applied_index(), 3);
        assert_eq!(f.partition.tx_state_storage().last_applied_index().unwrap(), 3);

        let id = RowId::for_log_index(0, 1, 0);
        assert_eq!(mv.get(&id, Timestamp::new(3)).unwrap(), Some(row("k", "a")));
        assert_eq!(mv.get(&id, Timestamp::new(6)).unwrap(), Some(row("k", "b")));
        assert_eq!(mv.get(&id, Timestamp::new(9)).unwrap(), None);
    }

    #[test]
    fn test_reapplied_index_is_skipped() {
        let f = fixture();
        f.listener.apply(&insert("k", "a", 1), 1, 1).unwrap();
        assert_eq!(
            f.listener.apply(&insert("k", "a", 1), 1, 1).unwrap(),
            ApplyOutcome::Skipped
        );
        assert_eq!(f.partition.mv_partition_storage().row_count(), 1);
        assert_eq!(f.listener.stats().skipped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_ignored_outcomes_advance_applied_index() {
        let f = fixture();
        f.listener.apply(&insert("k", "a", 1), 1, 1).unwrap();

        assert_eq!(
            f.listener.apply(&insert("k", "z", 2), 2, 1).unwrap(),
            ApplyOutcome::Ignored(IgnoreReason::DuplicateKey)
        );

        let stale = WriteCommand::Replace {
            old_row: row("k", "not-a").into(),
            new_row: row("k", "b").into(),
            timestamp: Timestamp::new(3),
        };
        assert_eq!(
            f.listener.apply(&stale, 3, 1).unwrap(),
            ApplyOutcome::Ignored(IgnoreReason::ConditionFailed)
        );

        let missing = WriteCommand::Remove {
            row_key: BinaryRow::key_only(1, b"nope").into(),
            timestamp: Timestamp::new(4),
        };
        assert_eq!(
            f.listener.apply(&missing, 4, 2).unwrap(),
            ApplyOutcome::Ignored(IgnoreReason::RowNotFound)
        );

        let mv = f.partition.mv_partition_storage();
        assert_eq!(mv.last_applied_index(), 4);
        assert_eq!(mv.last_applied_term(), 2);
        assert_eq!(latest(&f, "k"), Some(row("k", "a")));
    }

    #[test]
    fn test_reinsert_after_remove_gets_new_row_id() {
        let f = fixture();
        f.listener.apply(&insert("k", "a", 1), 1, 1).unwrap();
        let remove = WriteCommand::Remove {
            row_key: BinaryRow::key_only(1, b"k").into(),
            timestamp: Timestamp::new(2),
        };
        f.listener.apply(&remove, 2, 1).unwrap();
        assert_eq!(
            f.listener.apply(&insert("k", "b", 3), 3, 1).unwrap(),
            ApplyOutcome::Applied
        );
        assert_eq!(latest(&f, "k"), Some(row("k", "b")));
        assert_eq!(f.partition.mv_partition_storage().row_count(), 2);
    }

    #[test]
    fn test_decode_failure_halts() {
        let f = fixture();
        let err = f.listener.apply_encoded(&[0xff, 0x01], 1, 1).unwrap_err();
        assert!(matches!(err, ApplyError::Decode(_)));
        assert!(f.listener.is_halted());

        let err = f.listener.apply(&insert("k", "a", 1), 1, 1).unwrap_err();
        assert!(matches!(err, ApplyError::Halted(_)));
        assert_eq!(f.partition.mv_partition_storage().last_applied_index(), 0);

        f.listener.on_snapshot_installed(&SnapshotMeta::default());
        assert!(!f.listener.is_halted());
        assert_eq!(
            f.listener.apply(&insert("k", "a", 1), 1, 1).unwrap(),
            ApplyOutcome::Applied
        );
    }

    #[test]
    fn test_snapshot_install_halts_until_installed() {
        let f = fixture();
        f.listener.apply(&insert("k", "a", 1), 1, 1).unwrap();

        f.listener.begin_snapshot_install();
        assert!(f.listener.is_halted());
        let err = f.listener.apply(&insert("j", "a", 2), 2, 1).unwrap_err();
        assert!(matches!(err, ApplyError::Halted(_)));
        assert_eq!(f.partition.mv_partition_storage().last_applied_index(), 1);

        f.listener.on_snapshot_installed(&SnapshotMeta::default());
        assert_eq!(
            f.listener.apply(&insert("j", "a", 2), 2, 1).unwrap(),
            ApplyOutcome::Applied
        );
    }

    #[test]
    fn test_storage_fault_halts_without_advancing() {
        let f = fixture();
        f.listener.apply(&insert("k", "a", 10), 1, 1).unwrap();

        // Commit timestamp older than the head violates chain order
        let replace = WriteCommand::Replace {
            old_row: row("k", "a").into(),
            new_row: row("k", "b").into(),
            timestamp: Timestamp::new(5),
        };
        let err = f.listener.apply(&replace, 2, 1).unwrap_err();
        assert!(matches!(err, ApplyError::Storage(_)));
        assert!(f.listener.is_halted());
        assert_eq!(f.partition.mv_partition_storage().last_applied_index(), 1);
    }

    #[test]
    fn test_encoded_commands() {
        let f = fixture();
        let payload = insert("k", "a", 1).to_bytes().unwrap();
        assert_eq!(
            f.listener.apply_encoded(&payload, 1, 1).unwrap(),
            ApplyOutcome::Applied
        );
        let bad_row = WriteCommand::Insert {
            row: RowValue::Encoded(Bytes::from_static(&[1, 2])),
            timestamp: Timestamp::new(2),
        };
        assert!(matches!(
            f.listener.apply(&bad_row, 2, 1),
            Err(ApplyError::Decode(_))
        ));
    }
}

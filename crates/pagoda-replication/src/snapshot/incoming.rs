//! Receiving side of a snapshot session
//!
//! The copier replaces all local partition state with the image served by
//! a frozen [`OutgoingSnapshot`]: row version chains (with index entries for
//! live rows), then tx metadata, then the applied indices. Storage writes run
//! on the blocking pool.

use super::SnapshotId;
use super::message::{
    ResponseEntry, SnapshotMeta, SnapshotMetaRequest, SnapshotMetaResponse, SnapshotMvDataRequest,
    SnapshotMvDataResponse, SnapshotTxDataRequest, SnapshotTxDataResponse,
};
use super::outgoing::OutgoingSnapshot;
use crate::error::CopyError;
use crate::listener::PartitionListener;
use crate::partition::PartitionAccess;
use crate::raft_error::Status;
use async_trait::async_trait;
use pagoda_common::config::SnapshotConfig;
use pagoda_common::{ExecutionContext, TxId};
use pagoda_tx_state::TxMeta;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where snapshot data comes from; `None` means the session is gone
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn snapshot_meta(
        &self,
        request: SnapshotMetaRequest,
    ) -> Result<Option<SnapshotMetaResponse>, Status>;

    async fn mv_data(
        &self,
        request: SnapshotMvDataRequest,
    ) -> Result<Option<SnapshotMvDataResponse>, Status>;

    async fn tx_data(
        &self,
        request: SnapshotTxDataRequest,
    ) -> Result<Option<SnapshotTxDataResponse>, Status>;
}

/// Source backed by a session on this node
pub struct LocalSnapshotSource {
    snapshot: Arc<OutgoingSnapshot>,
}

impl LocalSnapshotSource {
    pub const fn new(snapshot: Arc<OutgoingSnapshot>) -> Self {
        Self { snapshot }
    }
}

#[async_trait]
impl SnapshotSource for LocalSnapshotSource {
    async fn snapshot_meta(
        &self,
        request: SnapshotMetaRequest,
    ) -> Result<Option<SnapshotMetaResponse>, Status> {
        self.snapshot
            .handle_snapshot_meta_request(&request)
            .map_err(|e| Status::from(&e))
    }

    async fn mv_data(
        &self,
        request: SnapshotMvDataRequest,
    ) -> Result<Option<SnapshotMvDataResponse>, Status> {
        self.snapshot
            .handle_snapshot_mv_data_request(&request)
            .map_err(|e| Status::from(&e))
    }

    async fn tx_data(
        &self,
        request: SnapshotTxDataRequest,
    ) -> Result<Option<SnapshotTxDataResponse>, Status> {
        self.snapshot
            .handle_snapshot_tx_data_request(&request)
            .map_err(|e| Status::from(&e))
    }
}

/// Installs one snapshot into the local partition
pub struct IncomingSnapshotCopier {
    partition: Arc<dyn PartitionAccess>,
    listener: Arc<PartitionListener>,
    source: Arc<dyn SnapshotSource>,
    snapshot_id: SnapshotId,
    config: SnapshotConfig,
}

impl IncomingSnapshotCopier {
    pub fn new(
        listener: Arc<PartitionListener>,
        source: Arc<dyn SnapshotSource>,
        snapshot_id: SnapshotId,
        config: SnapshotConfig,
    ) -> Self {
        Self {
            partition: Arc::clone(listener.partition()),
            listener,
            source,
            snapshot_id,
            config,
        }
    }

    /// Copy the snapshot and resume the listener
    ///
    /// On error after local state was cleared, the partition is left
    /// partially written with apply halted; it must be copied again.
    pub async fn copy(&self, ctx: &ExecutionContext) -> Result<SnapshotMeta, CopyError> {
        let key = self.partition.partition_key();
        check(ctx)?;

        let meta = self
            .source
            .snapshot_meta(SnapshotMetaRequest {
                id: self.snapshot_id,
            })
            .await
            .map_err(CopyError::Source)?
            .ok_or(CopyError::SessionGone)?
            .meta;
        info!(
            "Installing snapshot {} on partition {} at index {} term {}",
            self.snapshot_id, key, meta.last_included_index, meta.last_included_term
        );

        // Apply stays halted until the install completes
        let listener = Arc::clone(&self.listener);
        tokio::task::spawn_blocking(move || {
            listener.begin_snapshot_install();
            clear_partition(listener.partition().as_ref())
        })
        .await??;

        let rows = self.copy_mv_data(ctx, &meta).await?;
        let transactions = self.copy_tx_data(ctx).await?;

        let partition = Arc::clone(&self.partition);
        let (index, term) = (meta.last_included_index, meta.last_included_term);
        tokio::task::spawn_blocking(move || -> Result<(), CopyError> {
            partition.mv_partition_storage().set_last_applied(index, term)?;
            partition.tx_state_storage().set_last_applied(index, term)?;
            partition.mv_partition_storage().flush()?;
            Ok(())
        })
        .await??;

        self.listener.on_snapshot_installed(&meta);
        info!(
            "Installed snapshot {} on partition {}: {} rows, {} transactions",
            self.snapshot_id, key, rows, transactions
        );
        Ok(meta)
    }

    async fn copy_mv_data(&self, ctx: &ExecutionContext, meta: &SnapshotMeta) -> Result<u64, CopyError> {
        let mut rows = 0u64;
        loop {
            check(ctx)?;
            let response = self
                .source
                .mv_data(SnapshotMvDataRequest {
                    id: self.snapshot_id,
                    batch_size_hint: self.config.mv_batch_bytes,
                })
                .await
                .map_err(CopyError::Source)?
                .ok_or(CopyError::SessionGone)?;

            let finish = response.finish;
            rows += response.rows.len() as u64;
            let partition = Arc::clone(&self.partition);
            let (index, term) = (meta.last_included_index, meta.last_included_term);
            tokio::task::spawn_blocking(move || {
                write_rows(partition.as_ref(), index, term, &response.rows)
            })
            .await??;

            if finish {
                debug!("Copied {} rows of snapshot {}", rows, self.snapshot_id);
                return Ok(rows);
            }
        }
    }

    async fn copy_tx_data(&self, ctx: &ExecutionContext) -> Result<u64, CopyError> {
        let mut transactions = 0u64;
        loop {
            check(ctx)?;
            let response = self
                .source
                .tx_data(SnapshotTxDataRequest {
                    id: self.snapshot_id,
                    max_transactions: self.config.tx_batch_size,
                })
                .await
                .map_err(CopyError::Source)?
                .ok_or(CopyError::SessionGone)?;

            let finish = response.finish;
            transactions += response.transactions.len() as u64;
            let partition = Arc::clone(&self.partition);
            tokio::task::spawn_blocking(move || write_transactions(partition.as_ref(), &response.transactions))
                .await??;

            if finish {
                return Ok(transactions);
            }
        }
    }
}

fn check(ctx: &ExecutionContext) -> Result<(), CopyError> {
    ctx.check().map_err(|_| {
        warn!("Snapshot copy cancelled");
        CopyError::Cancelled
    })
}

fn clear_partition(partition: &dyn PartitionAccess) -> Result<(), CopyError> {
    partition.mv_partition_storage().clear()?;
    partition.indexes().clear();
    partition.tx_state_storage().clear()?;
    Ok(())
}

/// Rebuild streamed chains; the applied index only moves once the copy ends
fn write_rows(
    partition: &dyn PartitionAccess,
    index: u64,
    term: u64,
    rows: &[ResponseEntry],
) -> Result<(), CopyError> {
    let indexes = partition.indexes();
    let mut writer = partition.mv_partition_storage().writer(index, term)?;
    for entry in rows {
        let oldest_first: Vec<_> = entry.versions.iter().rev().cloned().collect();
        writer.restore_chain(entry.row_id, &oldest_first)?;
        if let Some(row) = entry.versions.first().and_then(|head| head.row.as_ref()) {
            indexes.put_all(row, entry.row_id);
        }
    }
    Ok(())
}

fn write_transactions(partition: &dyn PartitionAccess, batch: &[(TxId, TxMeta)]) -> Result<(), CopyError> {
    if !batch.is_empty() {
        partition.tx_state_storage().put_batch(batch)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::WriteCommand;
    use crate::error::ApplyError;
    use crate::listener::ApplyOutcome;
    use crate::listener::IgnoreReason;
    use crate::partition::Partition;
    use crate::raft_error::RaftError;
    use crate::snapshot::log::LogHistory;
    use crate::snapshot::registry::SnapshotRegistry;
    use pagoda_common::{BinaryRow, IndexId, PartitionKey, TableId, Timestamp};
    use pagoda_storage::{TableIndexes, VersionChainStore};
    use pagoda_tx_state::TxStateStorage;
    use tempfile::TempDir;
    use uuid::Uuid;

    struct Node {
        _dir: TempDir,
        partition: Arc<Partition>,
        listener: Arc<PartitionListener>,
    }

    impl Node {
        fn new(key: PartitionKey) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let partition = Arc::new(Partition::new(
                key,
                Arc::new(VersionChainStore::volatile(key.partition_id, 1024).unwrap()),
                TxStateStorage::open(dir.path().join("tx.redb")).unwrap(),
                TableIndexes::with_primary_key(IndexId::new()),
            ));
            let listener = Arc::new(PartitionListener::new(
                Arc::clone(&partition) as Arc<dyn PartitionAccess>
            ));
            Self {
                _dir: dir,
                partition,
                listener,
            }
        }

        fn access(&self) -> Arc<dyn PartitionAccess> {
            Arc::clone(&self.partition) as Arc<dyn PartitionAccess>
        }

        fn latest(&self, key: &str) -> Option<BinaryRow> {
            let lookup = BinaryRow::key_only(1, key.as_bytes());
            let mv = self.partition.mv_partition_storage();
            self.partition
                .indexes()
                .primary()
                .get(&lookup)
                .find_map(|id| mv.get(&id, Timestamp::MAX).unwrap())
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

    fn small_batches() -> SnapshotConfig {
        SnapshotConfig {
            mv_batch_bytes: 128,
            tx_batch_size: 2,
        }
    }

    #[tokio::test]
    async fn test_copy_between_partitions() {
        let key = PartitionKey::new(TableId::new(), 3);
        let source = Node::new(key);
        let target = Node::new(key);

        let mut index = 0;
        for n in 0..10u64 {
            index += 1;
            let outcome = source
                .listener
                .apply(&insert(&format!("k{n}"), "a", index), index, 2)
                .unwrap();
            assert_eq!(outcome, ApplyOutcome::Applied);
        }
        index += 1;
        let replace = WriteCommand::Replace {
            old_row: row("k0", "a").into(),
            new_row: row("k0", "b").into(),
            timestamp: Timestamp::new(index),
        };
        source.listener.apply(&replace, index, 2).unwrap();
        index += 1;
        let remove = WriteCommand::Remove {
            row_key: BinaryRow::key_only(1, b"k1").into(),
            timestamp: Timestamp::new(index),
        };
        source.listener.apply(&remove, index, 2).unwrap();

        let tx = source.partition.tx_state_storage();
        for n in 0..5 {
            tx.put(
                TxId::from_uuid(Uuid::from_u64_pair(0, n)),
                &TxMeta::committed(Timestamp::new(n + 1), vec![key]),
            )
            .unwrap();
        }

        let log = Arc::new(LogHistory::new());
        log.record_term(1, 2);
        let registry = SnapshotRegistry::new();
        let snapshot = registry.start_outgoing(source.access(), log).unwrap();

        let copier = IncomingSnapshotCopier::new(
            Arc::clone(&target.listener),
            Arc::new(LocalSnapshotSource::new(Arc::clone(&snapshot))),
            snapshot.id(),
            small_batches(),
        );
        let meta = copier.copy(&ExecutionContext::new()).await.unwrap();
        assert!(registry.finish(snapshot.id()));

        assert_eq!(meta.last_included_index, index);
        assert_eq!(meta.last_included_term, 2);

        let mv = target.partition.mv_partition_storage();
        assert_eq!(mv.last_applied_index(), index);
        assert_eq!(mv.last_applied_term(), 2);
        assert_eq!(
            target.partition.tx_state_storage().last_applied_index().unwrap(),
            index
        );
        assert_eq!(target.partition.tx_state_storage().len().unwrap(), 5);

        assert_eq!(target.latest("k0"), Some(row("k0", "b")));
        assert_eq!(target.latest("k1"), None);
        assert_eq!(target.latest("k9"), Some(row("k9", "a")));

        let source_mv = source.partition.mv_partition_storage();
        for row_id in source_mv.scan_row_ids(None, 100).unwrap() {
            assert_eq!(mv.read_chain(&row_id).unwrap(), source_mv.read_chain(&row_id).unwrap());
        }

        // Indexes were rebuilt, so apply continues with the right conflicts
        let outcome = target.listener.apply(&insert("k5", "x", 100), index + 1, 2).unwrap();
        assert_eq!(outcome, ApplyOutcome::Ignored(IgnoreReason::DuplicateKey));
        let outcome = target.listener.apply(&insert("k1", "x", 101), index + 2, 2).unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);
    }

    #[tokio::test]
    async fn test_copy_replaces_local_state() {
        let key = PartitionKey::new(TableId::new(), 0);
        let source = Node::new(key);
        let target = Node::new(key);
        source.listener.apply(&insert("a", "1", 1), 1, 1).unwrap();
        target.listener.apply(&insert("stale", "1", 1), 1, 1).unwrap();

        let registry = SnapshotRegistry::new();
        let snapshot = registry
            .start_outgoing(source.access(), Arc::new(LogHistory::new()))
            .unwrap();
        IncomingSnapshotCopier::new(
            Arc::clone(&target.listener),
            Arc::new(LocalSnapshotSource::new(snapshot.clone())),
            snapshot.id(),
            SnapshotConfig::default(),
        )
        .copy(&ExecutionContext::new())
        .await
        .unwrap();

        assert_eq!(target.latest("stale"), None);
        assert_eq!(target.latest("a"), Some(row("a", "1")));
        assert_eq!(target.partition.mv_partition_storage().row_count(), 1);
    }

    /// Answers the meta request, then behaves as a closed session
    struct VanishingSource {
        meta: SnapshotMeta,
    }

    #[async_trait]
    impl SnapshotSource for VanishingSource {
        async fn snapshot_meta(
            &self,
            _: SnapshotMetaRequest,
        ) -> Result<Option<SnapshotMetaResponse>, Status> {
            Ok(Some(SnapshotMetaResponse {
                meta: self.meta.clone(),
            }))
        }

        async fn mv_data(
            &self,
            _: SnapshotMvDataRequest,
        ) -> Result<Option<SnapshotMvDataResponse>, Status> {
            Ok(None)
        }

        async fn tx_data(
            &self,
            _: SnapshotTxDataRequest,
        ) -> Result<Option<SnapshotTxDataResponse>, Status> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_failed_copy_keeps_apply_halted() {
        let key = PartitionKey::new(TableId::new(), 0);
        let target = Node::new(key);
        for (index, name) in ["a", "b", "c"].iter().enumerate() {
            let index = index as u64 + 1;
            target.listener.apply(&insert(name, "1", index), index, 1).unwrap();
        }

        let vanishing = VanishingSource {
            meta: SnapshotMeta {
                last_included_index: 10,
                last_included_term: 2,
                ..SnapshotMeta::default()
            },
        };
        let err = IncomingSnapshotCopier::new(
            Arc::clone(&target.listener),
            Arc::new(vanishing),
            Uuid::new_v4(),
            SnapshotConfig::default(),
        )
        .copy(&ExecutionContext::new())
        .await
        .unwrap_err();
        assert!(matches!(err, CopyError::SessionGone));

        // Local state was cleared, so nothing may be applied on top of it
        assert!(target.listener.is_halted());
        let err = target.listener.apply(&insert("d", "1", 4), 4, 1).unwrap_err();
        assert!(matches!(err, ApplyError::Halted(_)));
        assert_eq!(target.partition.mv_partition_storage().last_applied_index(), 0);

        // A complete copy resumes apply
        let source = Node::new(key);
        source.listener.apply(&insert("x", "1", 1), 1, 1).unwrap();
        let registry = SnapshotRegistry::new();
        let snapshot = registry
            .start_outgoing(source.access(), Arc::new(LogHistory::new()))
            .unwrap();
        IncomingSnapshotCopier::new(
            Arc::clone(&target.listener),
            Arc::new(LocalSnapshotSource::new(snapshot.clone())),
            snapshot.id(),
            SnapshotConfig::default(),
        )
        .copy(&ExecutionContext::new())
        .await
        .unwrap();
        assert!(!target.listener.is_halted());
        assert_eq!(
            target.listener.apply(&insert("d", "1", 4), 2, 1).unwrap(),
            ApplyOutcome::Applied
        );
    }

    #[tokio::test]
    async fn test_closed_session_is_gone() {
        let key = PartitionKey::new(TableId::new(), 0);
        let source = Node::new(key);
        let target = Node::new(key);
        let registry = SnapshotRegistry::new();
        let snapshot = registry
            .start_outgoing(source.access(), Arc::new(LogHistory::new()))
            .unwrap();
        registry.finish(snapshot.id());

        let err = IncomingSnapshotCopier::new(
            Arc::clone(&target.listener),
            Arc::new(LocalSnapshotSource::new(snapshot.clone())),
            snapshot.id(),
            SnapshotConfig::default(),
        )
        .copy(&ExecutionContext::new())
        .await
        .unwrap_err();
        assert!(matches!(err, CopyError::SessionGone));
    }

    #[tokio::test]
    async fn test_unfrozen_source_means_retry_later() {
        let key = PartitionKey::new(TableId::new(), 0);
        let source = Node::new(key);
        let target = Node::new(key);
        let snapshot = Arc::new(OutgoingSnapshot::new(
            Uuid::new_v4(),
            source.access(),
            Arc::new(LogHistory::new()),
        ));

        let err = IncomingSnapshotCopier::new(
            Arc::clone(&target.listener),
            Arc::new(LocalSnapshotSource::new(snapshot.clone())),
            snapshot.id(),
            SnapshotConfig::default(),
        )
        .copy(&ExecutionContext::new())
        .await
        .unwrap_err();
        assert!(err.retry_later());

        let wrong = IncomingSnapshotCopier::new(
            Arc::clone(&target.listener),
            Arc::new(LocalSnapshotSource::new(snapshot)),
            Uuid::new_v4(),
            SnapshotConfig::default(),
        )
        .copy(&ExecutionContext::new())
        .await
        .unwrap_err();
        match wrong {
            CopyError::Source(status) => assert_eq!(status.error, RaftError::EPerm),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_copy_leaves_partition_untouched() {
        let key = PartitionKey::new(TableId::new(), 0);
        let source = Node::new(key);
        let target = Node::new(key);
        target.listener.apply(&insert("local", "1", 1), 1, 1).unwrap();

        let registry = SnapshotRegistry::new();
        let snapshot = registry
            .start_outgoing(source.access(), Arc::new(LogHistory::new()))
            .unwrap();
        let ctx = ExecutionContext::new();
        ctx.token().cancel();

        let err = IncomingSnapshotCopier::new(
            Arc::clone(&target.listener),
            Arc::new(LocalSnapshotSource::new(snapshot.clone())),
            snapshot.id(),
            SnapshotConfig::default(),
        )
        .copy(&ctx)
        .await
        .unwrap_err();
        assert!(matches!(err, CopyError::Cancelled));
        assert_eq!(target.latest("local"), Some(row("local", "1")));
    }
}

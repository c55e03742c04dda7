//! Version chain store
//!
//! Maps each [`RowId`] to a reverse-chronological chain of committed
//! versions. Reads resolve MVCC visibility by walking a chain head to tail
//! and returning the first version whose commit timestamp is at or below the
//! read timestamp. Writes only ever append a new head.
//!
//! Locking:
//! - `state` is the append barrier. Readers share it; a [`PartitionWriter`]
//!   and GC pruning take it exclusively.
//! - `snapshot_lock` separates whole commands from snapshot freezes: the
//!   apply path holds the shared side for one command, a freeze holds the
//!   exclusive side while it captures applied indices.

use crate::btree;
use crate::chain::{self, Link, RowVersion, VersionNode};
use crate::gc::{IndexGuard, IndexInconsistency, WatermarkPin, WatermarkPins};
use crate::memory::{FilePageMemory, PageMemory, VolatilePageMemory};
use crate::meta::StoreMeta;
use crate::pager::Pager;
use pagoda_common::config::StorageConfig;
use pagoda_common::{
    BinaryRow, LogIndex, LogTerm, PageId, Result, RowId, StorageFault, Timestamp,
};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Store statistics
#[derive(Debug, Default)]
pub struct StoreStats {
    pub reads: AtomicU64,
    pub appends: AtomicU64,
    pub replays: AtomicU64,
    pub versions_pruned: AtomicU64,
    pub chains_removed: AtomicU64,
    pub checkpoints: AtomicU64,
}

/// Result of pruning one row
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PruneOutcome {
    /// Nothing below the horizon could be removed
    Untouched,
    /// Versions older than the newest visible-at-horizon one were removed
    Truncated { versions: usize },
    /// Tombstone head below the horizon: the whole chain and row id are gone
    Removed { versions: usize },
    /// Index state disagrees with the chain; row left alone this pass
    Skipped(IndexInconsistency),
}

/// Page-based MVCC store for one partition
pub struct VersionChainStore {
    partition_id: u16,
    pager: Pager,
    state: RwLock<StoreMeta>,
    snapshot_lock: RwLock<()>,
    last_applied_index: AtomicU64,
    last_applied_term: AtomicU64,
    max_commit_ts: AtomicU64,
    pins: WatermarkPins,
    stats: StoreStats,
    sync_on_checkpoint: bool,
}

impl VersionChainStore {
    /// In-memory store
    pub fn volatile(partition_id: u16, page_size: usize) -> Result<Self> {
        Self::with_memory(partition_id, Box::new(VolatilePageMemory::new(page_size)?))
    }

    /// Open or create a file-backed store at `path`
    pub fn open(partition_id: u16, path: impl AsRef<Path>, config: &StorageConfig) -> Result<Self> {
        let memory = FilePageMemory::open(path, config.page_size, config.page_cache_pages)?;
        let mut store = Self::with_memory(partition_id, Box::new(memory))?;
        store.sync_on_checkpoint = config.sync_on_checkpoint;
        Ok(store)
    }

    /// Open a store over existing page memory
    ///
    /// Empty memory is initialized. A store that was modified after its last
    /// checkpoint fails with [`StorageFault::NeedsRecovery`].
    pub fn with_memory(partition_id: u16, memory: Box<dyn PageMemory>) -> Result<Self> {
        let page_size = memory.page_size();
        let pager = Pager::new(memory);

        let meta = if pager.memory().page_count() == 0 {
            let meta = StoreMeta::new(page_size);
            btree::init(&pager, meta.root)?;
            pager.save_meta(&meta)?;
            pager.memory().sync()?;
            info!("Initialized version chain store for partition {}", partition_id);
            meta
        } else {
            let meta = StoreMeta::from_page(&pager.load(PageId::META)?)?;
            if meta.page_size as usize != page_size {
                return Err(StorageFault::corruption(
                    PageId::META,
                    format!("store page size {} does not match {page_size}", meta.page_size),
                ));
            }
            if meta.dirty {
                warn!(
                    "Partition {} store was modified after its last checkpoint",
                    partition_id
                );
                return Err(StorageFault::NeedsRecovery);
            }
            info!(
                "Opened version chain store for partition {} ({} rows, applied index {})",
                partition_id, meta.row_count, meta.last_applied_index
            );
            meta
        };

        Ok(Self {
            partition_id,
            pager,
            last_applied_index: AtomicU64::new(meta.last_applied_index),
            last_applied_term: AtomicU64::new(meta.last_applied_term),
            max_commit_ts: AtomicU64::new(0),
            state: RwLock::new(meta),
            snapshot_lock: RwLock::new(()),
            pins: WatermarkPins::new(),
            stats: StoreStats::default(),
            sync_on_checkpoint: true,
        })
    }

    pub const fn partition_id(&self) -> u16 {
        self.partition_id
    }

    /// Version of `row_id` visible at `ts`
    pub fn get(&self, row_id: &RowId, ts: Timestamp) -> Result<Option<BinaryRow>> {
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        let meta = self.state.read();
        visible(&self.pager, &meta, row_id, ts)
    }

    /// Every version of `row_id`, newest first
    pub fn read_chain(&self, row_id: &RowId) -> Result<Vec<RowVersion>> {
        self.read_chain_at(row_id, LogIndex::MAX)
    }

    /// Versions of `row_id` written at or before log index `cut`, newest first
    pub fn read_chain_at(&self, row_id: &RowId, cut: LogIndex) -> Result<Vec<RowVersion>> {
        let meta = self.state.read();
        let Some(head) = btree::find(&self.pager, meta.root, row_id)? else {
            return Ok(Vec::new());
        };
        Ok(collect_chain(&self.pager, head)?
            .into_iter()
            .map(|(_, node)| node.version)
            .filter(|v| v.write_index <= cut)
            .collect())
    }

    /// Up to `limit` row ids strictly after `after`, in row id order
    pub fn scan_row_ids(&self, after: Option<&RowId>, limit: usize) -> Result<Vec<RowId>> {
        let from = match after {
            Some(row_id) => match row_id.increment() {
                Some(next) => next,
                None => return Ok(Vec::new()),
            },
            None => RowId::lowest(0),
        };
        let meta = self.state.read();
        Ok(btree::scan(&self.pager, meta.root, &from, limit)?
            .into_iter()
            .map(|(row_id, _)| row_id)
            .collect())
    }

    /// Number of row ids with a chain
    pub fn row_count(&self) -> u64 {
        self.state.read().row_count
    }

    /// Log index of the last fully applied command
    pub fn last_applied_index(&self) -> LogIndex {
        self.last_applied_index.load(Ordering::Acquire)
    }

    /// Term of the last fully applied command
    pub fn last_applied_term(&self) -> LogTerm {
        self.last_applied_term.load(Ordering::Acquire)
    }

    /// Newest commit timestamp written since the store was opened
    pub fn max_commit_timestamp(&self) -> Option<Timestamp> {
        match self.max_commit_ts.load(Ordering::Acquire) {
            0 => None,
            ts => Some(Timestamp::new(ts)),
        }
    }

    /// Start applying the command at `index`
    ///
    /// Holds the append barrier until the writer is dropped. The applied
    /// index only advances through [`PartitionWriter::finish`].
    pub fn writer(&self, index: LogIndex, term: LogTerm) -> Result<PartitionWriter<'_>> {
        let mut meta = self.state.write();
        self.mark_dirty(&mut meta)?;
        Ok(PartitionWriter {
            store: self,
            meta,
            index,
            term,
            next_row_seq: 0,
        })
    }

    /// Record an applied index without a mutation (e.g. after snapshot install)
    pub fn set_last_applied(&self, index: LogIndex, term: LogTerm) -> Result<()> {
        let mut meta = self.state.write();
        self.mark_dirty(&mut meta)?;
        meta.last_applied_index = index;
        meta.last_applied_term = term;
        self.last_applied_index.store(index, Ordering::Release);
        self.last_applied_term.store(term, Ordering::Release);
        Ok(())
    }

    /// Shared side of the snapshot barrier, held by the apply path
    pub fn apply_barrier(&self) -> RwLockReadGuard<'_, ()> {
        self.snapshot_lock.read()
    }

    /// Exclusive side of the snapshot barrier, held while freezing
    pub fn freeze_barrier(&self) -> RwLockWriteGuard<'_, ()> {
        self.snapshot_lock.write()
    }

    /// Pin the GC horizon at or below `ts`
    pub fn pin_watermark(&self, ts: Timestamp) -> WatermarkPin {
        self.pins.pin(ts)
    }

    pub const fn pins(&self) -> &WatermarkPins {
        &self.pins
    }

    pub const fn stats(&self) -> &StoreStats {
        &self.stats
    }

    /// Checkpoint: write the meta page and sync page memory
    pub fn flush(&self) -> Result<()> {
        let mut meta = self.state.write();
        meta.dirty = false;
        self.pager.save_meta(&meta)?;
        if self.sync_on_checkpoint {
            self.pager.memory().sync()?;
        }
        self.stats.checkpoints.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Checkpointed partition {} at applied index {}",
            self.partition_id, meta.last_applied_index
        );
        Ok(())
    }

    /// Drop every row and reset applied indices
    pub fn clear(&self) -> Result<()> {
        let mut meta = self.state.write();
        self.pager.memory().truncate(0)?;

        let mut fresh = StoreMeta::new(self.pager.page_size());
        fresh.dirty = true;
        btree::init(&self.pager, fresh.root)?;
        self.pager.save_meta(&fresh)?;
        *meta = fresh;

        self.last_applied_index.store(0, Ordering::Release);
        self.last_applied_term.store(0, Ordering::Release);
        self.max_commit_ts.store(0, Ordering::Release);
        info!("Cleared version chain store for partition {}", self.partition_id);
        Ok(())
    }

    /// Remove versions of `row_id` no reader at or above `horizon` can see
    pub fn prune(
        &self,
        row_id: &RowId,
        horizon: Timestamp,
        guard: &dyn IndexGuard,
    ) -> Result<PruneOutcome> {
        let mut meta = self.state.write();
        let Some(head) = btree::find(&self.pager, meta.root, row_id)? else {
            return Ok(PruneOutcome::Untouched);
        };
        let chain = collect_chain(&self.pager, head)?;

        let Some(keep) = chain
            .iter()
            .position(|(_, node)| node.version.timestamp <= horizon)
        else {
            return Ok(PruneOutcome::Untouched);
        };
        let remove_whole = keep == 0 && chain[0].1.version.is_tombstone();
        if !remove_whole && keep + 1 >= chain.len() {
            return Ok(PruneOutcome::Untouched);
        }

        let versions: Vec<RowVersion> = chain.iter().map(|(_, n)| n.version.clone()).collect();
        if let Err(inconsistency) = guard.check(row_id, &versions) {
            warn!("Skipping GC of {}: {}", row_id, inconsistency);
            return Ok(PruneOutcome::Skipped(inconsistency));
        }

        self.mark_dirty(&mut meta)?;
        if remove_whole {
            btree::remove(&self.pager, meta.root, row_id)?;
            for (link, _) in &chain {
                chain::free_node(&self.pager, &mut meta, *link)?;
            }
            meta.row_count = meta.row_count.saturating_sub(1);
            self.stats.chains_removed.fetch_add(1, Ordering::Relaxed);
            self.stats
                .versions_pruned
                .fetch_add(chain.len() as u64, Ordering::Relaxed);
            Ok(PruneOutcome::Removed {
                versions: chain.len(),
            })
        } else {
            chain::set_next(&self.pager, chain[keep].0, Link::NONE)?;
            for (link, _) in &chain[keep + 1..] {
                chain::free_node(&self.pager, &mut meta, *link)?;
            }
            let pruned = chain.len() - keep - 1;
            self.stats
                .versions_pruned
                .fetch_add(pruned as u64, Ordering::Relaxed);
            Ok(PruneOutcome::Truncated { versions: pruned })
        }
    }

    /// Persist the dirty flag on the first change after a checkpoint
    fn mark_dirty(&self, meta: &mut StoreMeta) -> Result<()> {
        if !meta.dirty {
            meta.dirty = true;
            self.pager.save_meta(meta)?;
        }
        Ok(())
    }
}

/// Walk the chain from `head`, checking the timestamp order
fn collect_chain(pager: &Pager, head: Link) -> Result<Vec<(Link, VersionNode)>> {
    let mut out: Vec<(Link, VersionNode)> = Vec::new();
    let mut link = head;
    while !link.is_none() {
        let node = chain::read_node(pager, link)?;
        if let Some((_, newer)) = out.last() {
            if node.version.timestamp >= newer.version.timestamp {
                return Err(StorageFault::corruption(
                    link.page(),
                    "version chain timestamps are not decreasing",
                ));
            }
        }
        let next = node.next;
        out.push((link, node));
        link = next;
    }
    Ok(out)
}

fn visible(
    pager: &Pager,
    meta: &StoreMeta,
    row_id: &RowId,
    ts: Timestamp,
) -> Result<Option<BinaryRow>> {
    let Some(mut link) = btree::find(pager, meta.root, row_id)? else {
        return Ok(None);
    };
    let mut newer = Timestamp::MAX;
    let mut first = true;
    while !link.is_none() {
        let node = chain::read_node(pager, link)?;
        if !first && node.version.timestamp >= newer {
            return Err(StorageFault::corruption(
                link.page(),
                "version chain timestamps are not decreasing",
            ));
        }
        if node.version.timestamp <= ts {
            return Ok(node.version.row);
        }
        first = false;
        newer = node.version.timestamp;
        link = node.next;
    }
    Ok(None)
}

/// Exclusive writer for one applied command
pub struct PartitionWriter<'a> {
    store: &'a VersionChainStore,
    meta: RwLockWriteGuard<'a, StoreMeta>,
    index: LogIndex,
    term: LogTerm,
    next_row_seq: u64,
}

impl PartitionWriter<'_> {
    /// Log index being applied
    pub const fn index(&self) -> LogIndex {
        self.index
    }

    /// New row id for this command; identical on every replica
    pub fn allocate_row_id(&mut self) -> RowId {
        let row_id = RowId::for_log_index(self.store.partition_id, self.index, self.next_row_seq);
        self.next_row_seq += 1;
        row_id
    }

    /// Version visible at `ts`
    pub fn get(&self, row_id: &RowId, ts: Timestamp) -> Result<Option<BinaryRow>> {
        visible(&self.store.pager, &self.meta, row_id, ts)
    }

    /// Latest value as it was before this command started
    pub fn current(&self, row_id: &RowId) -> Result<Option<BinaryRow>> {
        let Some(head) = self.head(row_id)? else {
            return Ok(None);
        };
        if self.is_replay(&head.1.version) {
            return self.value_at(head.1.next);
        }
        Ok(head.1.version.row)
    }

    /// Create the first live version of `row_id`
    pub fn insert(&mut self, row_id: RowId, row: BinaryRow, ts: Timestamp) -> Result<()> {
        let head = self.head(&row_id)?;
        if let Some((_, node)) = &head {
            if self.is_replay(&node.version) {
                self.note_replay(&row_id);
                return Ok(());
            }
            if !node.version.is_tombstone() {
                return Err(StorageFault::RowIdInUse(row_id));
            }
        }
        self.push(row_id, head, Some(row), ts)
    }

    /// Append a new live version, returning the previous latest value
    pub fn replace(
        &mut self,
        row_id: RowId,
        row: BinaryRow,
        ts: Timestamp,
    ) -> Result<Option<BinaryRow>> {
        let head = self.head(&row_id)?;
        if let Some((_, node)) = &head {
            if self.is_replay(&node.version) {
                self.note_replay(&row_id);
                return self.value_at(node.next);
            }
        }
        let previous = head.as_ref().and_then(|(_, node)| node.version.row.clone());
        self.push(row_id, head, Some(row), ts)?;
        Ok(previous)
    }

    /// Append a tombstone, returning the removed value
    ///
    /// Absent rows and rows whose head is already a tombstone are left alone.
    pub fn remove(&mut self, row_id: RowId, ts: Timestamp) -> Result<Option<BinaryRow>> {
        let Some((link, node)) = self.head(&row_id)? else {
            return Ok(None);
        };
        if self.is_replay(&node.version) {
            self.note_replay(&row_id);
            return self.value_at(node.next);
        }
        let Some(previous) = node.version.row.clone() else {
            return Ok(None);
        };
        self.push(row_id, Some((link, node)), None, ts)?;
        Ok(Some(previous))
    }

    /// Rebuild a chain from versions ordered oldest first
    pub fn restore_chain(&mut self, row_id: RowId, versions: &[RowVersion]) -> Result<()> {
        let mut head = self.head(&row_id)?;
        for version in versions {
            if let Some((_, node)) = &head {
                if version.timestamp <= node.version.timestamp {
                    return Err(StorageFault::TimestampOrder {
                        row_id,
                        head: node.version.timestamp,
                        new: version.timestamp,
                    });
                }
            }
            let next = head.as_ref().map_or(Link::NONE, |(link, _)| *link);
            let link = self.append(row_id, version, next)?;
            head = Some((
                link,
                VersionNode {
                    version: version.clone(),
                    next,
                },
            ));
        }
        Ok(())
    }

    /// Mark the command applied and release the append barrier
    pub fn finish(mut self) {
        self.meta.last_applied_index = self.index;
        self.meta.last_applied_term = self.term;
        self.store
            .last_applied_index
            .store(self.index, Ordering::Release);
        self.store.last_applied_term.store(self.term, Ordering::Release);
    }

    const fn is_replay(&self, version: &RowVersion) -> bool {
        self.index != 0 && version.write_index == self.index
    }

    fn note_replay(&self, row_id: &RowId) {
        self.store.stats.replays.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Row {} already carries a version from index {}",
            row_id, self.index
        );
    }

    fn head(&self, row_id: &RowId) -> Result<Option<(Link, VersionNode)>> {
        let pager = &self.store.pager;
        btree::find(pager, self.meta.root, row_id)?
            .map(|link| chain::read_node(pager, link).map(|node| (link, node)))
            .transpose()
    }

    fn value_at(&self, link: Link) -> Result<Option<BinaryRow>> {
        if link.is_none() {
            return Ok(None);
        }
        Ok(chain::read_node(&self.store.pager, link)?.version.row)
    }

    fn push(
        &mut self,
        row_id: RowId,
        head: Option<(Link, VersionNode)>,
        row: Option<BinaryRow>,
        ts: Timestamp,
    ) -> Result<()> {
        if let Some((_, node)) = &head {
            if ts <= node.version.timestamp {
                return Err(StorageFault::TimestampOrder {
                    row_id,
                    head: node.version.timestamp,
                    new: ts,
                });
            }
        }
        let next = head.map_or(Link::NONE, |(link, _)| link);
        let version = RowVersion {
            row,
            timestamp: ts,
            write_index: self.index,
        };
        self.append(row_id, &version, next)?;
        Ok(())
    }

    fn append(&mut self, row_id: RowId, version: &RowVersion, next: Link) -> Result<Link> {
        let pager = &self.store.pager;
        let link = chain::append_node(pager, &mut self.meta, version, next)?;
        if btree::upsert(pager, &mut self.meta, row_id, link)?.is_none() {
            self.meta.row_count += 1;
        }
        self.store
            .max_commit_ts
            .fetch_max(version.timestamp.as_u64(), Ordering::AcqRel);
        self.store.stats.appends.fetch_add(1, Ordering::Relaxed);
        Ok(link)
    }
}

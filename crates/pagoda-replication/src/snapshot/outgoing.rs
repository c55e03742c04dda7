//! Serving side of a snapshot session
//!
//! Lifecycle: `INITIAL -> FROZEN -> (SERVING)* -> CLOSED`.
//!
//! Freezing runs under the exclusive side of the partition's snapshot
//! barrier, so no command is half-applied while the applied indices are read.
//! After the barrier is released writers continue; streamed row data is cut
//! at the row storage's applied index captured at freeze.

use super::SnapshotId;
use super::log::LogManager;
use super::message::{
    ResponseEntry, SnapshotMeta, SnapshotMetaRequest, SnapshotMetaResponse, SnapshotMvDataRequest,
    SnapshotMvDataResponse, SnapshotTxDataRequest, SnapshotTxDataResponse,
};
use crate::error::SnapshotError;
use crate::partition::PartitionAccess;
use pagoda_common::{LogIndex, PartitionKey, RowId, Timestamp, TxId};
use pagoda_storage::WatermarkPin;
use parking_lot::{Mutex, RwLockWriteGuard};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Row ids read from storage per scan while filling a batch
const SCAN_CHUNK: usize = 64;

/// Exclusive hold on a partition's snapshot barrier
pub struct SnapshotLockGuard<'a> {
    snapshot_id: SnapshotId,
    _barrier: RwLockWriteGuard<'a, ()>,
}

struct FrozenScope {
    meta: SnapshotMeta,
    /// Row storage applied index at freeze
    mv_cut: LogIndex,
    _pin: WatermarkPin,
}

#[derive(Default)]
struct SessionState {
    frozen: Option<FrozenScope>,
    closed: bool,
    mv_after: Option<RowId>,
    mv_finished: bool,
    tx_after: Option<TxId>,
    tx_finished: bool,
}

/// One outgoing snapshot session
pub struct OutgoingSnapshot {
    id: SnapshotId,
    partition: Arc<dyn PartitionAccess>,
    log: Arc<dyn LogManager>,
    state: Mutex<SessionState>,
}

impl OutgoingSnapshot {
    pub fn new(id: SnapshotId, partition: Arc<dyn PartitionAccess>, log: Arc<dyn LogManager>) -> Self {
        Self {
            id,
            partition,
            log,
            state: Mutex::new(SessionState::default()),
        }
    }

    pub const fn id(&self) -> SnapshotId {
        self.id
    }

    pub fn partition_key(&self) -> PartitionKey {
        self.partition.partition_key()
    }

    /// Block command application on the partition
    pub fn acquire_lock(&self) -> SnapshotLockGuard<'_> {
        SnapshotLockGuard {
            snapshot_id: self.id,
            _barrier: self.partition.mv_partition_storage().freeze_barrier(),
        }
    }

    /// Let command application continue
    pub fn release_lock(&self, guard: SnapshotLockGuard<'_>) {
        drop(guard);
    }

    /// Capture the snapshot meta and cut; requires the lock
    ///
    /// Freezing again replaces the captured scope and restarts streaming.
    pub fn freeze_scope(&self, guard: &SnapshotLockGuard<'_>) -> Result<(), SnapshotError> {
        if guard.snapshot_id != self.id {
            return Err(SnapshotError::WrongSession {
                expected: self.id,
                actual: guard.snapshot_id,
            });
        }

        let mut state = self.state.lock();
        if state.closed {
            debug!("Snapshot {} is closed, not freezing", self.id);
            return Ok(());
        }

        let mv = self.partition.mv_partition_storage();
        let mv_index = mv.last_applied_index();
        let tx_index = self.partition.tx_state_storage().last_applied_index()?;
        let last_included_index = mv_index.max(tx_index);

        let term = self.log.term(last_included_index);
        let configuration = self.log.configuration(last_included_index);
        let (old_peers, old_learners) = match configuration.old_conf {
            Some(old) => (Some(old.peers), Some(old.learners)),
            None => (None, None),
        };

        let meta = SnapshotMeta {
            last_included_index,
            last_included_term: term,
            peers: configuration.conf.peers,
            learners: configuration.conf.learners,
            old_peers,
            old_learners,
        };

        let pin = mv.pin_watermark(mv.max_commit_timestamp().unwrap_or(Timestamp::MIN));
        info!(
            "Froze snapshot {} of partition {} at index {} term {}",
            self.id,
            self.partition.partition_key(),
            last_included_index,
            term
        );

        *state = SessionState {
            frozen: Some(FrozenScope {
                meta,
                mv_cut: mv_index,
                _pin: pin,
            }),
            ..SessionState::default()
        };
        Ok(())
    }

    /// Acquire the lock, freeze and release
    pub fn freeze(&self) -> Result<(), SnapshotError> {
        let guard = self.acquire_lock();
        let result = self.freeze_scope(&guard);
        self.release_lock(guard);
        result
    }

    /// Captured meta, or `None` once closed
    pub fn handle_snapshot_meta_request(
        &self,
        request: &SnapshotMetaRequest,
    ) -> Result<Option<SnapshotMetaResponse>, SnapshotError> {
        let state = self.state.lock();
        if state.closed {
            return Ok(None);
        }
        self.check_session(request.id)?;
        let frozen = Self::frozen(&state, self.id)?;
        Ok(Some(SnapshotMetaResponse {
            meta: frozen.meta.clone(),
        }))
    }

    /// Next batch of row versions in row id order, or `None` once closed
    pub fn handle_snapshot_mv_data_request(
        &self,
        request: &SnapshotMvDataRequest,
    ) -> Result<Option<SnapshotMvDataResponse>, SnapshotError> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(None);
        }
        self.check_session(request.id)?;
        let cut = Self::frozen(&state, self.id)?.mv_cut;

        if state.mv_finished {
            return Ok(Some(SnapshotMvDataResponse {
                rows: Vec::new(),
                finish: true,
            }));
        }

        match self.fill_mv_batch(&mut state, cut, request.batch_size_hint) {
            Ok(response) => Ok(Some(response)),
            Err(e) => {
                warn!("Closing snapshot {} after storage fault: {}", self.id, e);
                Self::close_state(&mut state);
                Err(e)
            }
        }
    }

    /// Next batch of tx metadata in tx id order, or `None` once closed
    pub fn handle_snapshot_tx_data_request(
        &self,
        request: &SnapshotTxDataRequest,
    ) -> Result<Option<SnapshotTxDataResponse>, SnapshotError> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(None);
        }
        self.check_session(request.id)?;
        Self::frozen(&state, self.id)?;

        if state.tx_finished {
            return Ok(Some(SnapshotTxDataResponse {
                transactions: Vec::new(),
                finish: true,
            }));
        }

        let limit = request.max_transactions.max(1);
        let transactions = match self
            .partition
            .tx_state_storage()
            .scan(state.tx_after, limit)
        {
            Ok(transactions) => transactions,
            Err(e) => {
                warn!("Closing snapshot {} after tx state fault: {}", self.id, e);
                Self::close_state(&mut state);
                return Err(e.into());
            }
        };

        let finish = transactions.len() < limit;
        state.tx_after = transactions.last().map(|(tx_id, _)| *tx_id).or(state.tx_after);
        state.tx_finished = finish;
        Ok(Some(SnapshotTxDataResponse {
            transactions,
            finish,
        }))
    }

    /// Release the session; later requests get no response
    pub fn close(&self) {
        let mut state = self.state.lock();
        if !state.closed {
            Self::close_state(&mut state);
            debug!("Closed snapshot {}", self.id);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn fill_mv_batch(
        &self,
        state: &mut SessionState,
        cut: LogIndex,
        budget: u64,
    ) -> Result<SnapshotMvDataResponse, SnapshotError> {
        let mv = self.partition.mv_partition_storage();
        let mut rows = Vec::new();
        let mut size = 0u64;

        loop {
            let row_ids = mv.scan_row_ids(state.mv_after.as_ref(), SCAN_CHUNK)?;
            if row_ids.is_empty() {
                state.mv_finished = true;
                break;
            }
            for row_id in row_ids {
                state.mv_after = Some(row_id);
                let versions = mv.read_chain_at(&row_id, cut)?;
                if versions.is_empty() {
                    continue;
                }
                let entry = ResponseEntry { row_id, versions };
                size += entry.estimated_size();
                rows.push(entry);
                if size >= budget {
                    return Ok(SnapshotMvDataResponse {
                        rows,
                        finish: false,
                    });
                }
            }
        }

        Ok(SnapshotMvDataResponse { rows, finish: true })
    }

    fn check_session(&self, id: SnapshotId) -> Result<(), SnapshotError> {
        if id == self.id {
            Ok(())
        } else {
            Err(SnapshotError::WrongSession {
                expected: self.id,
                actual: id,
            })
        }
    }

    fn frozen(state: &SessionState, id: SnapshotId) -> Result<&FrozenScope, SnapshotError> {
        state.frozen.as_ref().ok_or(SnapshotError::NotFrozen(id))
    }

    fn close_state(state: &mut SessionState) {
        state.closed = true;
        // Dropping the scope releases the GC pin
        state.frozen = None;
    }
}

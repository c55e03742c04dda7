//! Snapshot request and response messages

use super::SnapshotId;
use pagoda_common::{LogIndex, LogTerm, RowId, TxId};
use pagoda_storage::RowVersion;
use pagoda_tx_state::TxMeta;
use serde::{Deserialize, Serialize};

/// Log position and group membership a snapshot corresponds to
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub last_included_index: LogIndex,
    pub last_included_term: LogTerm,
    pub peers: Vec<String>,
    pub learners: Vec<String>,
    /// Present only while a membership change is in flight
    pub old_peers: Option<Vec<String>>,
    pub old_learners: Option<Vec<String>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetaRequest {
    pub id: SnapshotId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetaResponse {
    pub meta: SnapshotMeta,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMvDataRequest {
    pub id: SnapshotId,
    /// Approximate byte budget of the response
    pub batch_size_hint: u64,
}

/// All streamed versions of one row, newest first
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEntry {
    pub row_id: RowId,
    pub versions: Vec<RowVersion>,
}

impl ResponseEntry {
    /// Rough encoded size used against the batch budget
    pub fn estimated_size(&self) -> u64 {
        let versions: usize = self
            .versions
            .iter()
            .map(|v| 24 + v.row.as_ref().map_or(0, pagoda_common::BinaryRow::len))
            .sum();
        (pagoda_common::ROW_ID_SIZE + versions) as u64
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMvDataResponse {
    pub rows: Vec<ResponseEntry>,
    /// No more row data follows
    pub finish: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotTxDataRequest {
    pub id: SnapshotId,
    pub max_transactions: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotTxDataResponse {
    pub transactions: Vec<(TxId, TxMeta)>,
    /// No more tx metadata follows
    pub finish: bool,
}

//! Error types for replicated apply and snapshot transfer

use crate::raft_error::{RaftError, Status};
use crate::snapshot::SnapshotId;
use pagoda_common::{PartitionKey, StorageFault};
use pagoda_tx_state::TxStateError;
use thiserror::Error;

/// Failure applying a committed command; halts the partition
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("storage fault: {0}")]
    Storage(#[from] StorageFault),

    #[error("command decode failed: {0}")]
    Decode(String),

    #[error("tx state storage error: {0}")]
    TxState(#[from] TxStateError),

    #[error("apply is halted for partition {0}")]
    Halted(PartitionKey),
}

impl ApplyError {
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }
}

/// Failure serving an outgoing snapshot request
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot {0} has not been frozen")]
    NotFrozen(SnapshotId),

    #[error("request for snapshot {actual} sent to session {expected}")]
    WrongSession {
        expected: SnapshotId,
        actual: SnapshotId,
    },

    #[error("storage fault: {0}")]
    Storage(#[from] StorageFault),

    #[error("tx state storage error: {0}")]
    TxState(#[from] TxStateError),
}

/// Failure copying a snapshot into the local partition
#[derive(Debug, Error)]
pub enum CopyError {
    #[error("snapshot session is gone")]
    SessionGone,

    #[error("snapshot source failed: {0}")]
    Source(Status),

    #[error("storage fault: {0}")]
    Storage(#[from] StorageFault),

    #[error("tx state storage error: {0}")]
    TxState(#[from] TxStateError),

    #[error("snapshot copy cancelled")]
    Cancelled,

    #[error("ingest task failed: {0}")]
    Task(String),
}

impl CopyError {
    /// The source is behind; the same source may be retried later
    pub fn retry_later(&self) -> bool {
        matches!(self, Self::Source(status) if status.error.classify() == RaftError::ECatchup)
    }

    /// The source refused; another replica should be asked
    pub fn try_other_replica(&self) -> bool {
        matches!(self, Self::Source(status) if status.error.classify() == RaftError::EPerm)
    }
}

impl From<tokio::task::JoinError> for CopyError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Task(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_error_classification() {
        let catchup = CopyError::Source(Status::new(RaftError::ECatchup, "not frozen"));
        assert!(catchup.retry_later());
        assert!(!catchup.try_other_replica());

        let perm = CopyError::Source(Status::new(RaftError::EPerm, "wrong session"));
        assert!(perm.try_other_replica());

        assert!(!CopyError::SessionGone.retry_later());
        assert!(!CopyError::Source(Status::new(RaftError::EIo, "disk")).retry_later());
    }

    #[test]
    fn test_tx_state_error_converts_to_apply_error() {
        let io = std::io::Error::other("disk gone");
        let err: ApplyError = TxStateError::from(io).into();
        assert!(matches!(err, ApplyError::TxState(_)));
    }
}

//! Transaction metadata records

use pagoda_common::{PartitionKey, Timestamp};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a transaction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxState {
    Pending,
    Committed,
    Aborted,
}

impl TxState {
    /// Committed or aborted
    pub const fn is_final(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

/// Stored metadata of one transaction
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxMeta {
    pub state: TxState,
    /// Set once the transaction commits
    pub commit_timestamp: Option<Timestamp>,
    /// Partitions the transaction wrote to
    pub enlisted_partitions: Vec<PartitionKey>,
}

impl TxMeta {
    pub fn pending(enlisted_partitions: Vec<PartitionKey>) -> Self {
        Self {
            state: TxState::Pending,
            commit_timestamp: None,
            enlisted_partitions,
        }
    }

    pub fn committed(commit_timestamp: Timestamp, enlisted_partitions: Vec<PartitionKey>) -> Self {
        Self {
            state: TxState::Committed,
            commit_timestamp: Some(commit_timestamp),
            enlisted_partitions,
        }
    }

    pub fn aborted(enlisted_partitions: Vec<PartitionKey>) -> Self {
        Self {
            state: TxState::Aborted,
            commit_timestamp: None,
            enlisted_partitions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_final_states() {
        assert!(!TxState::Pending.is_final());
        assert!(TxState::Committed.is_final());
        assert!(TxState::Aborted.is_final());
    }

    #[test]
    fn test_committed_carries_timestamp() {
        let meta = TxMeta::committed(Timestamp::new(7), Vec::new());
        assert_eq!(meta.commit_timestamp, Some(Timestamp::new(7)));
        assert!(TxMeta::aborted(Vec::new()).commit_timestamp.is_none());
    }
}

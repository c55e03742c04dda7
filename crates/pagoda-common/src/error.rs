//! Error types for Pagoda storage
//!
//! `StorageFault` is the single error type of the partition storage layer.
//! Faults are never retried internally; callers decide whether a fault halts
//! the partition or only the current operation.

use crate::types::{PageId, RowId, Timestamp};
use thiserror::Error;

/// Common result type for storage operations
pub type Result<T> = std::result::Result<T, StorageFault>;

/// Storage fault raised by page memory, the version chain store, index
/// storage or tx-state storage.
#[derive(Debug, Error)]
pub enum StorageFault {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("page {page_id} is corrupted: {reason}")]
    Corruption { page_id: PageId, reason: String },

    #[error("checksum mismatch on page {page_id}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        page_id: PageId,
        expected: u32,
        actual: u32,
    },

    #[error("unsupported format version {found} (supported: {supported})")]
    UnsupportedFormat { found: u32, supported: u32 },

    #[error("store was modified after its last checkpoint and needs recovery")]
    NeedsRecovery,

    #[error("row decode failed: {0}")]
    RowDecode(String),

    #[error("timestamp order violated for {row_id}: head {head}, new {new}")]
    TimestampOrder {
        row_id: RowId,
        head: Timestamp,
        new: Timestamp,
    },

    #[error("row id {0} already has a live version")]
    RowIdInUse(RowId),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("tx state storage error: {0}")]
    TxState(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl StorageFault {
    /// Create a corruption fault for a page
    pub fn corruption(page_id: PageId, reason: impl Into<String>) -> Self {
        Self::Corruption {
            page_id,
            reason: reason.into(),
        }
    }

    /// Create a row decode fault
    pub fn row_decode(msg: impl Into<String>) -> Self {
        Self::RowDecode(msg.into())
    }

    /// Create a serialization fault
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Check if the fault means on-disk state can no longer be trusted
    ///
    /// A partition hitting one of these recovers through a snapshot install.
    #[must_use]
    pub const fn needs_recovery(&self) -> bool {
        matches!(
            self,
            Self::Corruption { .. }
                | Self::ChecksumMismatch { .. }
                | Self::NeedsRecovery
                | Self::UnsupportedFormat { .. }
        )
    }

    /// Check if this is a cooperative cancellation rather than a failure
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

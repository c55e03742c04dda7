//! Write commands carried by the replicated log

use pagoda_common::{RowValue, Timestamp};
use serde::{Deserialize, Serialize};

/// A committed write to one partition
///
/// Every command carries the commit timestamp its versions are written at.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteCommand {
    /// Create a row unless its primary key is already live
    Insert { row: RowValue, timestamp: Timestamp },
    /// Swap `old_row` for `new_row` if the row still holds `old_row`
    Replace {
        old_row: RowValue,
        new_row: RowValue,
        timestamp: Timestamp,
    },
    /// Delete the live row with this primary key
    Remove { row_key: RowValue, timestamp: Timestamp },
}

impl WriteCommand {
    pub const fn timestamp(&self) -> Timestamp {
        match self {
            Self::Insert { timestamp, .. }
            | Self::Replace { timestamp, .. }
            | Self::Remove { timestamp, .. } => *timestamp,
        }
    }

    /// Short name for logging
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Insert { .. } => "insert",
            Self::Replace { .. } => "replace",
            Self::Remove { .. } => "remove",
        }
    }

    /// Log entry payload
    pub fn to_bytes(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> bincode::Result<Self> {
        bincode::deserialize(bytes)
    }
}

//! Core type definitions for Pagoda
//!
//! Identifiers shared by every layer: row ids, partition keys, hybrid
//! timestamps, transaction ids and page ids.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Log index of a replicated command
pub type LogIndex = u64;

/// Term of a replicated log entry
pub type LogTerm = u64;

/// Number of bytes a `RowId` occupies on a page
pub const ROW_ID_SIZE: usize = 18;

/// Stable, partition-scoped identifier of a logical row.
///
/// Ordering is partition first, then the uuid bytes, which is also the
/// ordering of the encoded form produced by [`RowId::to_bytes`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowId {
    partition_id: u16,
    uuid: Uuid,
}

impl RowId {
    /// Create a row id from its parts
    #[must_use]
    pub const fn new(partition_id: u16, uuid: Uuid) -> Self {
        Self { partition_id, uuid }
    }

    /// Generate a random row id in a partition
    #[must_use]
    pub fn random(partition_id: u16) -> Self {
        Self::new(partition_id, Uuid::new_v4())
    }

    /// Row id allocated by the command at `index`
    ///
    /// Every replica applying the same log assigns the same id, and ids are
    /// never reused because log indices are never reused.
    #[must_use]
    pub const fn for_log_index(partition_id: u16, index: LogIndex, seq: u64) -> Self {
        Self::new(partition_id, Uuid::from_u64_pair(index, seq))
    }

    /// Smallest row id of a partition
    #[must_use]
    pub const fn lowest(partition_id: u16) -> Self {
        Self::new(partition_id, Uuid::nil())
    }

    /// The next row id in order, or `None` at the top of the partition range
    #[must_use]
    pub fn increment(&self) -> Option<Self> {
        self.uuid
            .as_u128()
            .checked_add(1)
            .map(|next| Self::new(self.partition_id, Uuid::from_u128(next)))
    }

    /// Partition this row id belongs to
    #[must_use]
    pub const fn partition_id(&self) -> u16 {
        self.partition_id
    }

    /// The uuid part of the row id
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Encode for page storage (order preserving)
    #[must_use]
    pub fn to_bytes(&self) -> [u8; ROW_ID_SIZE] {
        let mut buf = [0u8; ROW_ID_SIZE];
        buf[..2].copy_from_slice(&self.partition_id.to_be_bytes());
        buf[2..].copy_from_slice(self.uuid.as_bytes());
        buf
    }

    /// Decode from page storage
    #[must_use]
    pub fn from_bytes(buf: &[u8; ROW_ID_SIZE]) -> Self {
        let partition_id = u16::from_be_bytes([buf[0], buf[1]]);
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&buf[2..]);
        Self::new(partition_id, Uuid::from_bytes(uuid))
    }
}

impl fmt::Debug for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RowId({}:{})", self.partition_id, self.uuid)
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.partition_id, self.uuid)
    }
}

/// Hybrid logical timestamp: physical milliseconds in the high 48 bits,
/// logical counter in the low 16 bits.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0}")]
pub struct Timestamp(u64);

impl Timestamp {
    /// Smallest timestamp
    pub const MIN: Self = Self(0);
    /// Largest timestamp; reading at `MAX` returns the latest committed state
    pub const MAX: Self = Self(u64::MAX);

    const LOGICAL_BITS: u32 = 16;

    /// Create from a raw value
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Create from physical milliseconds and a logical counter
    #[must_use]
    pub const fn hybrid(physical_ms: u64, logical: u16) -> Self {
        Self((physical_ms << Self::LOGICAL_BITS) | logical as u64)
    }

    /// Raw 64-bit value
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Physical component in milliseconds
    #[must_use]
    pub const fn physical(&self) -> u64 {
        self.0 >> Self::LOGICAL_BITS
    }

    /// Logical component
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn logical(&self) -> u16 {
        self.0 as u16
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Unique identifier of a table
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
pub struct TableId(Uuid);

impl TableId {
    /// Generate a new random table id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing uuid
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for TableId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableId({})", self.0)
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Table id plus partition number; one version chain store and one
/// replicated log exist per key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{table_id}:{partition_id}")]
pub struct PartitionKey {
    pub table_id: TableId,
    pub partition_id: u16,
}

impl PartitionKey {
    #[must_use]
    pub const fn new(table_id: TableId, partition_id: u16) -> Self {
        Self {
            table_id,
            partition_id,
        }
    }
}

impl fmt::Debug for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PartitionKey({self})")
    }
}

/// Unique identifier of a transaction
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
pub struct TxId(Uuid);

impl TxId {
    /// Generate a new random transaction id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing uuid
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Bytes used as the storage key (order preserving)
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for TxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxId({})", self.0)
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier of a secondary index
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into, Display)]
#[display("{_0}")]
pub struct IndexId(Uuid);

impl IndexId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for IndexId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IndexId({})", self.0)
    }
}

/// Page number inside a page file
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From, Into)]
#[display("{_0}")]
pub struct PageId(u64);

impl PageId {
    /// Page 0 holds the store meta page
    pub const META: Self = Self(0);
    /// Sentinel for "no page" in on-page links
    pub const NONE: Self = Self(u64::MAX);

    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_none(&self) -> bool {
        self.0 == u64::MAX
    }
}

impl fmt::Debug for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "PageId(none)")
        } else {
            write!(f, "PageId({})", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_id_encoding_preserves_order() {
        let a = RowId::for_log_index(1, 5, 0);
        let b = RowId::for_log_index(1, 6, 0);
        let c = RowId::for_log_index(2, 1, 0);
        assert!(a < b && b < c);
        assert!(a.to_bytes() < b.to_bytes());
        assert!(b.to_bytes() < c.to_bytes());
        assert_eq!(RowId::from_bytes(&b.to_bytes()), b);
    }

    #[test]
    fn test_row_id_increment() {
        let low = RowId::lowest(4);
        let next = low.increment().unwrap();
        assert!(next > low);
        assert_eq!(next.partition_id(), 4);

        let top = RowId::new(4, Uuid::from_u128(u128::MAX));
        assert!(top.increment().is_none());
    }

    #[test]
    fn test_row_id_is_deterministic() {
        assert_eq!(RowId::for_log_index(3, 42, 1), RowId::for_log_index(3, 42, 1));
        assert_ne!(RowId::for_log_index(3, 42, 1), RowId::for_log_index(3, 42, 2));
    }

    #[test]
    fn test_timestamp_hybrid() {
        let ts = Timestamp::hybrid(1_700_000_000_000, 7);
        assert_eq!(ts.physical(), 1_700_000_000_000);
        assert_eq!(ts.logical(), 7);
        assert!(Timestamp::hybrid(10, 1) > Timestamp::hybrid(10, 0));
        assert!(Timestamp::hybrid(11, 0) > Timestamp::hybrid(10, u16::MAX));
    }

    #[test]
    fn test_partition_key_display() {
        let table = TableId::from_uuid(Uuid::nil());
        let key = PartitionKey::new(table, 3);
        assert_eq!(key.to_string(), "00000000-0000-0000-0000-000000000000:3");
    }

    #[test]
    fn test_page_id_none() {
        assert!(PageId::NONE.is_none());
        assert!(!PageId::META.is_none());
        assert_eq!(format!("{:?}", PageId::NONE), "PageId(none)");
    }
}

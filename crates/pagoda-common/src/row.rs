//! Row encodings
//!
//! A [`BinaryRow`] is an immutable, schema-versioned byte encoding of a row:
//!
//! ```text
//! +----------------+------------+-----------+-------------+
//! | schema_version | key_len    | key bytes | value bytes |
//! | u16 LE         | u32 LE     |           |             |
//! +----------------+------------+-----------+-------------+
//! ```
//!
//! Column-level interpretation belongs to the schema layer; storage only
//! needs the key/value split for primary-key resolution.

use crate::error::{Result, StorageFault};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of the fixed row header
pub const ROW_HEADER_SIZE: usize = 6;

/// Immutable encoded row
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Bytes", into = "Bytes")]
pub struct BinaryRow {
    bytes: Bytes,
    key_len: u32,
}

impl BinaryRow {
    /// Encode a row from its key and value parts
    #[must_use]
    pub fn new(schema_version: u16, key: &[u8], value: &[u8]) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let key_len = key.len() as u32;
        let mut buf = BytesMut::with_capacity(ROW_HEADER_SIZE + key.len() + value.len());
        buf.put_u16_le(schema_version);
        buf.put_u32_le(key_len);
        buf.put_slice(key);
        buf.put_slice(value);
        Self {
            bytes: buf.freeze(),
            key_len,
        }
    }

    /// A row carrying only a key, as used by remove commands
    #[must_use]
    pub fn key_only(schema_version: u16, key: &[u8]) -> Self {
        Self::new(schema_version, key, &[])
    }

    /// Validate and wrap an encoded row
    pub fn from_bytes(bytes: Bytes) -> Result<Self> {
        if bytes.len() < ROW_HEADER_SIZE {
            return Err(StorageFault::row_decode(format!(
                "row too short: {} bytes",
                bytes.len()
            )));
        }
        let key_len = u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        if ROW_HEADER_SIZE + key_len as usize > bytes.len() {
            return Err(StorageFault::row_decode(format!(
                "key length {key_len} exceeds row size {}",
                bytes.len()
            )));
        }
        Ok(Self { bytes, key_len })
    }

    /// Schema version the row was encoded with
    #[must_use]
    pub fn schema_version(&self) -> u16 {
        u16::from_le_bytes([self.bytes[0], self.bytes[1]])
    }

    /// Primary-key bytes
    #[must_use]
    pub fn key(&self) -> &[u8] {
        &self.bytes[ROW_HEADER_SIZE..ROW_HEADER_SIZE + self.key_len as usize]
    }

    /// Value bytes
    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.bytes[ROW_HEADER_SIZE + self.key_len as usize..]
    }

    /// Full encoded form
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Encoded form as shared bytes
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        self.bytes.clone()
    }

    /// Encoded length
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl TryFrom<Bytes> for BinaryRow {
    type Error = StorageFault;

    fn try_from(bytes: Bytes) -> Result<Self> {
        Self::from_bytes(bytes)
    }
}

impl From<BinaryRow> for Bytes {
    fn from(row: BinaryRow) -> Self {
        row.bytes
    }
}

impl fmt::Debug for BinaryRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinaryRow")
            .field("schema_version", &self.schema_version())
            .field("key", &String::from_utf8_lossy(self.key()))
            .field("value_len", &self.value().len())
            .finish()
    }
}

/// A row as carried by a command: still encoded, or already decoded
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowValue {
    Encoded(Bytes),
    Decoded(BinaryRow),
}

impl RowValue {
    /// Decode into a [`BinaryRow`] without touching `self`
    pub fn decode(&self) -> Result<BinaryRow> {
        match self {
            Self::Encoded(bytes) => BinaryRow::from_bytes(bytes.clone()),
            Self::Decoded(row) => Ok(row.clone()),
        }
    }

    /// Encoded bytes, re-using the decoded row's buffer when present
    #[must_use]
    pub fn encoded(&self) -> Bytes {
        match self {
            Self::Encoded(bytes) => bytes.clone(),
            Self::Decoded(row) => row.to_bytes(),
        }
    }

    /// Convert to the encoded variant
    #[must_use]
    pub fn into_encoded(self) -> Self {
        match self {
            Self::Decoded(row) => Self::Encoded(row.to_bytes()),
            encoded @ Self::Encoded(_) => encoded,
        }
    }
}

impl From<BinaryRow> for RowValue {
    fn from(row: BinaryRow) -> Self {
        Self::Decoded(row)
    }
}

/// Opaque, comparable index key tuple
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexTuple(Bytes);

impl IndexTuple {
    #[must_use]
    pub const fn new(bytes: Bytes) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn copy_from_slice(bytes: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(bytes))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for IndexTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IndexTuple({})", String::from_utf8_lossy(&self.0))
    }
}

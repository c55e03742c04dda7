//! Page layout definitions
//!
//! Every page starts with a fixed 24-byte header:
//! ```text
//! +-----------+----------------+----------+----------+----------+
//! | type u16  | format ver u16 | id u64   | crc32c   | reserved |
//! | off 0     | off 2          | off 4    | off 12   | off 16   |
//! +-----------+----------------+----------+----------+----------+
//! |                  payload (page_size - 24)                   |
//! +-------------------------------------------------------------+
//! ```
//!
//! The checksum covers the whole page with the checksum field zeroed. A page
//! is sealed (checksum written) right before it goes to page memory and
//! verified right after it is read back.

use bytes::{Buf, BufMut};
use pagoda_common::checksum::page_crc;
use pagoda_common::{PageId, Result, StorageFault};

/// Page header size
pub const PAGE_HEADER_SIZE: usize = 24;

/// Current page format version
pub const PAGE_FORMAT_VERSION: u16 = 1;

/// Smallest supported page size
pub const MIN_PAGE_SIZE: usize = 256;

/// Largest supported page size (slot offsets are u16)
pub const MAX_PAGE_SIZE: usize = 32 * 1024;

const CHECKSUM_OFFSET: usize = 12;

/// Kind of page
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum PageType {
    /// Store meta page (always page 0)
    Meta = 1,
    /// B+-tree leaf: row id to chain head
    BTreeLeaf = 2,
    /// B+-tree inner node
    BTreeInner = 3,
    /// Slotted page holding version chain nodes
    Data = 4,
    /// Continuation of a row too large for a data page
    Overflow = 5,
    /// Page on the free list
    Free = 6,
}

impl TryFrom<u16> for PageType {
    type Error = u16;

    fn try_from(value: u16) -> std::result::Result<Self, u16> {
        match value {
            1 => Ok(Self::Meta),
            2 => Ok(Self::BTreeLeaf),
            3 => Ok(Self::BTreeInner),
            4 => Ok(Self::Data),
            5 => Ok(Self::Overflow),
            6 => Ok(Self::Free),
            other => Err(other),
        }
    }
}

/// Validate a configured page size
pub fn validate_page_size(page_size: usize) -> Result<()> {
    if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) || !page_size.is_power_of_two() {
        return Err(StorageFault::UnsupportedFormat {
            found: u32::try_from(page_size).unwrap_or(u32::MAX),
            supported: u32::try_from(MIN_PAGE_SIZE).unwrap_or(u32::MAX),
        });
    }
    Ok(())
}

/// An in-memory page image
#[derive(Clone)]
pub struct Page {
    id: PageId,
    page_type: PageType,
    buf: Vec<u8>,
}

impl Page {
    /// Create a zeroed page of the given type
    #[must_use]
    pub fn new(id: PageId, page_type: PageType, page_size: usize) -> Self {
        let mut buf = vec![0u8; page_size];
        let mut header = &mut buf[..PAGE_HEADER_SIZE];
        header.put_u16_le(page_type as u16);
        header.put_u16_le(PAGE_FORMAT_VERSION);
        header.put_u64_le(id.as_u64());
        Self { id, page_type, buf }
    }

    /// Parse and verify a page read from page memory
    pub fn from_raw(id: PageId, buf: Vec<u8>) -> Result<Self> {
        if buf.len() < MIN_PAGE_SIZE {
            return Err(StorageFault::corruption(
                id,
                format!("short page: {} bytes", buf.len()),
            ));
        }

        let mut header = &buf[..PAGE_HEADER_SIZE];
        let raw_type = header.get_u16_le();
        let version = header.get_u16_le();
        let stored_id = header.get_u64_le();
        let stored_crc = header.get_u32_le();

        let actual_crc = page_crc(&buf, CHECKSUM_OFFSET);
        if stored_crc != actual_crc {
            return Err(StorageFault::ChecksumMismatch {
                page_id: id,
                expected: stored_crc,
                actual: actual_crc,
            });
        }

        if version != PAGE_FORMAT_VERSION {
            return Err(StorageFault::UnsupportedFormat {
                found: u32::from(version),
                supported: u32::from(PAGE_FORMAT_VERSION),
            });
        }

        if stored_id != id.as_u64() {
            return Err(StorageFault::corruption(
                id,
                format!("page header names page {stored_id}"),
            ));
        }

        let page_type = PageType::try_from(raw_type)
            .map_err(|t| StorageFault::corruption(id, format!("unknown page type {t}")))?;

        Ok(Self { id, page_type, buf })
    }

    #[must_use]
    pub const fn id(&self) -> PageId {
        self.id
    }

    #[must_use]
    pub const fn page_type(&self) -> PageType {
        self.page_type
    }

    /// Fail unless the page has the expected type
    pub fn expect_type(&self, expected: PageType) -> Result<()> {
        if self.page_type == expected {
            Ok(())
        } else {
            Err(StorageFault::corruption(
                self.id,
                format!("expected {expected:?} page, found {:?}", self.page_type),
            ))
        }
    }

    /// Page bytes after the header
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.buf[PAGE_HEADER_SIZE..]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buf[PAGE_HEADER_SIZE..]
    }

    /// Write the checksum and return the raw page image
    #[must_use]
    pub fn seal(mut self) -> Vec<u8> {
        let crc = page_crc(&self.buf, CHECKSUM_OFFSET);
        self.buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
        self.buf
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id)
            .field("type", &self.page_type)
            .field("size", &self.buf.len())
            .finish()
    }
}

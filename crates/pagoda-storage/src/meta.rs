//! Store meta page (page 0)
//!
//! ```text
//! magic "PAGODAVC" | format u32 | page_size u32 | root u64 | height u32
//! page_count u64 | free_head u64 | free_pages u64 | fill_page u64
//! row_count u64 | last_applied_index u64 | last_applied_term u64 | dirty u8
//! ```

use crate::page::{Page, PageType};
use bytes::{Buf, BufMut};
use pagoda_common::{LogIndex, LogTerm, PageId, Result, StorageFault};

/// Magic bytes of the version chain store
pub const MAGIC: [u8; 8] = *b"PAGODAVC";

/// Current store format version
pub const STORE_FORMAT_VERSION: u32 = 1;

/// In-memory copy of the meta page
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreMeta {
    pub page_size: u32,
    pub root: PageId,
    pub tree_height: u32,
    pub page_count: u64,
    pub free_head: PageId,
    pub free_pages: u64,
    /// Data page currently receiving new version nodes
    pub fill_page: PageId,
    pub row_count: u64,
    pub last_applied_index: LogIndex,
    pub last_applied_term: LogTerm,
    /// Set on the first mutation after a checkpoint
    pub dirty: bool,
}

impl StoreMeta {
    /// Meta for an empty store whose root leaf is page 1
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: u32::try_from(page_size).unwrap_or(u32::MAX),
            root: PageId::new(1),
            tree_height: 1,
            page_count: 2,
            free_head: PageId::NONE,
            free_pages: 0,
            fill_page: PageId::NONE,
            row_count: 0,
            last_applied_index: 0,
            last_applied_term: 0,
            dirty: false,
        }
    }

    /// Encode into a meta page
    pub fn to_page(&self, page_size: usize) -> Page {
        let mut page = Page::new(PageId::META, PageType::Meta, page_size);
        let mut buf = page.payload_mut();
        buf.put_slice(&MAGIC);
        buf.put_u32_le(STORE_FORMAT_VERSION);
        buf.put_u32_le(self.page_size);
        buf.put_u64_le(self.root.as_u64());
        buf.put_u32_le(self.tree_height);
        buf.put_u64_le(self.page_count);
        buf.put_u64_le(self.free_head.as_u64());
        buf.put_u64_le(self.free_pages);
        buf.put_u64_le(self.fill_page.as_u64());
        buf.put_u64_le(self.row_count);
        buf.put_u64_le(self.last_applied_index);
        buf.put_u64_le(self.last_applied_term);
        buf.put_u8(u8::from(self.dirty));
        page
    }

    /// Decode from a verified meta page
    pub fn from_page(page: &Page) -> Result<Self> {
        page.expect_type(PageType::Meta)?;
        let mut buf = page.payload();

        let mut magic = [0u8; 8];
        buf.copy_to_slice(&mut magic);
        if magic != MAGIC {
            return Err(StorageFault::corruption(PageId::META, "bad magic"));
        }

        let version = buf.get_u32_le();
        if version != STORE_FORMAT_VERSION {
            return Err(StorageFault::UnsupportedFormat {
                found: version,
                supported: STORE_FORMAT_VERSION,
            });
        }

        Ok(Self {
            page_size: buf.get_u32_le(),
            root: PageId::new(buf.get_u64_le()),
            tree_height: buf.get_u32_le(),
            page_count: buf.get_u64_le(),
            free_head: PageId::new(buf.get_u64_le()),
            free_pages: buf.get_u64_le(),
            fill_page: PageId::new(buf.get_u64_le()),
            row_count: buf.get_u64_le(),
            last_applied_index: buf.get_u64_le(),
            last_applied_term: buf.get_u64_le(),
            dirty: buf.get_u8() != 0,
        })
    }
}

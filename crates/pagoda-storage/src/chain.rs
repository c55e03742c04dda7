//! Version chain nodes
//!
//! Nodes live in slotted data pages. The slot directory grows from the front
//! of the payload, records grow from the back:
//! ```text
//! slot_count u16 | live u16 | free_end u16 | slot offsets u16 * n | ... | records
//! ```
//! A record is
//! ```text
//! flags u8 | ts u64 | write_index u64 | next link [10] | row_len u32 | row bytes or overflow page u64
//! ```
//! Rows that do not fit an empty data page spill into a chain of overflow
//! pages (`next u64 | len u32 | bytes`). A freed slot has offset 0; a data
//! page with no live slot goes back to the free list.

use crate::meta::StoreMeta;
use crate::page::{Page, PageType};
use crate::pager::Pager;
use bytes::{Buf, BufMut, Bytes};
use pagoda_common::{BinaryRow, LogIndex, PageId, Result, StorageFault, Timestamp};
use serde::{Deserialize, Serialize};

/// Size of an encoded [`Link`]
pub const LINK_SIZE: usize = 10;

const DATA_HEADER: usize = 6;
const SLOT_SIZE: usize = 2;
const RECORD_HEADER: usize = 1 + 8 + 8 + LINK_SIZE + 4;
const NEXT_OFFSET: usize = 1 + 8 + 8;
const OVERFLOW_HEADER: usize = 12;

const FLAG_TOMBSTONE: u8 = 0x1;
const FLAG_OVERFLOW: u8 = 0x2;

/// Location of a version node: data page plus slot
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Link {
    page: PageId,
    slot: u16,
}

impl Link {
    /// End of chain
    pub const NONE: Self = Self {
        page: PageId::NONE,
        slot: 0,
    };

    #[must_use]
    pub const fn new(page: PageId, slot: u16) -> Self {
        Self { page, slot }
    }

    #[must_use]
    pub const fn page(&self) -> PageId {
        self.page
    }

    #[must_use]
    pub const fn slot(&self) -> u16 {
        self.slot
    }

    #[must_use]
    pub const fn is_none(&self) -> bool {
        self.page.is_none()
    }

    pub(crate) fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.page.as_u64());
        buf.put_u16_le(self.slot);
    }

    pub(crate) fn decode(buf: &mut impl Buf) -> Self {
        let page = PageId::new(buf.get_u64_le());
        let slot = buf.get_u16_le();
        Self { page, slot }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_none() {
            write!(f, "Link(none)")
        } else {
            write!(f, "Link({}:{})", self.page, self.slot)
        }
    }
}

/// One committed version of a row
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowVersion {
    /// Row value, `None` for a tombstone
    pub row: Option<BinaryRow>,
    /// Commit timestamp
    pub timestamp: Timestamp,
    /// Log index of the command that wrote this version
    pub write_index: LogIndex,
}

impl RowVersion {
    #[must_use]
    pub const fn is_tombstone(&self) -> bool {
        self.row.is_none()
    }
}

/// A version plus its link to the next-older node
pub(crate) struct VersionNode {
    pub version: RowVersion,
    pub next: Link,
}

struct DataHeader {
    slot_count: u16,
    live: u16,
    free_end: u16,
}

impl DataHeader {
    fn read(page: &Page) -> Self {
        let mut buf = page.payload();
        Self {
            slot_count: buf.get_u16_le(),
            live: buf.get_u16_le(),
            free_end: buf.get_u16_le(),
        }
    }

    fn write(&self, page: &mut Page) {
        let mut buf = page.payload_mut();
        buf.put_u16_le(self.slot_count);
        buf.put_u16_le(self.live);
        buf.put_u16_le(self.free_end);
    }

    fn free_space(&self) -> usize {
        (self.free_end as usize).saturating_sub(DATA_HEADER + SLOT_SIZE * self.slot_count as usize)
    }
}

fn slot_offset(page: &Page, slot: u16) -> u16 {
    let at = DATA_HEADER + SLOT_SIZE * slot as usize;
    u16::from_le_bytes([page.payload()[at], page.payload()[at + 1]])
}

fn set_slot_offset(page: &mut Page, slot: u16, offset: u16) {
    let at = DATA_HEADER + SLOT_SIZE * slot as usize;
    page.payload_mut()[at..at + 2].copy_from_slice(&offset.to_le_bytes());
}

/// Largest row stored inline in a data page
const fn max_inline(payload: usize) -> usize {
    payload - DATA_HEADER - SLOT_SIZE - RECORD_HEADER
}

/// Offset of a live record, validating the slot
fn record_offset(page: &Page, link: Link) -> Result<usize> {
    let header = DataHeader::read(page);
    if link.slot >= header.slot_count {
        return Err(StorageFault::corruption(
            link.page,
            format!("slot {} out of {}", link.slot, header.slot_count),
        ));
    }
    let offset = slot_offset(page, link.slot) as usize;
    if offset == 0 {
        return Err(StorageFault::corruption(
            link.page,
            format!("slot {} is free", link.slot),
        ));
    }
    if offset + RECORD_HEADER > page.payload().len() {
        return Err(StorageFault::corruption(link.page, format!("record offset {offset} out of page")));
    }
    Ok(offset)
}

/// Read the node at `link`
pub(crate) fn read_node(pager: &Pager, link: Link) -> Result<VersionNode> {
    let page = pager.load_typed(link.page, PageType::Data)?;
    let offset = record_offset(&page, link)?;
    let mut buf = &page.payload()[offset..];

    let flags = buf.get_u8();
    let timestamp = Timestamp::new(buf.get_u64_le());
    let write_index = buf.get_u64_le();
    let next = Link::decode(&mut buf);
    let row_len = buf.get_u32_le() as usize;

    let row = if flags & FLAG_TOMBSTONE != 0 {
        None
    } else if flags & FLAG_OVERFLOW != 0 {
        let head = PageId::new(buf.get_u64_le());
        Some(read_overflow(pager, head, row_len)?)
    } else {
        if row_len > buf.len() {
            return Err(StorageFault::corruption(link.page, "inline row overruns page"));
        }
        Some(Bytes::copy_from_slice(&buf[..row_len]))
    };

    let row = row.map(BinaryRow::from_bytes).transpose()?;
    Ok(VersionNode {
        version: RowVersion {
            row,
            timestamp,
            write_index,
        },
        next,
    })
}

/// Append a node for `version` pointing at `next`
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn append_node(
    pager: &Pager,
    meta: &mut StoreMeta,
    version: &RowVersion,
    next: Link,
) -> Result<Link> {
    let row_bytes = version.row.as_ref().map_or(&[][..], BinaryRow::as_bytes);
    let overflow = row_bytes.len() > max_inline(pager.payload_size());
    let size = RECORD_HEADER + if overflow { 8 } else { row_bytes.len() };

    let overflow_head = if overflow {
        write_overflow(pager, meta, row_bytes)?
    } else {
        PageId::NONE
    };

    let mut page = match fill_page(pager, meta, size)? {
        Some(page) => page,
        None => {
            let mut page = pager.allocate(meta, PageType::Data)?;
            DataHeader {
                slot_count: 0,
                live: 0,
                free_end: pager.payload_size() as u16,
            }
            .write(&mut page);
            meta.fill_page = page.id();
            page
        }
    };

    let mut header = DataHeader::read(&page);
    let offset = header.free_end as usize - size;
    {
        let mut buf = &mut page.payload_mut()[offset..offset + size];
        let mut flags = 0;
        if version.row.is_none() {
            flags |= FLAG_TOMBSTONE;
        }
        if overflow {
            flags |= FLAG_OVERFLOW;
        }
        buf.put_u8(flags);
        buf.put_u64_le(version.timestamp.as_u64());
        buf.put_u64_le(version.write_index);
        next.encode(&mut buf);
        buf.put_u32_le(row_bytes.len() as u32);
        if overflow {
            buf.put_u64_le(overflow_head.as_u64());
        } else {
            buf.put_slice(row_bytes);
        }
    }

    let slot = header.slot_count;
    set_slot_offset(&mut page, slot, offset as u16);
    header.slot_count += 1;
    header.live += 1;
    header.free_end = offset as u16;
    header.write(&mut page);

    let link = Link::new(page.id(), slot);
    pager.save(page)?;
    Ok(link)
}

/// Current fill page if a record of `size` bytes still fits
fn fill_page(pager: &Pager, meta: &StoreMeta, size: usize) -> Result<Option<Page>> {
    if meta.fill_page.is_none() {
        return Ok(None);
    }
    let page = pager.load_typed(meta.fill_page, PageType::Data)?;
    let header = DataHeader::read(&page);
    let fits = header.free_space() >= size + SLOT_SIZE && header.slot_count < u16::MAX;
    Ok(fits.then_some(page))
}

/// Point the node at `link` to a new next-older node
pub(crate) fn set_next(pager: &Pager, link: Link, next: Link) -> Result<()> {
    let mut page = pager.load_typed(link.page, PageType::Data)?;
    let offset = record_offset(&page, link)? + NEXT_OFFSET;
    let mut buf = &mut page.payload_mut()[offset..offset + LINK_SIZE];
    next.encode(&mut buf);
    pager.save(page)
}

/// Release the node at `link` and its overflow pages
pub(crate) fn free_node(pager: &Pager, meta: &mut StoreMeta, link: Link) -> Result<()> {
    let mut page = pager.load_typed(link.page, PageType::Data)?;
    let offset = record_offset(&page, link)?;

    let flags = page.payload()[offset];
    if flags & FLAG_OVERFLOW != 0 {
        let mut buf = &page.payload()[offset + RECORD_HEADER..];
        let head = PageId::new(buf.get_u64_le());
        free_overflow(pager, meta, head)?;
    }

    set_slot_offset(&mut page, link.slot, 0);
    let mut header = DataHeader::read(&page);
    header.live = header.live.saturating_sub(1);

    if header.live == 0 {
        if meta.fill_page == link.page {
            meta.fill_page = PageId::NONE;
        }
        pager.free(meta, link.page)
    } else {
        header.write(&mut page);
        pager.save(page)
    }
}

fn write_overflow(pager: &Pager, meta: &mut StoreMeta, bytes: &[u8]) -> Result<PageId> {
    let capacity = pager.payload_size() - OVERFLOW_HEADER;
    let chunks: Vec<&[u8]> = bytes.chunks(capacity).collect();
    let mut pages = Vec::with_capacity(chunks.len());
    for _ in &chunks {
        pages.push(pager.allocate(meta, PageType::Overflow)?);
    }

    let ids: Vec<PageId> = pages.iter().map(Page::id).collect();
    for (i, (mut page, chunk)) in pages.into_iter().zip(chunks).enumerate() {
        let next = ids.get(i + 1).copied().unwrap_or(PageId::NONE);
        let mut buf = page.payload_mut();
        buf.put_u64_le(next.as_u64());
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32_le(chunk.len() as u32);
        buf.put_slice(chunk);
        pager.save(page)?;
    }
    Ok(ids[0])
}

fn read_overflow(pager: &Pager, head: PageId, total: usize) -> Result<Bytes> {
    let mut out = Vec::with_capacity(total);
    let mut id = head;
    while !id.is_none() {
        let page = pager.load_typed(id, PageType::Overflow)?;
        let mut buf = page.payload();
        let next = PageId::new(buf.get_u64_le());
        let len = buf.get_u32_le() as usize;
        if len > buf.len() || out.len() + len > total {
            return Err(StorageFault::corruption(id, "overflow chunk overruns row"));
        }
        out.extend_from_slice(&buf[..len]);
        id = next;
    }
    if out.len() != total {
        return Err(StorageFault::corruption(
            head,
            format!("overflow row is {} bytes, expected {total}", out.len()),
        ));
    }
    Ok(Bytes::from(out))
}

fn free_overflow(pager: &Pager, meta: &mut StoreMeta, head: PageId) -> Result<()> {
    let mut id = head;
    while !id.is_none() {
        let page = pager.load_typed(id, PageType::Overflow)?;
        let next = PageId::new(page.payload().get_u64_le());
        pager.free(meta, id)?;
        id = next;
    }
    Ok(())
}

//! Verified page access and page allocation
//!
//! Allocation state (page count, free list) lives in [`StoreMeta`], which the
//! caller holds under the store's write lock.

use crate::memory::PageMemory;
use crate::meta::StoreMeta;
use crate::page::{Page, PageType};
use bytes::{Buf, BufMut};
use pagoda_common::{PageId, Result};

pub(crate) struct Pager {
    memory: Box<dyn PageMemory>,
}

impl Pager {
    pub fn new(memory: Box<dyn PageMemory>) -> Self {
        Self { memory }
    }

    pub fn memory(&self) -> &dyn PageMemory {
        self.memory.as_ref()
    }

    pub fn page_size(&self) -> usize {
        self.memory.page_size()
    }

    /// Usable bytes after the page header
    pub fn payload_size(&self) -> usize {
        self.page_size() - crate::page::PAGE_HEADER_SIZE
    }

    /// Read and verify a page
    pub fn load(&self, id: PageId) -> Result<Page> {
        Page::from_raw(id, self.memory.read_page(id)?)
    }

    /// Read a page and check its type
    pub fn load_typed(&self, id: PageId, page_type: PageType) -> Result<Page> {
        let page = self.load(id)?;
        page.expect_type(page_type)?;
        Ok(page)
    }

    /// Seal and write a page
    pub fn save(&self, page: Page) -> Result<()> {
        let id = page.id();
        self.memory.write_page(id, &page.seal())
    }

    /// Hand out a blank page, reusing the free list first
    pub fn allocate(&self, meta: &mut StoreMeta, page_type: PageType) -> Result<Page> {
        let id = if meta.free_head.is_none() {
            let id = PageId::new(meta.page_count);
            meta.page_count += 1;
            id
        } else {
            let id = meta.free_head;
            let free = self.load_typed(id, PageType::Free)?;
            meta.free_head = PageId::new(free.payload().get_u64_le());
            meta.free_pages = meta.free_pages.saturating_sub(1);
            id
        };
        Ok(Page::new(id, page_type, self.page_size()))
    }

    /// Put a page on the free list
    pub fn free(&self, meta: &mut StoreMeta, id: PageId) -> Result<()> {
        let mut page = Page::new(id, PageType::Free, self.page_size());
        page.payload_mut().put_u64_le(meta.free_head.as_u64());
        self.save(page)?;
        meta.free_head = id;
        meta.free_pages += 1;
        Ok(())
    }

    /// Write the meta page
    pub fn save_meta(&self, meta: &StoreMeta) -> Result<()> {
        self.save(meta.to_page(self.page_size()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::VolatilePageMemory;

    #[test]
    fn test_free_list_reuse() {
        let pager = Pager::new(Box::new(VolatilePageMemory::new(256).unwrap()));
        let mut meta = StoreMeta::new(256);

        let a = pager.allocate(&mut meta, PageType::Data).unwrap();
        let b = pager.allocate(&mut meta, PageType::Data).unwrap();
        assert_eq!((a.id(), b.id()), (PageId::new(2), PageId::new(3)));
        pager.save(a).unwrap();
        pager.save(b).unwrap();

        pager.free(&mut meta, PageId::new(2)).unwrap();
        pager.free(&mut meta, PageId::new(3)).unwrap();
        assert_eq!(meta.free_pages, 2);

        // LIFO reuse
        let c = pager.allocate(&mut meta, PageType::Overflow).unwrap();
        let d = pager.allocate(&mut meta, PageType::Overflow).unwrap();
        let e = pager.allocate(&mut meta, PageType::Overflow).unwrap();
        assert_eq!(c.id(), PageId::new(3));
        assert_eq!(d.id(), PageId::new(2));
        assert_eq!(e.id(), PageId::new(4));
        assert!(meta.free_head.is_none());
        assert_eq!(meta.free_pages, 0);
    }

    #[test]
    fn test_load_typed_checks_type() {
        let pager = Pager::new(Box::new(VolatilePageMemory::new(256).unwrap()));
        let mut meta = StoreMeta::new(256);
        let page = pager.allocate(&mut meta, PageType::Data).unwrap();
        let id = page.id();
        pager.save(page).unwrap();
        assert!(pager.load_typed(id, PageType::Data).is_ok());
        assert!(pager.load_typed(id, PageType::BTreeLeaf).is_err());
    }
}

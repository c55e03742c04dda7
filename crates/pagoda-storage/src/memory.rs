//! Page memory
//!
//! Raw page images are read and written through [`PageMemory`]. Two
//! implementations exist:
//! - [`VolatilePageMemory`]: pages live on the heap, lost on restart
//! - [`FilePageMemory`]: one page file per partition, positional I/O,
//!   write-through with an ARC cache in front

use crate::cache::PageCache;
use crate::page::validate_page_size;
use pagoda_common::{PageId, Result, StorageFault};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Storage for fixed-size page images
pub trait PageMemory: Send + Sync {
    /// Size of every page in bytes
    fn page_size(&self) -> usize;

    /// Number of pages physically present
    fn page_count(&self) -> u64;

    /// Read a raw page image
    fn read_page(&self, id: PageId) -> Result<Vec<u8>>;

    /// Write a raw page image, growing the memory if needed
    fn write_page(&self, id: PageId, image: &[u8]) -> Result<()>;

    /// Make written pages durable
    fn sync(&self) -> Result<()>;

    /// Drop every page at or beyond `pages`
    fn truncate(&self, pages: u64) -> Result<()>;

    /// Whether pages survive a restart
    fn is_persistent(&self) -> bool;
}

fn check_image(id: PageId, image: &[u8], page_size: usize) -> Result<()> {
    if image.len() == page_size {
        Ok(())
    } else {
        Err(StorageFault::corruption(
            id,
            format!("page image is {} bytes, page size is {page_size}", image.len()),
        ))
    }
}

/// Heap-backed page memory
pub struct VolatilePageMemory {
    page_size: usize,
    pages: RwLock<Vec<Option<Vec<u8>>>>,
}

impl VolatilePageMemory {
    pub fn new(page_size: usize) -> Result<Self> {
        validate_page_size(page_size)?;
        Ok(Self {
            page_size,
            pages: RwLock::new(Vec::new()),
        })
    }
}

impl PageMemory for VolatilePageMemory {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn page_count(&self) -> u64 {
        self.pages.read().len() as u64
    }

    fn read_page(&self, id: PageId) -> Result<Vec<u8>> {
        let pages = self.pages.read();
        usize::try_from(id.as_u64())
            .ok()
            .and_then(|idx| pages.get(idx))
            .and_then(Option::clone)
            .ok_or_else(|| StorageFault::corruption(id, "page was never written"))
    }

    fn write_page(&self, id: PageId, image: &[u8]) -> Result<()> {
        check_image(id, image, self.page_size)?;
        let idx = usize::try_from(id.as_u64())
            .map_err(|_| StorageFault::corruption(id, "page id out of range"))?;
        let mut pages = self.pages.write();
        if idx >= pages.len() {
            pages.resize(idx + 1, None);
        }
        pages[idx] = Some(image.to_vec());
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn truncate(&self, pages: u64) -> Result<()> {
        let keep = usize::try_from(pages).unwrap_or(usize::MAX);
        self.pages.write().truncate(keep);
        Ok(())
    }

    fn is_persistent(&self) -> bool {
        false
    }
}

/// File-backed page memory
pub struct FilePageMemory {
    file: File,
    path: PathBuf,
    page_size: usize,
    pages: AtomicU64,
    cache: PageCache,
}

impl FilePageMemory {
    /// Open or create a page file
    pub fn open(path: impl AsRef<Path>, page_size: usize, cache_pages: usize) -> Result<Self> {
        validate_page_size(page_size)?;
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let len = file.metadata()?.len();
        if len % page_size as u64 != 0 {
            return Err(StorageFault::corruption(
                PageId::META,
                format!(
                    "{} is {len} bytes, not a multiple of page size {page_size}",
                    path.display()
                ),
            ));
        }
        let pages = len / page_size as u64;

        info!(
            "Opened page file {} ({} pages of {} bytes)",
            path.display(),
            pages,
            page_size
        );

        Ok(Self {
            file,
            path,
            page_size,
            pages: AtomicU64::new(pages),
            cache: PageCache::new(cache_pages),
        })
    }

    /// Path of the page file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The page cache in front of the file
    pub const fn cache(&self) -> &PageCache {
        &self.cache
    }

    const fn offset(&self, id: PageId) -> u64 {
        id.as_u64() * self.page_size as u64
    }
}

impl PageMemory for FilePageMemory {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn page_count(&self) -> u64 {
        self.pages.load(Ordering::Acquire)
    }

    fn read_page(&self, id: PageId) -> Result<Vec<u8>> {
        if id.as_u64() >= self.page_count() {
            return Err(StorageFault::corruption(id, "page is beyond end of file"));
        }
        if let Some(image) = self.cache.get(id) {
            return Ok(image);
        }

        let mut buf = vec![0u8; self.page_size];
        self.file.read_exact_at(&mut buf, self.offset(id))?;
        self.cache.put(id, buf.clone());
        Ok(buf)
    }

    fn write_page(&self, id: PageId, image: &[u8]) -> Result<()> {
        check_image(id, image, self.page_size)?;
        self.file.write_all_at(image, self.offset(id))?;
        self.cache.put(id, image.to_vec());
        self.pages.fetch_max(id.as_u64() + 1, Ordering::AcqRel);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn truncate(&self, pages: u64) -> Result<()> {
        self.file.set_len(pages * self.page_size as u64)?;
        self.cache.clear();
        self.pages.store(pages, Ordering::Release);
        debug!("Truncated {} to {} pages", self.path.display(), pages);
        Ok(())
    }

    fn is_persistent(&self) -> bool {
        true
    }
}

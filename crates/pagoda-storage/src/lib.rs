//! Pagoda Storage - Partition MVCC storage engine
//!
//! This crate implements the storage side of a partition replica:
//!
//! - Page layout and page memory (volatile or file-backed with an ARC cache)
//! - A page-resident B+-tree mapping row ids to version chain heads
//! - Version chains with MVCC visibility ([`mv::VersionChainStore`])
//! - Secondary index storage derived from rows by injected resolvers
//! - Low-watermark garbage collection of obsolete versions

mod btree;
pub mod cache;
mod chain;
pub mod gc;
pub mod index;
pub mod memory;
mod meta;
pub mod mv;
pub mod page;
mod pager;

pub use cache::PageCache;
pub use chain::{Link, RowVersion};
pub use gc::{
    GarbageCollector, GcReport, GcWorker, IndexGuard, IndexInconsistency, LowWatermark,
    NoIndexes, WatermarkPin, WatermarkPins,
};
pub use index::{
    IndexResolver, RowIdCursor, SortedIndexStorage, TableIndexes, TableSchemaAwareIndexStorage,
    primary_key_resolver, resolver,
};
pub use memory::{FilePageMemory, PageMemory, VolatilePageMemory};
pub use mv::{PartitionWriter, PruneOutcome, StoreStats, VersionChainStore};
pub use page::{Page, PageType};

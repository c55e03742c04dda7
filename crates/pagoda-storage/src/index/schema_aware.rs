//! Index storage bound to the row layout of a table

use super::sorted::{RowIdCursor, SortedIndexStorage};
use pagoda_common::{BinaryRow, IndexId, IndexTuple, RowId};
use std::fmt;
use std::sync::Arc;

/// Derives an index tuple from a row
pub type IndexResolver = Arc<dyn Fn(&BinaryRow) -> IndexTuple + Send + Sync>;

/// Resolver for the primary key: the row's key bytes
pub fn primary_key_resolver() -> IndexResolver {
    Arc::new(|row: &BinaryRow| IndexTuple::copy_from_slice(row.key()))
}

/// Resolver from an arbitrary closure
pub fn resolver<F>(f: F) -> IndexResolver
where
    F: Fn(&BinaryRow) -> IndexTuple + Send + Sync + 'static,
{
    Arc::new(f)
}

/// An index addressed by table rows rather than tuples
#[derive(Clone)]
pub struct TableSchemaAwareIndexStorage {
    id: IndexId,
    storage: Arc<SortedIndexStorage>,
    resolver: IndexResolver,
}

impl TableSchemaAwareIndexStorage {
    pub fn new(id: IndexId, storage: Arc<SortedIndexStorage>, resolver: IndexResolver) -> Self {
        Self {
            id,
            storage,
            resolver,
        }
    }

    pub const fn id(&self) -> IndexId {
        self.id
    }

    pub fn storage(&self) -> &Arc<SortedIndexStorage> {
        &self.storage
    }

    /// Tuple `row` is indexed under
    pub fn resolve_index_row(&self, row: &BinaryRow) -> IndexTuple {
        (self.resolver)(row)
    }

    /// Row ids indexed under the tuple of `row`
    pub fn get(&self, row: &BinaryRow) -> RowIdCursor {
        self.storage.get(&self.resolve_index_row(row))
    }

    pub fn put(&self, row: &BinaryRow, row_id: RowId) {
        self.storage.put(self.resolve_index_row(row), row_id);
    }

    pub fn remove(&self, row: &BinaryRow, row_id: RowId) {
        self.storage.remove(&self.resolve_index_row(row), &row_id);
    }
}

impl fmt::Debug for TableSchemaAwareIndexStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableSchemaAwareIndexStorage")
            .field("id", &self.id)
            .field("entries", &self.storage.len())
            .finish_non_exhaustive()
    }
}

//! Error type for tx state storage

use pagoda_common::StorageFault;

#[derive(Debug, thiserror::Error)]
pub enum TxStateError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed tx id key of {0} bytes")]
    BadKey(usize),
}

impl From<redb::TransactionError> for TxStateError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<TxStateError> for StorageFault {
    fn from(e: TxStateError) -> Self {
        Self::TxState(e.to_string())
    }
}

pub type TxStateResult<T> = Result<T, TxStateError>;

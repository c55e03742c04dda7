//! Pagoda Tx State - Transaction metadata storage
//!
//! Each partition keeps the state of the transactions it took part in
//! (pending, committed, aborted) next to its row storage. The storage has its
//! own applied index, advanced after the row storage's for every command and
//! transferred together with row data during snapshot install.

pub mod error;
pub mod meta;
pub mod storage;
mod tables;

pub use error::{TxStateError, TxStateResult};
pub use meta::{TxMeta, TxState};
pub use storage::TxStateStorage;

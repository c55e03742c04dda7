//! Pagoda Common - Shared types and utilities
//!
//! This crate provides the identifiers, row encodings, error definitions and
//! configuration used by the partition storage, tx-state and replication
//! crates.

pub mod checksum;
pub mod config;
pub mod context;
pub mod error;
pub mod row;
pub mod types;

pub use config::Config;
pub use context::{CancellationToken, ExecutionContext};
pub use error::{Result, StorageFault};
pub use row::{BinaryRow, IndexTuple, RowValue};
pub use types::*;

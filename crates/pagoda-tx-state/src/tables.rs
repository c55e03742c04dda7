//! Redb table definitions

use redb::TableDefinition;

/// Key: 16-byte tx id, Value: bincode-encoded `TxMeta`
pub const TX_META: TableDefinition<&[u8], &[u8]> = TableDefinition::new("tx_meta");

/// Applied log position of this storage
pub const APPLIED: TableDefinition<&str, u64> = TableDefinition::new("applied");

pub const LAST_APPLIED_INDEX: &str = "last_applied_index";
pub const LAST_APPLIED_TERM: &str = "last_applied_term";

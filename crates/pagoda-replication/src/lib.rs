//! Pagoda Replication - Replicated apply and snapshot transfer
//!
//! This crate sits between the replicated log and a partition's storage:
//!
//! - [`listener::PartitionListener`] applies committed write commands in log
//!   order, keeping row storage, indexes and tx state in step
//! - [`snapshot`] serves a frozen, consistent copy of a partition to a
//!   lagging replica and ingests such a copy on the receiving side

pub mod command;
pub mod error;
pub mod listener;
pub mod partition;
pub mod raft_error;
pub mod snapshot;

pub use command::WriteCommand;
pub use error::{ApplyError, CopyError, SnapshotError};
pub use listener::{ApplyOutcome, IgnoreReason, PartitionListener};
pub use partition::{Partition, PartitionAccess};
pub use raft_error::{RaftError, Status};

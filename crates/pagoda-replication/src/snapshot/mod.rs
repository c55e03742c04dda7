//! Snapshot transfer
//!
//! A lagging replica is brought up to date by copying a consistent image of
//! the partition instead of replaying the log. The serving side freezes an
//! [`OutgoingSnapshot`](outgoing::OutgoingSnapshot) and streams row versions
//! and tx metadata from it; the receiving side ingests them with an
//! [`IncomingSnapshotCopier`](incoming::IncomingSnapshotCopier).

pub mod incoming;
pub mod log;
pub mod message;
pub mod outgoing;
pub mod registry;

pub use incoming::{IncomingSnapshotCopier, LocalSnapshotSource, SnapshotSource};
pub use log::{Configuration, ConfigurationEntry, LogHistory, LogManager};
pub use message::SnapshotMeta;
pub use outgoing::{OutgoingSnapshot, SnapshotLockGuard};
pub use registry::SnapshotRegistry;

/// Identifier of one snapshot session
pub type SnapshotId = uuid::Uuid;

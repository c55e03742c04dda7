//! Live outgoing snapshot sessions on a node

use super::SnapshotId;
use super::log::LogManager;
use super::outgoing::OutgoingSnapshot;
use crate::error::SnapshotError;
use crate::partition::PartitionAccess;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Outgoing sessions by id, so data requests can find their session
#[derive(Default)]
pub struct SnapshotRegistry {
    sessions: Mutex<HashMap<SnapshotId, Arc<OutgoingSnapshot>>>,
}

impl SnapshotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create, freeze and register a session for `partition`
    pub fn start_outgoing(
        &self,
        partition: Arc<dyn PartitionAccess>,
        log: Arc<dyn LogManager>,
    ) -> Result<Arc<OutgoingSnapshot>, SnapshotError> {
        let snapshot = Arc::new(OutgoingSnapshot::new(uuid::Uuid::new_v4(), partition, log));
        snapshot.freeze()?;
        self.sessions
            .lock()
            .insert(snapshot.id(), Arc::clone(&snapshot));
        debug!(
            "Registered snapshot {} for partition {}",
            snapshot.id(),
            snapshot.partition_key()
        );
        Ok(snapshot)
    }

    /// Live session by id; a session closed on its own is dropped here
    pub fn get(&self, id: SnapshotId) -> Option<Arc<OutgoingSnapshot>> {
        let mut sessions = self.sessions.lock();
        let snapshot = sessions.get(&id)?;
        if snapshot.is_closed() {
            sessions.remove(&id);
            debug!("Dropped closed snapshot {}", id);
            return None;
        }
        Some(Arc::clone(snapshot))
    }

    /// Close and forget a session; false if it was unknown
    pub fn finish(&self, id: SnapshotId) -> bool {
        let Some(snapshot) = self.sessions.lock().remove(&id) else {
            return false;
        };
        snapshot.close();
        true
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::Partition;
    use crate::snapshot::log::LogHistory;
    use pagoda_common::{IndexId, PartitionKey, TableId};
    use pagoda_storage::{TableIndexes, VersionChainStore};
    use pagoda_tx_state::TxStateStorage;

    #[test]
    fn test_start_get_finish() {
        let dir = tempfile::tempdir().unwrap();
        let partition: Arc<dyn PartitionAccess> = Arc::new(Partition::new(
            PartitionKey::new(TableId::new(), 0),
            Arc::new(VersionChainStore::volatile(0, 1024).unwrap()),
            TxStateStorage::open(dir.path().join("tx.redb")).unwrap(),
            TableIndexes::with_primary_key(IndexId::new()),
        ));
        let registry = SnapshotRegistry::new();

        let snapshot = registry
            .start_outgoing(Arc::clone(&partition), Arc::new(LogHistory::new()))
            .unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get(snapshot.id()).is_some());
        assert_eq!(partition.mv_partition_storage().pins().len(), 1);

        assert!(registry.finish(snapshot.id()));
        assert!(snapshot.is_closed());
        assert!(registry.is_empty());
        assert!(partition.mv_partition_storage().pins().is_empty());
        assert!(!registry.finish(snapshot.id()));
    }

    #[test]
    fn test_closed_sessions_are_dropped_on_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let partition: Arc<dyn PartitionAccess> = Arc::new(Partition::new(
            PartitionKey::new(TableId::new(), 0),
            Arc::new(VersionChainStore::volatile(0, 1024).unwrap()),
            TxStateStorage::open(dir.path().join("tx.redb")).unwrap(),
            TableIndexes::with_primary_key(IndexId::new()),
        ));
        let registry = SnapshotRegistry::new();
        let snapshot = registry
            .start_outgoing(partition, Arc::new(LogHistory::new()))
            .unwrap();

        snapshot.close();
        assert_eq!(registry.len(), 1);
        assert!(registry.get(snapshot.id()).is_none());
        assert!(registry.is_empty());
        assert!(!registry.finish(snapshot.id()));
    }
}

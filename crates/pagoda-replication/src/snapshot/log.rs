//! Read-only view of the replicated log

use pagoda_common::{LogIndex, LogTerm};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Voting and non-voting members of a group
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Configuration {
    pub peers: Vec<String>,
    pub learners: Vec<String>,
}

impl Configuration {
    pub fn new(peers: Vec<String>, learners: Vec<String>) -> Self {
        Self { peers, learners }
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty() && self.learners.is_empty()
    }
}

/// Configuration in effect at a log index, plus the one it replaced while a
/// membership change is in flight
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigurationEntry {
    pub conf: Configuration,
    pub old_conf: Option<Configuration>,
}

/// Log lookups needed to describe a snapshot
pub trait LogManager: Send + Sync {
    /// Term of the entry at `index`, 0 if unknown
    fn term(&self, index: LogIndex) -> LogTerm;

    /// Configuration in effect at `index`
    fn configuration(&self, index: LogIndex) -> ConfigurationEntry;
}

/// In-memory log history: terms and configurations keyed by the index they
/// take effect at
#[derive(Debug, Default)]
pub struct LogHistory {
    terms: RwLock<BTreeMap<LogIndex, LogTerm>>,
    configurations: RwLock<BTreeMap<LogIndex, ConfigurationEntry>>,
}

impl LogHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries from `index` on carry `term`
    pub fn record_term(&self, index: LogIndex, term: LogTerm) {
        self.terms.write().insert(index, term);
    }

    /// `entry` is in effect from `index` on
    pub fn record_configuration(&self, index: LogIndex, entry: ConfigurationEntry) {
        self.configurations.write().insert(index, entry);
    }
}

impl LogManager for LogHistory {
    fn term(&self, index: LogIndex) -> LogTerm {
        self.terms
            .read()
            .range(..=index)
            .next_back()
            .map_or(0, |(_, term)| *term)
    }

    fn configuration(&self, index: LogIndex) -> ConfigurationEntry {
        self.configurations
            .read()
            .range(..=index)
            .next_back()
            .map(|(_, entry)| entry.clone())
            .unwrap_or_default()
    }
}

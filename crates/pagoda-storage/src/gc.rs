//! Garbage collection of obsolete row versions
//!
//! A version is obsolete once no reader can observe it: there is a newer
//! version at or below the GC horizon. The horizon is the low watermark
//! lowered to the smallest active [`WatermarkPin`] (snapshot freezes pin the
//! timestamps they still have to stream).

use crate::chain::RowVersion;
use crate::mv::{PruneOutcome, VersionChainStore};
use pagoda_common::config::GcConfig;
use pagoda_common::{
    CancellationToken, ExecutionContext, IndexId, Result, RowId, Timestamp,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use thiserror::Error;
use tracing::{debug, error, info};

/// Monotonic low watermark; reads below it are no longer served
#[derive(Debug, Default)]
pub struct LowWatermark(AtomicU64);

impl LowWatermark {
    pub const fn new(ts: Timestamp) -> Self {
        Self(AtomicU64::new(ts.as_u64()))
    }

    pub fn get(&self) -> Timestamp {
        Timestamp::new(self.0.load(Ordering::Acquire))
    }

    /// Move the watermark forward; returns false if `ts` is not newer
    pub fn advance(&self, ts: Timestamp) -> bool {
        self.0.fetch_max(ts.as_u64(), Ordering::AcqRel) < ts.as_u64()
    }
}

/// Set of timestamps GC must not prune past
#[derive(Clone, Debug, Default)]
pub struct WatermarkPins {
    pins: Arc<Mutex<BTreeMap<u64, usize>>>,
}

impl WatermarkPins {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin `ts` until the returned guard is dropped
    pub fn pin(&self, ts: Timestamp) -> WatermarkPin {
        *self.pins.lock().entry(ts.as_u64()).or_insert(0) += 1;
        WatermarkPin {
            pins: self.clone(),
            ts,
        }
    }

    /// Smallest pinned timestamp
    pub fn min_pinned(&self) -> Option<Timestamp> {
        self.pins
            .lock()
            .keys()
            .next()
            .map(|ts| Timestamp::new(*ts))
    }

    /// Number of active pins
    pub fn len(&self) -> usize {
        self.pins.lock().values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.lock().is_empty()
    }

    fn unpin(&self, ts: Timestamp) {
        let mut pins = self.pins.lock();
        if let Some(count) = pins.get_mut(&ts.as_u64()) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&ts.as_u64());
            }
        }
    }
}

/// RAII pin on the GC horizon
#[derive(Debug)]
pub struct WatermarkPin {
    pins: WatermarkPins,
    ts: Timestamp,
}

impl WatermarkPin {
    pub const fn timestamp(&self) -> Timestamp {
        self.ts
    }
}

impl Drop for WatermarkPin {
    fn drop(&mut self) {
        self.pins.unpin(self.ts);
    }
}

/// Index state that disagrees with a row's version chain
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("index {index_id} is inconsistent for row {row_id}: {reason}")]
pub struct IndexInconsistency {
    pub row_id: RowId,
    pub index_id: IndexId,
    pub reason: String,
}

/// Consulted before GC removes versions of a row
pub trait IndexGuard: Send + Sync {
    /// `chain` is newest first
    fn check(&self, row_id: &RowId, chain: &[RowVersion]) -> std::result::Result<(), IndexInconsistency>;
}

/// Guard for partitions without indexes
#[derive(Debug, Clone, Copy, Default)]
pub struct NoIndexes;

impl IndexGuard for NoIndexes {
    fn check(&self, _: &RowId, _: &[RowVersion]) -> std::result::Result<(), IndexInconsistency> {
        Ok(())
    }
}

/// Outcome of one GC pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub rows_scanned: u64,
    pub versions_pruned: u64,
    pub chains_removed: u64,
    /// Rows left alone because their index state was inconsistent
    pub rows_skipped: u64,
    /// Pass stopped early on cancellation
    pub cancelled: bool,
}

impl GcReport {
    fn record(&mut self, outcome: &PruneOutcome) {
        match outcome {
            PruneOutcome::Untouched => {}
            PruneOutcome::Truncated { versions } => {
                self.versions_pruned += *versions as u64;
            }
            PruneOutcome::Removed { versions } => {
                self.versions_pruned += *versions as u64;
                self.chains_removed += 1;
            }
            PruneOutcome::Skipped(_) => self.rows_skipped += 1,
        }
    }
}

/// Sweeps one partition's version chains
pub struct GarbageCollector {
    store: Arc<VersionChainStore>,
    guard: Arc<dyn IndexGuard>,
    batch_size: usize,
}

impl GarbageCollector {
    pub fn new(store: Arc<VersionChainStore>, guard: Arc<dyn IndexGuard>, batch_size: usize) -> Self {
        Self {
            store,
            guard,
            batch_size: batch_size.max(1),
        }
    }

    /// Effective horizon for `low_watermark`
    pub fn horizon(&self, low_watermark: Timestamp) -> Timestamp {
        self.store
            .pins()
            .min_pinned()
            .map_or(low_watermark, |pinned| pinned.min(low_watermark))
    }

    /// Run one pass over every row id
    ///
    /// Cancellation is checked between batches; a cancelled pass returns the
    /// partial report rather than an error.
    pub fn collect(&self, low_watermark: Timestamp, ctx: &ExecutionContext) -> Result<GcReport> {
        let mut report = GcReport::default();
        let mut after: Option<RowId> = None;

        loop {
            if ctx.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let batch = self.store.scan_row_ids(after.as_ref(), self.batch_size)?;
            let Some(last) = batch.last().copied() else {
                break;
            };
            for row_id in &batch {
                report.rows_scanned += 1;
                // Pins taken mid-pass apply from the next row on
                let horizon = self.horizon(low_watermark);
                let outcome = self.store.prune(row_id, horizon, self.guard.as_ref())?;
                report.record(&outcome);
            }
            after = Some(last);
        }

        debug!(
            "GC pass on partition {}: scanned {}, pruned {}, removed {}, skipped {}",
            self.store.partition_id(),
            report.rows_scanned,
            report.versions_pruned,
            report.chains_removed,
            report.rows_skipped
        );
        Ok(report)
    }
}

/// Background thread running GC passes on an interval
pub struct GcWorker {
    shutdown: Arc<AtomicBool>,
    token: CancellationToken,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
    passes: Arc<AtomicU64>,
}

impl GcWorker {
    /// Spawn the sweeper; with GC disabled no thread is started
    pub fn start(collector: GarbageCollector, watermark: Arc<LowWatermark>, config: &GcConfig) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let token = CancellationToken::new();
        let passes = Arc::new(AtomicU64::new(0));

        if !config.enabled {
            info!("GC disabled for partition {}", collector.store.partition_id());
            return Self {
                shutdown,
                token,
                handle: Mutex::new(None),
                passes,
            };
        }

        let interval = config.interval();
        let handle = {
            let shutdown = Arc::clone(&shutdown);
            let passes = Arc::clone(&passes);
            let ctx = ExecutionContext::with_token(token.clone());
            thread::spawn(move || {
                info!(
                    "GC worker started for partition {}",
                    collector.store.partition_id()
                );

                while !shutdown.load(Ordering::Relaxed) {
                    thread::sleep(interval);

                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }

                    match collector.collect(watermark.get(), &ctx) {
                        Ok(report) => {
                            passes.fetch_add(1, Ordering::Relaxed);
                            if report.rows_skipped > 0 {
                                info!(
                                    "GC skipped {} rows with inconsistent indexes",
                                    report.rows_skipped
                                );
                            }
                        }
                        Err(e) => {
                            error!("GC pass failed: {}", e);
                        }
                    }
                }

                info!("GC worker stopped");
            })
        };

        Self {
            shutdown,
            token,
            handle: Mutex::new(Some(handle)),
            passes,
        }
    }

    /// Completed passes
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// Stop the thread, cancelling a pass in progress
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.token.cancel();

        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for GcWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::TableIndexes;
    use pagoda_common::BinaryRow;
    use std::time::{Duration, Instant};

    fn ts(n: u64) -> Timestamp {
        Timestamp::new(n)
    }

    fn row(value: &str) -> BinaryRow {
        BinaryRow::new(1, b"k", value.as_bytes())
    }

    /// Rows 1..=count, each with versions at t, t+10 and t+20 where t = row index
    fn populated(count: u64) -> Arc<VersionChainStore> {
        let store = Arc::new(VersionChainStore::volatile(0, 512).unwrap());
        let mut index = 0;
        for i in 1..=count {
            let id = RowId::for_log_index(0, i, 0);
            for step in 0..3 {
                index += 1;
                let mut writer = store.writer(index, 1).unwrap();
                writer
                    .replace(id, row(&format!("{i}-{step}")), ts(i + step * 10))
                    .unwrap();
                writer.finish();
            }
        }
        store
    }

    struct RejectAll;

    impl IndexGuard for RejectAll {
        fn check(&self, row_id: &RowId, _: &[RowVersion]) -> std::result::Result<(), IndexInconsistency> {
            Err(IndexInconsistency {
                row_id: *row_id,
                index_id: IndexId::from_uuid(uuid::Uuid::nil()),
                reason: "missing entry".into(),
            })
        }
    }

    #[test]
    fn test_low_watermark_is_monotonic() {
        let lwm = LowWatermark::new(ts(5));
        assert!(lwm.advance(ts(10)));
        assert!(!lwm.advance(ts(7)));
        assert_eq!(lwm.get(), ts(10));
    }

    #[test]
    fn test_pins() {
        let pins = WatermarkPins::new();
        assert!(pins.min_pinned().is_none());

        let a = pins.pin(ts(30));
        let b = pins.pin(ts(10));
        let c = pins.pin(ts(10));
        assert_eq!(pins.min_pinned(), Some(ts(10)));
        assert_eq!(pins.len(), 3);

        drop(b);
        assert_eq!(pins.min_pinned(), Some(ts(10)));
        drop(c);
        assert_eq!(pins.min_pinned(), Some(ts(30)));
        assert_eq!(a.timestamp(), ts(30));
        drop(a);
        assert!(pins.is_empty());
    }

    #[test]
    fn test_collect_prunes_below_horizon() {
        let store = populated(10);
        let gc = GarbageCollector::new(Arc::clone(&store), Arc::new(NoIndexes), 3);

        let report = gc.collect(ts(25), &ExecutionContext::new()).unwrap();
        assert_eq!(report.rows_scanned, 10);
        // Rows 1..=5 have their third version at or below 25
        assert_eq!(report.versions_pruned, 5 * 2 + 5);
        assert_eq!(report.chains_removed, 0);
        assert!(!report.cancelled);

        // Reads at or above the horizon are unaffected
        let id = RowId::for_log_index(0, 3, 0);
        assert_eq!(store.read_chain(&id).unwrap().len(), 1);
        assert_eq!(store.get(&id, ts(25)).unwrap(), Some(row("3-2")));
        let id = RowId::for_log_index(0, 8, 0);
        assert_eq!(store.get(&id, ts(25)).unwrap(), Some(row("8-1")));
    }

    #[test]
    fn test_pin_lowers_horizon() {
        let store = populated(4);
        let gc = GarbageCollector::new(Arc::clone(&store), Arc::new(NoIndexes), 16);

        let pin = store.pin_watermark(ts(2));
        assert_eq!(gc.horizon(ts(100)), ts(2));
        let report = gc.collect(ts(100), &ExecutionContext::new()).unwrap();
        assert_eq!(report.versions_pruned, 0);

        drop(pin);
        assert_eq!(gc.horizon(ts(100)), ts(100));
        let report = gc.collect(ts(100), &ExecutionContext::new()).unwrap();
        assert_eq!(report.versions_pruned, 8);
    }

    #[test]
    fn test_tombstoned_rows_are_removed() {
        let store = populated(2);
        let id = RowId::for_log_index(0, 1, 0);
        let mut writer = store.writer(100, 1).unwrap();
        writer.remove(id, ts(50)).unwrap();
        writer.finish();

        let gc = GarbageCollector::new(Arc::clone(&store), Arc::new(NoIndexes), 16);
        let report = gc.collect(ts(60), &ExecutionContext::new()).unwrap();
        assert_eq!(report.chains_removed, 1);
        assert_eq!(store.row_count(), 1);
        assert!(store.read_chain(&id).unwrap().is_empty());
    }

    #[test]
    fn test_stale_index_entry_keeps_tombstoned_chain() {
        let store = Arc::new(VersionChainStore::volatile(0, 512).unwrap());
        let indexes = Arc::new(TableIndexes::with_primary_key(IndexId::new()));
        let id = RowId::for_log_index(0, 1, 0);

        let mut writer = store.writer(1, 1).unwrap();
        writer.insert(id, row("a"), ts(1)).unwrap();
        writer.finish();
        indexes.put_all(&row("a"), id);

        // Tombstone written, primary key entry left behind
        let mut writer = store.writer(2, 1).unwrap();
        writer.remove(id, ts(5)).unwrap();
        writer.finish();

        let gc = GarbageCollector::new(
            Arc::clone(&store),
            Arc::clone(&indexes) as Arc<dyn IndexGuard>,
            16,
        );
        let report = gc.collect(ts(100), &ExecutionContext::new()).unwrap();
        assert_eq!(report.rows_skipped, 1);
        assert_eq!(report.chains_removed, 0);
        assert_eq!(store.read_chain(&id).unwrap().len(), 2);
        assert_eq!(store.row_count(), 1);

        indexes.remove_all(&row("a"), id);
        let report = gc.collect(ts(100), &ExecutionContext::new()).unwrap();
        assert_eq!(report.rows_skipped, 0);
        assert_eq!(report.chains_removed, 1);
        assert!(store.read_chain(&id).unwrap().is_empty());
        assert_eq!(store.row_count(), 0);
    }

    #[test]
    fn test_inconsistent_rows_are_skipped() {
        let store = populated(3);
        let gc = GarbageCollector::new(Arc::clone(&store), Arc::new(RejectAll), 16);

        let report = gc.collect(ts(100), &ExecutionContext::new()).unwrap();
        assert_eq!(report.rows_scanned, 3);
        assert_eq!(report.rows_skipped, 3);
        assert_eq!(report.versions_pruned, 0);
        assert_eq!(
            store.read_chain(&RowId::for_log_index(0, 1, 0)).unwrap().len(),
            3
        );
    }

    #[test]
    fn test_cancelled_pass_stops() {
        let store = populated(3);
        let gc = GarbageCollector::new(store, Arc::new(NoIndexes), 1);
        let token = CancellationToken::new();
        token.cancel();

        let report = gc
            .collect(ts(100), &ExecutionContext::with_token(token))
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.rows_scanned, 0);
    }

    #[test]
    fn test_worker_sweeps_in_background() {
        let store = populated(2);
        let gc = GarbageCollector::new(Arc::clone(&store), Arc::new(NoIndexes), 16);
        let watermark = Arc::new(LowWatermark::new(ts(100)));
        let config = GcConfig {
            enabled: true,
            interval_ms: 5,
            batch_size: 16,
        };

        let worker = GcWorker::start(gc, watermark, &config);
        let deadline = Instant::now() + Duration::from_secs(5);
        while worker.passes() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        worker.shutdown();

        assert!(worker.passes() > 0);
        assert_eq!(
            store.read_chain(&RowId::for_log_index(0, 2, 0)).unwrap().len(),
            1
        );
    }

    #[test]
    fn test_disabled_worker_never_runs() {
        let store = populated(1);
        let gc = GarbageCollector::new(store, Arc::new(NoIndexes), 16);
        let config = GcConfig {
            enabled: false,
            ..GcConfig::default()
        };
        let worker = GcWorker::start(gc, Arc::new(LowWatermark::default()), &config);
        assert!(worker.handle.lock().is_none());
        assert_eq!(worker.passes(), 0);
    }
}

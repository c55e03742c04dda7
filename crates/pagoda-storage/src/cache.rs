//! Adaptive Replacement Cache (ARC) for page images
//!
//! Sits in front of file-backed page memory. ARC balances recency and
//! frequency with four lists:
//!
//! - T1: pages seen once recently
//! - T2: pages seen at least twice
//! - B1/B2: ghost ids recently evicted from T1/T2
//!
//! A ghost hit shifts the target size `p` of T1 toward the list that would
//! have kept the page.

use pagoda_common::PageId;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

/// Cache statistics
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
}

impl CacheStats {
    /// Hit ratio (0.0 to 1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let misses = self.misses.load(Ordering::Relaxed) as f64;
        let total = hits + misses;
        if total == 0.0 { 0.0 } else { hits / total }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum List {
    T1,
    T2,
    B1,
    B2,
}

struct ArcState {
    t1: VecDeque<PageId>,
    t2: VecDeque<PageId>,
    b1: VecDeque<PageId>,
    b2: VecDeque<PageId>,
    pages: HashMap<PageId, Vec<u8>>,
    /// Target size of T1
    p: usize,
    capacity: usize,
}

impl ArcState {
    fn new(capacity: usize) -> Self {
        Self {
            t1: VecDeque::new(),
            t2: VecDeque::new(),
            b1: VecDeque::new(),
            b2: VecDeque::new(),
            pages: HashMap::with_capacity(capacity),
            p: 0,
            capacity,
        }
    }

    fn list_mut(&mut self, list: List) -> &mut VecDeque<PageId> {
        match list {
            List::T1 => &mut self.t1,
            List::T2 => &mut self.t2,
            List::B1 => &mut self.b1,
            List::B2 => &mut self.b2,
        }
    }

    fn locate(&self, id: PageId) -> Option<List> {
        [
            (List::T1, &self.t1),
            (List::T2, &self.t2),
            (List::B1, &self.b1),
            (List::B2, &self.b2),
        ]
        .into_iter()
        .find_map(|(list, ids)| ids.contains(&id).then_some(list))
    }

    fn unlink(&mut self, id: PageId, list: List) {
        self.list_mut(list).retain(|p| *p != id);
    }

    /// Move the LRU page of T1 or T2 to its ghost list
    fn evict(&mut self, ghost_hit_in_b2: bool) -> bool {
        let t1_len = self.t1.len();
        let from_t1 = t1_len > 0 && (t1_len > self.p || (ghost_hit_in_b2 && t1_len == self.p));
        let (from, to) = if from_t1 {
            (List::T1, List::B1)
        } else {
            (List::T2, List::B2)
        };
        match self.list_mut(from).pop_front() {
            Some(victim) => {
                self.pages.remove(&victim);
                self.list_mut(to).push_back(victim);
                true
            }
            None => false,
        }
    }
}

/// ARC page cache
pub struct PageCache {
    state: Mutex<ArcState>,
    stats: CacheStats,
}

impl PageCache {
    /// Create a cache holding up to `capacity` pages
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(ArcState::new(capacity.max(1))),
            stats: CacheStats::default(),
        }
    }

    /// Look up a page image
    pub fn get(&self, id: PageId) -> Option<Vec<u8>> {
        let mut state = self.state.lock();
        match state.locate(id) {
            Some(list @ (List::T1 | List::T2)) => {
                state.unlink(id, list);
                state.t2.push_back(id);
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                state.pages.get(&id).cloned()
            }
            _ => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert or refresh a page image
    pub fn put(&self, id: PageId, image: Vec<u8>) {
        let mut state = self.state.lock();
        let capacity = state.capacity;

        match state.locate(id) {
            Some(list @ (List::T1 | List::T2)) => {
                state.unlink(id, list);
                state.t2.push_back(id);
                state.pages.insert(id, image);
                return;
            }
            Some(List::B1) => {
                let delta = (state.b2.len() / state.b1.len().max(1)).max(1);
                state.p = (state.p + delta).min(capacity);
                state.unlink(id, List::B1);
                if state.evict(false) {
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                }
                state.t2.push_back(id);
                state.pages.insert(id, image);
                return;
            }
            Some(List::B2) => {
                let delta = (state.b1.len() / state.b2.len().max(1)).max(1);
                state.p = state.p.saturating_sub(delta);
                state.unlink(id, List::B2);
                if state.evict(true) {
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                }
                state.t2.push_back(id);
                state.pages.insert(id, image);
                return;
            }
            None => {}
        }

        let l1 = state.t1.len() + state.b1.len();
        let total = l1 + state.t2.len() + state.b2.len();
        if l1 >= capacity {
            if state.t1.len() < capacity {
                state.b1.pop_front();
                if state.evict(false) {
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                }
            } else if let Some(victim) = state.t1.pop_front() {
                state.pages.remove(&victim);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
        } else if total >= capacity {
            if total >= 2 * capacity {
                state.b2.pop_front();
            }
            if state.pages.len() >= capacity && state.evict(false) {
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        state.t1.push_back(id);
        state.pages.insert(id, image);
    }

    /// Drop a page (e.g. when it is freed or the file is truncated)
    pub fn invalidate(&self, id: PageId) {
        let mut state = self.state.lock();
        if let Some(list) = state.locate(id) {
            state.unlink(id, list);
        }
        state.pages.remove(&id);
    }

    /// Drop every cached page
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let capacity = state.capacity;
        *state = ArcState::new(capacity);
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Number of cached page images
    pub fn len(&self) -> usize {
        self.state.lock().pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sizes of (T1, T2, B1, B2)
    pub fn list_sizes(&self) -> (usize, usize, usize, usize) {
        let state = self.state.lock();
        (state.t1.len(), state.t2.len(), state.b1.len(), state.b2.len())
    }
}

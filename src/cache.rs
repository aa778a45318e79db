//! Cache of assembled documents, evicted under memory pressure.
//!
//! Entries are kept in recency order, where both inserting and reading an entry make it the
//! most recent one. There is no capacity: the cache only shrinks when [`DocumentCache::check`]
//! finds free memory below the target ratio, and then drops the oldest entries until their
//! estimated size covers the deficit.

use std::{fmt, sync::Arc};

use lru::LruCache;
use parking_lot::Mutex;
use sysinfo::{Pid, System};
use tracing::{debug, trace};

use crate::metrics::Metrics;

/// Default share of memory that should stay free.
pub const DEFAULT_TARGET_FREE_RATIO: f64 = 0.2;

/// Estimated bookkeeping cost of one entry on top of its text.
const ENTRY_OVERHEAD: u64 = 196;

/// A sample of memory usage.
///
/// `max` is the memory the process may use, `allocated` what it currently holds and
/// `free_of_allocated` the part of `allocated` that is reusable without growing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStatus {
    /// Upper bound of usable memory in bytes.
    pub max: u64,
    /// Bytes currently allocated.
    pub allocated: u64,
    /// Bytes of the allocation that are free.
    pub free_of_allocated: u64,
}

impl MemoryStatus {
    /// Bytes still available, inside and outside the current allocation.
    pub fn total_free(&self) -> u64 {
        self.max
            .saturating_sub(self.allocated)
            .saturating_add(self.free_of_allocated)
    }

    /// Free memory as a share of `max`.
    pub fn free_ratio(&self) -> f64 {
        if self.max == 0 {
            return 1.0;
        }
        self.total_free() as f64 / self.max as f64
    }

    /// Bytes that must be released to reach `target_ratio` free. Zero or negative when healthy.
    fn deficit(&self, target_ratio: f64) -> i128 {
        let required = (self.max as f64 * target_ratio) as i128;
        required - self.total_free() as i128
    }
}

/// Source of memory usage samples.
pub trait MemoryProbe: fmt::Debug + Send + Sync + 'static {
    /// Takes a fresh sample.
    fn sample(&self) -> MemoryStatus;
}

/// A [`MemoryProbe`] reading process and system memory through `sysinfo`.
///
/// With a memory limit the process resident size is measured against it. Without one, system
/// wide usage is measured against total system memory.
#[derive(derive_more::Debug)]
pub struct SystemMemoryProbe {
    #[debug("System")]
    system: Mutex<System>,
    pid: Option<Pid>,
    limit: Option<u64>,
}

impl SystemMemoryProbe {
    /// Creates a probe, optionally bounded to `limit` bytes for this process.
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
            limit,
        }
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn sample(&self) -> MemoryStatus {
        let mut system = self.system.lock();
        system.refresh_memory();
        match (self.limit, self.pid) {
            (Some(limit), Some(pid)) => {
                system.refresh_process(pid);
                let resident = system.process(pid).map(|p| p.memory()).unwrap_or_default();
                let available = system.available_memory();
                MemoryStatus {
                    max: limit,
                    // never report more headroom than the machine has left
                    allocated: resident.max(limit.saturating_sub(available)),
                    free_of_allocated: 0,
                }
            }
            _ => {
                let total = system.total_memory();
                MemoryStatus {
                    max: total,
                    allocated: total.saturating_sub(system.available_memory()),
                    free_of_allocated: 0,
                }
            }
        }
    }
}

/// Estimated memory held by one cache entry.
pub fn estimated_cost(curl: &str, document: &str) -> u64 {
    2 * (curl.len() as u64 + document.len() as u64) + ENTRY_OVERHEAD
}

/// Maps canonical curls to serialized documents.
#[derive(Debug)]
pub struct DocumentCache {
    entries: Mutex<LruCache<String, Arc<str>>>,
    probe: Arc<dyn MemoryProbe>,
    target_free_ratio: f64,
    metrics: Arc<Metrics>,
}

impl DocumentCache {
    /// Creates an empty cache.
    pub fn new(probe: Arc<dyn MemoryProbe>, target_free_ratio: f64, metrics: Arc<Metrics>) -> Self {
        Self {
            entries: Mutex::new(LruCache::unbounded()),
            probe,
            target_free_ratio,
            metrics,
        }
    }

    /// Returns the document for `curl` and makes it the most recent entry.
    pub fn get(&self, curl: &str) -> Option<Arc<str>> {
        let document = self.entries.lock().get(curl).cloned();
        match document {
            Some(document) => {
                self.metrics.cache_hits.inc();
                debug!("XML record '{curl}' retrieved from cache");
                Some(document)
            }
            None => {
                self.metrics.cache_misses.inc();
                None
            }
        }
    }

    /// Returns the document for `curl` without touching recency or hit counters.
    pub(crate) fn peek(&self, curl: &str) -> Option<Arc<str>> {
        self.entries.lock().peek(curl).cloned()
    }

    /// Runs an eviction check, then stores `document` as the most recent entry.
    pub fn put(&self, curl: impl Into<String>, document: impl Into<Arc<str>>) {
        let curl = curl.into();
        let mut entries = self.entries.lock();
        self.evict_locked(&mut entries);
        debug!("XML record '{curl}' put to cache");
        entries.put(curl, document.into());
    }

    /// Drops the entry for `curl`.
    pub fn remove(&self, curl: &str) -> bool {
        self.entries.lock().pop(curl).is_some()
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of cached documents.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache holds no documents.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Cached curls, oldest first.
    pub fn curls(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .rev()
            .map(|(curl, _)| curl.clone())
            .collect()
    }

    /// Evicts the oldest entries if free memory is below the target ratio.
    ///
    /// Returns the number of evicted entries.
    pub fn check(&self) -> usize {
        let mut entries = self.entries.lock();
        self.evict_locked(&mut entries)
    }

    fn evict_locked(&self, entries: &mut LruCache<String, Arc<str>>) -> usize {
        let before = self.probe.sample();
        let deficit = before.deficit(self.target_free_ratio);
        if deficit <= 0 || entries.is_empty() {
            trace!("memory status: {:.1}% free", before.free_ratio() * 100.0);
            return 0;
        }

        debug!(
            "low memory: {:.1}% free, cleaning cache",
            before.free_ratio() * 100.0
        );
        let mut estimated: i128 = 0;
        let mut evicted = 0;
        while estimated < deficit {
            let Some((curl, document)) = entries.pop_lru() else {
                break;
            };
            estimated += estimated_cost(&curl, &document) as i128;
            evicted += 1;
            trace!("XML record '{curl}' removed from cache");
        }
        self.metrics.cache_evictions.inc_by(evicted as u64);

        let after = self.probe.sample();
        debug!(
            "free memory after cache cleanup: {:.1}% (measured {} bytes, estimated {estimated} bytes)",
            after.free_ratio() * 100.0,
            after.total_free() as i128 - before.total_free() as i128,
        );
        evicted
    }
}

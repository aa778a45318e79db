//! Throttling of repeated log messages.

use std::{num::NonZeroUsize, time::Duration};

use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;

/// Default length of the throttle window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(10);

/// Default number of distinct keys tracked at once.
pub const DEFAULT_MAX_TRACKED: usize = 100;

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Coalesces repeated events per key into one report per time window.
///
/// The first event of a key is reported immediately and opens a window. Events inside the
/// window are only counted. The first event after the window closes is reported with the
/// number of events the closed window saw, and opens the next window. When more than
/// `max_tracked` keys are live, the least recently seen key is forgotten.
#[derive(Debug)]
pub struct RepeatGuard {
    window: Duration,
    entries: Mutex<LruCache<String, Window>>,
}

impl RepeatGuard {
    /// Creates a guard. A `max_tracked` of zero tracks a single key.
    pub fn new(window: Duration, max_tracked: usize) -> Self {
        let capacity = NonZeroUsize::new(max_tracked).unwrap_or(NonZeroUsize::MIN);
        Self {
            window,
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Records an event for `key`.
    ///
    /// Returns the count to report if the event should be logged now, `None` if it is
    /// suppressed.
    pub fn check(&self, key: &str) -> Option<u32> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(window) if now.duration_since(window.started) < self.window => {
                window.count = window.count.saturating_add(1);
                None
            }
            Some(window) => {
                let count = window.count;
                *window = Window {
                    started: now,
                    count: 1,
                };
                Some(count)
            }
            None => {
                entries.put(
                    key.to_string(),
                    Window {
                        started: now,
                        count: 1,
                    },
                );
                Some(1)
            }
        }
    }

    /// Number of keys currently tracked.
    pub fn tracked(&self) -> usize {
        self.entries.lock().len()
    }
}

impl Default for RepeatGuard {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_MAX_TRACKED)
    }
}

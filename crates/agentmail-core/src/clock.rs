//! Time source abstraction.
//!
//! Every timestamp in the system (`created_at`, `sent_at`, `next_try_at`,
//! `last_seen`) comes from a single [`Clock`] per process, in unix
//! milliseconds. Handing the clock to components explicitly lets tests drive
//! the router's backoff schedule deterministically with [`ManualClock`].

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A source of unix-millisecond timestamps.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time as unix milliseconds.
    fn now_millis(&self) -> i64;
}

/// Shared clock handle passed through the node context.
pub type SharedClock = Arc<dyn Clock>;

/// Wall-clock time from the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Create a clock pinned at the given unix-millisecond instant.
    pub fn at(now: i64) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    /// Advance the clock by `delta` milliseconds.
    pub fn advance(&self, delta: i64) {
        self.now.fetch_add(delta, Ordering::SeqCst);
    }

    /// Set the clock to an absolute instant.
    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

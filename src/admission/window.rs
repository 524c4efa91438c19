//! Fixed time windows and clocks.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Identifies one fixed time bucket: `floor(now / window_duration)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowIndex(pub u64);

impl WindowIndex {
    /// The raw bucket number.
    pub fn value(self) -> u64 {
        self.0
    }

    /// The index `n` windows earlier, saturating at zero.
    pub fn saturating_sub(self, n: u64) -> Self {
        WindowIndex(self.0.saturating_sub(n))
    }
}

impl fmt::Display for WindowIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Geometry of a fixed window of non-zero width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedWindow {
    duration_ms: u64,
}

impl FixedWindow {
    /// Create a window of the given width. Returns `None` for a zero width.
    pub fn from_millis(duration_ms: u64) -> Option<Self> {
        (duration_ms > 0).then_some(Self { duration_ms })
    }

    /// Get the duration of this window.
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// The window containing `now`.
    pub fn index(&self, now: Timestamp) -> WindowIndex {
        WindowIndex(now / self.duration_ms)
    }

    /// The first instant of a window.
    pub fn start(&self, window: WindowIndex) -> Timestamp {
        window.0.saturating_mul(self.duration_ms)
    }

    /// Time left until `window` closes, measured from `now`.
    ///
    /// Zero when `now` is already past the end of the window.
    pub fn duration_until_reset(&self, window: WindowIndex, now: Timestamp) -> Duration {
        let end = self.start(window).saturating_add(self.duration_ms);
        Duration::from_millis(end.saturating_sub(now))
    }
}

/// How the controller reacts to a clock that moves backwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockPolicy {
    /// Recompute the window from every timestamp as given.
    ///
    /// A late request for an evicted window starts a fresh counter there,
    /// which the next sweep removes again.
    #[default]
    Recompute,
    /// Never let the window index decrease; a late timestamp is counted in
    /// the newest window seen so far.
    Monotonic,
}

/// Source of the current time for admission decisions.
pub trait Clock: Send + Sync + 'static {
    /// Current time in milliseconds since the Unix epoch.
    fn now(&self) -> Timestamp;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        // Pre-epoch clocks clamp to zero.
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a clock frozen at `now`.
    pub fn new(now: Timestamp) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(now)),
        }
    }

    /// Jump to an absolute time, forwards or backwards.
    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

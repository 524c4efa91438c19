//! Core admission controller implementation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::http::Request;
use tracing::{debug, trace};

use super::key::{ClientKey, KeyExtractor, KeySource};
use super::store::{CounterStore, SweepReport};
use super::window::{ClockPolicy, FixedWindow, Timestamp, WindowIndex};
use crate::config::AdmissionSettings;
use crate::error::Result;

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Forward the request to the application.
    Admitted,
    /// Answer "too many requests" without forwarding.
    Rejected,
}

impl Decision {
    /// Whether the request may proceed.
    pub fn is_admitted(self) -> bool {
        self == Decision::Admitted
    }
}

/// A decision together with the counter state that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionStatus {
    /// The decision
    pub decision: Decision,
    /// Key the request was charged to
    pub key: ClientKey,
    /// Window the request was counted in
    pub window: WindowIndex,
    /// Count for (key, window) including this request
    pub count: u64,
    /// Configured quota per window
    pub limit: u64,
    /// Requests still admissible in this window
    pub remaining: u64,
    /// Time until the window closes
    pub reset_after: Duration,
}

/// Fixed-window admission controller.
///
/// Every call to [`check_key`](Self::check_key) increments the counter for
/// the caller's key in the current window, rejected requests included, and
/// rejects once the count exceeds the limit. A client can therefore see up to
/// `2 × limit` admissions across a window boundary, and with `n` independent
/// processes the effective limit is `n × limit`.
///
/// The controller is thread-safe and meant to be shared behind an `Arc`.
pub struct AdmissionController<K: KeyExtractor = KeySource> {
    settings: AdmissionSettings,
    window: FixedWindow,
    extractor: K,
    store: CounterStore,
    /// Newest window seen, for [`ClockPolicy::Monotonic`]
    high_water: AtomicU64,
}

impl AdmissionController<KeySource> {
    /// Create a controller keyed by the configured [`KeySource`].
    pub fn from_settings(settings: AdmissionSettings) -> Result<Self> {
        let extractor = settings.key_source.clone();
        Self::new(settings, extractor)
    }
}

impl<K: KeyExtractor> AdmissionController<K> {
    /// Create a controller with a custom key extractor.
    ///
    /// Fails if the settings are invalid; nothing is validated per request.
    pub fn new(settings: AdmissionSettings, extractor: K) -> Result<Self> {
        let window = settings.validate()?;

        debug!(
            limit = settings.limit,
            window_ms = settings.window_duration_ms,
            retention = settings.retention_windows,
            clock_policy = ?settings.clock_policy,
            "Creating admission controller"
        );

        Ok(Self {
            settings,
            window,
            extractor,
            store: CounterStore::new(),
            high_water: AtomicU64::new(0),
        })
    }

    /// Decide whether to admit `request` arriving at `now`.
    pub fn admit<B>(&self, request: &Request<B>, now: Timestamp) -> Decision {
        self.check(request, now).decision
    }

    /// Like [`admit`](Self::admit), returning the counter state as well.
    ///
    /// A request whose key cannot be extracted is charged to
    /// [`ClientKey::fallback`].
    pub fn check<B>(&self, request: &Request<B>, now: Timestamp) -> AdmissionStatus {
        let key = self
            .extractor
            .extract(request)
            .unwrap_or_else(ClientKey::fallback);
        if key.is_fallback() {
            trace!(uri = %request.uri(), "No client key, charging the shared fallback");
        }
        self.check_key(&key, now)
    }

    /// Count one request for `key` at `now` and decide on it.
    pub fn check_key(&self, key: &ClientKey, now: Timestamp) -> AdmissionStatus {
        let window = self.advance_window(now);
        let limit = self.settings.limit;
        let count = self.store.increment(key, window);

        trace!(key = %key, window = %window, count = count, "Checking admission");

        let decision = if count > limit {
            debug!(key = %key, window = %window, count = count, limit = limit, "Admission limit exceeded");
            Decision::Rejected
        } else {
            Decision::Admitted
        };

        self.sweep_inline(window);

        AdmissionStatus {
            decision,
            key: key.clone(),
            window,
            count,
            limit,
            remaining: limit.saturating_sub(count),
            reset_after: self.window.duration_until_reset(window, now),
        }
    }

    /// Evict every counter older than the retention horizon at `now`.
    pub fn sweep(&self, now: Timestamp) -> SweepReport {
        let cutoff = self
            .advance_window(now)
            .saturating_sub(self.settings.retention_windows);
        let report = self.store.evict_before(cutoff, usize::MAX);

        if report.evicted > 0 {
            debug!(cutoff = %cutoff, evicted = report.evicted, remaining = self.store.len(), "Swept admission counters");
        }
        report
    }

    /// Current count for `key` in the window containing `now`, if any.
    pub fn count_for(&self, key: &ClientKey, now: Timestamp) -> Option<u64> {
        self.store.get(key, self.peek_window(now))
    }

    /// Number of live counters.
    pub fn counter_count(&self) -> usize {
        self.store.len()
    }

    /// Drop all counters, restoring every client's full quota.
    pub fn clear(&self) {
        self.store.clear();
    }

    /// The settings this controller was built with.
    pub fn settings(&self) -> &AdmissionSettings {
        &self.settings
    }

    /// Window a request at `now` is counted in, recording it as seen.
    fn advance_window(&self, now: Timestamp) -> WindowIndex {
        let computed = self.window.index(now);
        match self.settings.clock_policy {
            ClockPolicy::Recompute => computed,
            ClockPolicy::Monotonic => {
                let previous = self.high_water.fetch_max(computed.0, Ordering::SeqCst);
                WindowIndex(previous.max(computed.0))
            }
        }
    }

    /// Like [`advance_window`](Self::advance_window) without side effects.
    fn peek_window(&self, now: Timestamp) -> WindowIndex {
        let computed = self.window.index(now);
        match self.settings.clock_policy {
            ClockPolicy::Recompute => computed,
            ClockPolicy::Monotonic => {
                WindowIndex(self.high_water.load(Ordering::SeqCst).max(computed.0))
            }
        }
    }

    /// Bounded eviction on the request path; skipped if a sweep is running.
    fn sweep_inline(&self, window: WindowIndex) {
        let cutoff = window.saturating_sub(self.settings.retention_windows);
        if let Some(report) = self.store.try_evict_before(cutoff, self.settings.sweep_batch) {
            trace!(
                cutoff = %cutoff,
                evicted = report.evicted,
                pending = report.pending,
                "Inline sweep"
            );
        }
    }
}

use crate::stats::CapacityStats;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;

/// How the background flusher's wait in spec §4.C step 1 ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WakeCause {
    /// `signal()` woke the condition before the timeout elapsed.
    Signalled,
    /// The 100ms wait elapsed with no signal.
    Timeout,
}

/// The shared state connecting the throttle hot path (spec §4.B step 3) to
/// the background flusher (spec §4.C) and the `capacity_signal()` API (spec
/// §4.D): `capacity_written`, `capacity_threshold`, `capacity_signalled`, and
/// the condition itself. Bundling these together (rather than splitting them
/// across the throttle and lifecycle manager) is this crate's answer to the
/// design note in spec §9 ("the throttle owns the condition... the
/// connection holds the throttle by value or by unique ownership").
#[derive(Debug)]
pub struct FlushSignal {
    written: AtomicU64,
    threshold: AtomicU64,
    signalled: AtomicBool,
    notify: Notify,
    stats: Arc<CapacityStats>,
}

impl FlushSignal {
    /// Constructs a signal with the given flush threshold and a shared stats
    /// block.
    #[must_use]
    pub fn new(threshold: u64, stats: Arc<CapacityStats>) -> Self {
        stats.set_threshold(threshold);
        Self {
            written: AtomicU64::new(0),
            threshold: AtomicU64::new(threshold),
            signalled: AtomicBool::new(false),
            notify: Notify::new(),
            stats,
        }
    }

    /// Updates the flush threshold on reconfigure (spec §4.D). Accumulated
    /// `capacity_written` is left untouched; only an actual flush cycle
    /// resets it (spec §3 invariant 3).
    pub fn set_threshold(&self, threshold: u64) {
        self.threshold.store(threshold, Ordering::Relaxed);
        self.stats.set_threshold(threshold);
    }

    /// Returns the current flush threshold.
    #[must_use]
    pub fn threshold(&self) -> u64 {
        self.threshold.load(Ordering::Relaxed)
    }

    /// Returns the current `capacity_written` value.
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }

    /// Records `bytes` written by a non-READ throttle call and hints the
    /// flusher (spec §4.B step 3, which re-enters the `capacity_signal()`
    /// logic of spec §4.D). Returns `true` if this call actually woke the
    /// condition.
    pub fn record_write(&self, bytes: u64) -> bool {
        self.written.fetch_add(bytes, Ordering::Release);
        self.stats.add_bytes_written(bytes);
        self.signal()
    }

    /// `capacity_signal()` (spec §4.D "Signal", spec §6 "Exposed to the
    /// engine"). Stats increment on every call; the condition wakes, and the
    /// wake-specific stats increment, only when this call is the one that
    /// transitions `capacity_signalled` from false to true.
    pub fn signal(&self) -> bool {
        self.stats.record_signal_call();

        if self.written.load(Ordering::Acquire) < self.threshold.load(Ordering::Relaxed) {
            return false;
        }

        if self
            .signalled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.stats.record_signalled();
            self.notify.notify_one();
            self.stats.record_signal_woken();
            true
        } else {
            false
        }
    }

    /// Publishes `capacity_signalled = false` with release semantics (spec
    /// §4.C step 3). The flusher calls this after waking, before deciding
    /// whether to flush, so that a `signal()` racing in after this point is
    /// guaranteed to observe `false` and may set it again.
    pub fn clear_signalled(&self) {
        self.signalled.store(false, Ordering::Release);
    }

    /// Resets `capacity_written` to zero after a successful flush cycle
    /// (spec §4.C step 4, §3 invariant 3).
    pub fn reset_written(&self) {
        self.written.store(0, Ordering::Release);
    }

    /// Wakes the condition immediately, independent of `capacity_written`
    /// and `capacity_signalled`. Used by shutdown (spec §4.D "destroy": wake
    /// the condition) so the flusher observes a cleared run flag without
    /// waiting out the full 100ms timeout.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Waits on the condition with a 100ms timeout (spec §4.C step 1),
    /// returning which of the two ways the wait ended.
    pub async fn wait(&self) -> WakeCause {
        match timeout(Duration::from_millis(100), self.notify.notified()).await {
            Ok(()) => WakeCause::Signalled,
            Err(_elapsed) => {
                self.stats.record_timeout();
                WakeCause::Timeout
            }
        }
    }
}

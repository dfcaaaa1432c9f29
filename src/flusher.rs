use crate::error::FlusherFatalError;
use crate::signal::FlushSignal;
use crate::stats::CapacityStats;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// The background flusher's collaborator for actually persisting data (spec
/// §4.C "invoke the background fsync collaborator", §6 "Exposed to the
/// storage layer: `fsync_all_background(session) -> status`").
///
/// This crate has no opinion on what "fsync" means to the embedding storage
/// engine — a real file descriptor, a write-ahead log segment, a remote
/// object store upload — so it is expressed as a trait rather than a
/// concrete syscall wrapper.
#[async_trait::async_trait]
pub trait AsyncFsync: Send + Sync {
    /// Flushes everything accumulated since the last successful call.
    /// Returning `Err` is treated as fatal (spec §4.C "on fatal fsync error
    /// the task panics the connection"; see [`FlusherFatalError`] for how
    /// this crate surfaces that instead of aborting the process itself).
    async fn fsync_all_background(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Runs the background flusher loop (spec §4.C) until `keep_running` is
/// cleared.
///
/// Each iteration: wait on `signal` for up to 100ms, then — regardless of
/// whether the wait was satisfied by a signal or the timeout — clear
/// `capacity_signalled` and check whether `capacity_written` has crossed the
/// flush threshold. If so, invoke `fsync` and reset the accumulator on
/// success; otherwise record a `fsync_notyet` and loop. A fatal fsync error
/// is stored on `fatal_slot` and ends the loop (spec §4.C "panics the
/// connection" — see [`FlusherFatalError`]'s doc comment for why this crate
/// stores the error rather than aborting).
pub(crate) async fn run_loop(
    signal: Arc<FlushSignal>,
    stats: Arc<CapacityStats>,
    fsync: Arc<dyn AsyncFsync>,
    keep_running: Arc<AtomicBool>,
    fatal_slot: Arc<std::sync::Mutex<Option<FlusherFatalError>>>,
) {
    while keep_running.load(Ordering::Acquire) {
        let cause = signal.wait().await;
        if !keep_running.load(Ordering::Acquire) {
            break;
        }

        tracing::trace!(?cause, "capacity flusher woke");
        signal.clear_signalled();

        // Spec §4.C step 4 requires a strict `>` before flushing — at
        // `written == threshold` exactly, step 5 applies instead. This is
        // deliberately stricter than `signal()`'s `>=` trigger (spec §4.D).
        if signal.written() <= signal.threshold() {
            stats.record_fsync_notyet();
            continue;
        }

        match fsync.fsync_all_background().await {
            Ok(()) => {
                signal.reset_written();
                tracing::trace!("capacity flusher cycle completed");
            }
            Err(err) => {
                tracing::error!(error = %err, "capacity flusher fsync failed fatally");
                *fatal_slot.lock().unwrap_or_else(|e| e.into_inner()) =
                    Some(FlusherFatalError(err));
                break;
            }
        }
    }
}

#[cfg(any(test, feature = "test-support"))]
pub use test_support::{FakeFsync, SlowFsync};

#[cfg(any(test, feature = "test-support"))]
mod test_support {
    use super::AsyncFsync;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Test-double [`AsyncFsync`] collaborator that counts invocations
    /// instead of touching storage, optionally returning a canned error to
    /// exercise the flusher's fatal path.
    #[derive(Debug, Default)]
    pub struct FakeFsync {
        calls: AtomicUsize,
        fail: std::sync::atomic::AtomicBool,
    }

    impl FakeFsync {
        /// Constructs a fsync double that always succeeds.
        #[must_use]
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Constructs a fsync double whose calls always fail.
        #[must_use]
        pub fn failing() -> Arc<Self> {
            let fsync = Self::default();
            fsync.fail.store(true, Ordering::Relaxed);
            Arc::new(fsync)
        }

        /// Returns the number of completed `fsync_all_background` calls.
        #[must_use]
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::Acquire)
        }
    }

    #[async_trait::async_trait]
    impl AsyncFsync for FakeFsync {
        async fn fsync_all_background(
            &self,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.calls.fetch_add(1, Ordering::AcqRel);
            if self.fail.load(Ordering::Relaxed) {
                return Err("fake fsync failure".into());
            }
            Ok(())
        }
    }

    /// Test-double [`AsyncFsync`] collaborator that sleeps for a fixed
    /// duration before returning success, for exercising shutdown while a
    /// flush is in flight.
    #[derive(Debug)]
    pub struct SlowFsync {
        calls: AtomicUsize,
        delay: Duration,
    }

    impl SlowFsync {
        /// Constructs a fsync double whose calls take `delay` to complete.
        #[must_use]
        pub fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
            })
        }

        /// Returns the number of completed `fsync_all_background` calls.
        #[must_use]
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::Acquire)
        }
    }

    #[async_trait::async_trait]
    impl AsyncFsync for SlowFsync {
        async fn fsync_all_background(
            &self,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            tokio::time::sleep(self.delay).await;
            self.calls.fetch_add(1, Ordering::AcqRel);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::FakeFsync;
    use super::*;
    use std::time::Duration;

    fn harness(threshold: u64) -> (Arc<FlushSignal>, Arc<CapacityStats>, Arc<AtomicBool>) {
        let stats = Arc::new(CapacityStats::new());
        let signal = Arc::new(FlushSignal::new(threshold, Arc::clone(&stats)));
        let run = Arc::new(AtomicBool::new(true));
        (signal, stats, run)
    }

    #[tokio::test]
    async fn flusher_fsyncs_after_signal_and_resets_written() {
        let (signal, stats, keep_running) = harness(100);
        let fsync = FakeFsync::new();
        let fatal = Arc::new(std::sync::Mutex::new(None));

        let handle = tokio::spawn(run_loop(
            Arc::clone(&signal),
            Arc::clone(&stats),
            fsync.clone() as Arc<dyn AsyncFsync>,
            Arc::clone(&keep_running),
            Arc::clone(&fatal),
        ));

        signal.record_write(100);
        tokio::time::sleep(Duration::from_millis(10)).await;

        keep_running.store(false, Ordering::Release);
        signal.clear_signalled();
        // Nudge the loop past its wait so it observes the cleared flag
        // promptly rather than waiting out the full 100ms timeout.
        let _ = tokio::time::timeout(Duration::from_millis(150), handle).await;

        assert_eq!(fsync.calls(), 1);
        assert_eq!(signal.written(), 0);
        assert!(fatal.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn flusher_times_out_quietly_below_threshold() {
        let (signal, stats, keep_running) = harness(1_000_000);
        let fsync = FakeFsync::new();
        let fatal = Arc::new(std::sync::Mutex::new(None));

        let handle = tokio::spawn(run_loop(
            Arc::clone(&signal),
            Arc::clone(&stats),
            fsync.clone() as Arc<dyn AsyncFsync>,
            Arc::clone(&keep_running),
            Arc::clone(&fatal),
        ));

        signal.record_write(10);
        tokio::time::sleep(Duration::from_millis(150)).await;
        keep_running.store(false, Ordering::Release);
        signal.clear_signalled();
        let _ = tokio::time::timeout(Duration::from_millis(200), handle).await;

        assert_eq!(fsync.calls(), 0);
        assert!(stats.fsync_notyet() >= 1);
    }

    // Spec §4.C step 4's trigger is a strict `>`, distinct from `signal()`'s
    // `>=` (spec §4.D): at `written == threshold` exactly, the flusher wakes
    // (signal() already fired) but must take the fsync-not-yet path, not flush.
    #[tokio::test]
    async fn flusher_skips_flush_when_written_equals_threshold_exactly() {
        let (signal, stats, keep_running) = harness(100);
        let fsync = FakeFsync::new();
        let fatal = Arc::new(std::sync::Mutex::new(None));

        let handle = tokio::spawn(run_loop(
            Arc::clone(&signal),
            Arc::clone(&stats),
            fsync.clone() as Arc<dyn AsyncFsync>,
            Arc::clone(&keep_running),
            Arc::clone(&fatal),
        ));

        assert!(signal.record_write(100));
        tokio::time::sleep(Duration::from_millis(10)).await;

        keep_running.store(false, Ordering::Release);
        signal.clear_signalled();
        let _ = tokio::time::timeout(Duration::from_millis(150), handle).await;

        assert_eq!(fsync.calls(), 0);
        assert_eq!(signal.written(), 100);
        assert!(stats.fsync_notyet() >= 1);
    }

    #[tokio::test]
    async fn fatal_fsync_error_is_captured_and_stops_the_loop() {
        let (signal, stats, keep_running) = harness(10);
        let fsync = FakeFsync::failing();
        let fatal = Arc::new(std::sync::Mutex::new(None));

        let handle = tokio::spawn(run_loop(
            Arc::clone(&signal),
            Arc::clone(&stats),
            fsync.clone() as Arc<dyn AsyncFsync>,
            Arc::clone(&keep_running),
            Arc::clone(&fatal),
        ));

        signal.record_write(10);
        let _ = tokio::time::timeout(Duration::from_millis(200), handle).await;

        assert!(fatal.lock().unwrap().is_some());
    }
}

use crate::class::Class;
use crate::clock::{SystemWallClock, WallClock};
use crate::config::CapacityConfig;
use crate::error::{FlusherFatalError, StartError};
use crate::flusher::{self, AsyncFsync};
use crate::signal::FlushSignal;
use crate::sleep::{Sleeper, SystemSleeper};
use crate::stats::CapacityStats;
use crate::throttle::Throttle;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Owns one storage-engine connection's throttle state end to end (spec §4.D
/// "Lifecycle"): the [`Throttle`] itself, the shared [`FlushSignal`], and the
/// background flusher task when one is running. Mirrors the design note in
/// spec §9 ("the connection holds the throttle by value or by unique
/// ownership") by making `CapacityServer` the single owner other code talks
/// to, rather than wiring `Throttle` and the flusher task together by hand at
/// every call site.
pub struct CapacityServer {
    throttle: Arc<Throttle>,
    signal: Arc<FlushSignal>,
    stats: Arc<CapacityStats>,
    fsync: Arc<dyn AsyncFsync>,
    flusher: Mutex<Option<RunningFlusher>>,
    readonly: bool,
}

struct RunningFlusher {
    keep_running: Arc<AtomicBool>,
    fatal: Arc<Mutex<Option<FlusherFatalError>>>,
    handle: JoinHandle<()>,
}

impl CapacityServer {
    /// Creates a server for a read-write connection, binding `config` and
    /// starting the background flusher if the configuration needs one (spec
    /// §4.D "create"). `fsync` is the storage layer's background-fsync
    /// collaborator (spec §6).
    ///
    /// # Errors
    ///
    /// Returns [`StartError`] if the flusher needs to start but no `tokio`
    /// runtime is available to spawn it on (spec §7 "Resource allocation").
    /// On error the server is not constructed at all, so there is no
    /// half-initialised flusher to clean up (spec §7 "guarantees no
    /// half-initialised flusher on failure").
    pub fn create(config: CapacityConfig, fsync: Arc<dyn AsyncFsync>) -> Result<Self, StartError> {
        Self::new(config, fsync, false)
    }

    /// Creates a server for a read-only connection. Per spec §4.D, read-only
    /// connections never run a flusher regardless of the bound threshold;
    /// [`CapacityServer::reconfigure`] on a read-only server is a no-op, so
    /// this constructor never fails on account of the flusher.
    #[must_use]
    pub fn create_readonly(config: CapacityConfig, fsync: Arc<dyn AsyncFsync>) -> Self {
        Self::new(config, fsync, true)
            .expect("read-only servers never start a flusher and cannot fail to start one")
    }

    fn new(
        config: CapacityConfig,
        fsync: Arc<dyn AsyncFsync>,
        readonly: bool,
    ) -> Result<Self, StartError> {
        let stats = Arc::new(CapacityStats::new());
        let signal = Arc::new(FlushSignal::new(config.threshold(), Arc::clone(&stats)));
        let throttle = Arc::new(Throttle::new(config, Arc::clone(&stats), Arc::clone(&signal)));

        let server = Self {
            throttle,
            signal,
            stats,
            fsync,
            flusher: Mutex::new(None),
            readonly,
        };

        if !readonly && config.needs_flusher() {
            server.start_flusher()?;
        }

        Ok(server)
    }

    /// Constructs a server with injected clock and sleep implementations,
    /// for deterministic tests (spec §9 "Sleep abstraction").
    ///
    /// # Errors
    ///
    /// See [`CapacityServer::create`].
    pub fn with_clock_and_sleeper(
        config: CapacityConfig,
        fsync: Arc<dyn AsyncFsync>,
        readonly: bool,
        clock: Arc<dyn WallClock>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Result<Self, StartError> {
        let stats = Arc::new(CapacityStats::new());
        let signal = Arc::new(FlushSignal::new(config.threshold(), Arc::clone(&stats)));
        let throttle = Arc::new(Throttle::with_clock_and_sleeper(
            config,
            Arc::clone(&stats),
            Arc::clone(&signal),
            clock,
            sleeper,
        ));

        let server = Self {
            throttle,
            signal,
            stats,
            fsync,
            flusher: Mutex::new(None),
            readonly,
        };

        if !readonly && config.needs_flusher() {
            server.start_flusher()?;
        }

        Ok(server)
    }

    /// Returns the shared throttle this server owns.
    #[must_use]
    pub fn throttle(&self) -> &Arc<Throttle> {
        &self.throttle
    }

    /// Returns the shared stats block this server publishes counters to.
    #[must_use]
    pub fn stats(&self) -> &Arc<CapacityStats> {
        &self.stats
    }

    /// Rebinds the throttle to a new configuration, bouncing the background
    /// flusher (spec §4.D "reconfigure": destroy any running flusher,
    /// re-derive capacities, start a new flusher iff the new configuration
    /// needs one). A no-op on a read-only server.
    ///
    /// Stops the old flusher the same cooperative way [`CapacityServer::destroy`]
    /// does, joining its task rather than cancelling it mid-flush, before
    /// starting the replacement.
    ///
    /// # Errors
    ///
    /// See [`CapacityServer::create`]. On error the old flusher has already
    /// been stopped (matching "destroy any running flusher to present a
    /// blank slate to configuration" from spec §4.D), so the server is left
    /// in the same unflushed state a fresh uncapped connection would be in,
    /// never a half-started one.
    pub async fn reconfigure(&self, config: CapacityConfig) -> Result<(), StartError> {
        if self.readonly {
            return Ok(());
        }

        self.stop_flusher().await;
        self.throttle.configure(config);
        self.signal.set_threshold(config.threshold());

        if config.needs_flusher() {
            self.start_flusher()?;
        }

        Ok(())
    }

    /// Forwards to [`FlushSignal::signal`] (spec §4.D "Signal", spec §6
    /// "Exposed to the engine: `capacity_signal()`").
    pub fn signal(&self) -> bool {
        self.signal.signal()
    }

    /// Stops the background flusher and releases its task, idempotently
    /// (spec §4.D "destroy": clear the run flag, wake the condition, join
    /// the task). Safe to call on a server with no flusher running.
    ///
    /// Joining lets an in-flight `fsync_all_background` finish rather than
    /// cutting it off (spec §5's cooperative-cancellation model: "the
    /// flusher observes the run flag once per wakeup"); the task is only
    /// force-cancelled if it fails to exit within a short grace period of
    /// being asked to.
    pub async fn destroy(&self) {
        self.stop_flusher().await;
    }

    /// Takes the fatal fsync error recorded by the background flusher, if
    /// one occurred (spec §4.C "panics the connection" — see
    /// [`FlusherFatalError`]'s doc comment for why this crate stores the
    /// error here instead of aborting the process).
    pub fn take_fatal_error(&self) -> Option<FlusherFatalError> {
        self.flusher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(|running| running.fatal.lock().unwrap_or_else(|e| e.into_inner()).take())
    }

    fn start_flusher(&self) -> Result<(), StartError> {
        let mut slot = self.flusher.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Ok(());
        }

        let rt = Handle::try_current().map_err(|_| StartError::NoRuntime)?;

        let keep_running = Arc::new(AtomicBool::new(true));
        let fatal = Arc::new(Mutex::new(None));
        let handle = rt.spawn(flusher::run_loop(
            Arc::clone(&self.signal),
            Arc::clone(&self.stats),
            Arc::clone(&self.fsync),
            Arc::clone(&keep_running),
            Arc::clone(&fatal),
        ));

        *slot = Some(RunningFlusher {
            keep_running,
            fatal,
            handle,
        });

        Ok(())
    }

    /// Clears the run flag, wakes the condition, and joins the flusher task
    /// (spec §4.D "destroy"), giving it `SHUTDOWN_JOIN_TIMEOUT` to notice the
    /// cleared flag and exit on its own — including finishing any
    /// `fsync_all_background` call already in flight — before forcibly
    /// aborting it as a last resort.
    async fn stop_flusher(&self) {
        let running = self.flusher.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(running) = running {
            running.keep_running.store(false, Ordering::Release);
            // The flusher may be parked in its 100ms wait; clearing
            // `capacity_signalled` and waking the condition directly lets it
            // notice the cleared run flag without waiting out the timeout.
            self.signal.clear_signalled();
            self.signal.wake();

            let abort_handle = running.handle.abort_handle();
            if tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, running.handle)
                .await
                .is_err()
            {
                tracing::warn!("capacity flusher did not stop cooperatively; aborting");
                abort_handle.abort();
            }
        }
    }

    /// Best-effort, synchronous flusher teardown for [`Drop`]. `Drop::drop`
    /// cannot `.await`, so this cannot join the task the way
    /// [`CapacityServer::destroy`] does; it only asks the task to stop and
    /// aborts it immediately. Callers that need the cooperative, joined
    /// shutdown spec §4.D describes must call `destroy()` explicitly before
    /// the server is dropped.
    fn abort_flusher(&self) {
        let running = self.flusher.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(running) = running {
            running.keep_running.store(false, Ordering::Release);
            self.signal.clear_signalled();
            self.signal.wake();
            running.handle.abort();
        }
    }
}

/// Grace period [`CapacityServer::stop_flusher`] gives the flusher task to
/// exit cooperatively after the run flag is cleared, before it is forcibly
/// aborted. Generous relative to the 100ms condition timeout so an in-flight
/// `fsync_all_background` call has room to finish normally.
const SHUTDOWN_JOIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

impl Drop for CapacityServer {
    fn drop(&mut self) {
        self.abort_flusher();
    }
}

/// Convenience constructor for hosts that want the production clock and
/// sleeper without naming [`SystemWallClock`]/[`SystemSleeper`] themselves.
#[must_use]
pub fn production_throttle(
    config: CapacityConfig,
    stats: Arc<CapacityStats>,
    signal: Arc<FlushSignal>,
) -> Throttle {
    Throttle::with_clock_and_sleeper(
        config,
        stats,
        signal,
        Arc::new(SystemWallClock::new()),
        Arc::new(SystemSleeper),
    )
}

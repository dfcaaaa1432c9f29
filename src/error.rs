use thiserror::Error;

/// Errors surfaced by the configuration binder (spec §4.E, §7
/// "Configuration invalid").
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum ConfigError {
    /// `io_capacity.total` was non-zero but below [`crate::MIN_CAPACITY_BYTES_PER_SEC`].
    #[error(
        "io_capacity.total of {got} bytes/sec is below the minimum of {min} bytes/sec"
    )]
    BelowMinimum {
        /// The rejected value.
        got: u64,
        /// The minimum throughput constant that rejected it.
        min: u64,
    },
}

/// A resource allocation failure while starting the background flusher
/// (spec §7 "Resource allocation — session open, condition alloc, or thread
/// spawn failure: returned to caller").
///
/// This crate's flusher is a `tokio` task rather than a raw OS thread, so the
/// concrete failure mode is the absence of a `tokio` runtime to spawn it on;
/// a host embedding this crate outside an async context sees this error
/// instead of the panic `tokio::spawn` would otherwise raise.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum StartError {
    /// No `tokio` runtime was running on the calling thread, so the
    /// background flusher task could not be spawned.
    #[error("no tokio runtime is running; cannot start the background flusher")]
    NoRuntime,
}

/// The flusher's background-fsync collaborator returned an unrecoverable
/// error (spec §4.C "On fatal fsync error the task panics the connection",
/// §7 "Flusher fatal"). This crate does not abort the process on the
/// caller's behalf; instead the lifecycle manager surfaces this error the
/// next time it is polled via [`crate::CapacityServer::take_fatal_error`],
/// leaving the decision of how to treat a fatal storage error (panic, abort,
/// process exit) to the embedding engine.
#[derive(Debug, Error)]
#[error("background fsync failed fatally: {0}")]
pub struct FlusherFatalError(
    /// The underlying error returned by the `fsync_all_background` collaborator.
    #[source]
    pub Box<dyn std::error::Error + Send + Sync>,
);

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! Per-class I/O capacity throttle and background flusher.
//!
//! This crate paces checkpoint, eviction, log, and read I/O against
//! independently configurable byte-per-second ceilings, steals idle budget
//! between classes under contention, and runs a background task that keeps
//! accumulated writes flushed without blocking the hot path on every call.
//! It is the Rust-side collaborator for a storage engine's connection-scoped
//! capacity limiter; it does not implement storage, I/O, or configuration
//! parsing itself (see [`config::ConfigSource`] and [`flusher::AsyncFsync`]
//! for the two seams a host plugs into).
//!
//! # Layout
//!
//! - [`Class`] — the four workload tags this crate paces independently.
//! - [`CapacityConfig`] — binds a single `io_capacity.total` figure into
//!   per-class capacities and a flush threshold.
//! - [`Throttle`] — the hot-path pacing operation.
//! - [`CapacityServer`] — owns a throttle, its flush signal, and the
//!   background flusher task for one connection's lifetime.
//! - [`CapacityStats`] — the counters a host exposes under its own
//!   statistics namespace.

mod class;
mod clock;
mod config;
mod error;
mod flusher;
mod lifecycle;
mod signal;
mod sleep;
mod stats;
mod throttle;

pub use class::Class;
pub use clock::{SystemWallClock, WallClock};
pub use config::{CapacityConfig, ConfigSource, MIN_CAPACITY_BYTES_PER_SEC};
pub use error::{ConfigError, FlusherFatalError, StartError};
pub use flusher::AsyncFsync;
pub use lifecycle::{production_throttle, CapacityServer};
pub use signal::{FlushSignal, WakeCause};
pub use sleep::{Sleeper, SystemSleeper};
pub use stats::CapacityStats;
pub use throttle::{Throttle, MAX_THROTTLE_BYTES};

#[cfg(any(test, feature = "test-support"))]
pub use clock::FakeWallClock;
#[cfg(any(test, feature = "test-support"))]
pub use flusher::FakeFsync;
#[cfg(any(test, feature = "test-support"))]
pub use sleep::RecordingSleeper;

//! Crate-wide error taxonomy.
//!
//! Each component keeps its own narrow error enum (see `crawler::CrawlError`,
//! `fs_monitor::MonitorError`, `processing_pool::PoolError`) with manual
//! `Display`/`Error` impls, matching the teacher's `ScanError`/`WatcherError`/
//! `IndexStoreError` style. `MinerError` is the unifying kind used once those
//! errors cross a component boundary (spec §7).

use std::fmt;

/// The error kinds the core distinguishes, per spec §7.
#[derive(Debug)]
pub enum MinerError {
    /// An async operation was cancelled via its cancellation token. Never retried,
    /// never logged as a failure.
    Cancelled,
    /// An optional backend capability was invoked but is unsupported. Surfaced once.
    NotSupported(String),
    /// Per-directory/per-file I/O failure. Logged as a warning, the caller continues.
    TransientIo(String),
    /// Structurally invalid data (e.g. a truncated store row). The affected batch
    /// is abandoned; the crawler continues with the next root.
    Corruption(String),
    /// The caller tried to progress while paused.
    Paused,
    /// `resume()` was called with a cookie that doesn't match the active pause.
    InvalidCookie,
    /// `pause()` was called twice with the same `(application, reason)` pair.
    AlreadyPaused,
}

impl fmt::Display for MinerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MinerError::Cancelled => write!(f, "operation cancelled"),
            MinerError::NotSupported(what) => write!(f, "not supported: {what}"),
            MinerError::TransientIo(msg) => write!(f, "transient I/O error: {msg}"),
            MinerError::Corruption(msg) => write!(f, "corrupted data: {msg}"),
            MinerError::Paused => write!(f, "miner is paused"),
            MinerError::InvalidCookie => write!(f, "unrecognized pause cookie"),
            MinerError::AlreadyPaused => write!(f, "already paused for this (application, reason)"),
        }
    }
}

impl std::error::Error for MinerError {}

impl From<std::io::Error> for MinerError {
    fn from(err: std::io::Error) -> Self {
        MinerError::TransientIo(err.to_string())
    }
}

/// A cooperative cancellation token, shared between a driver and the async
/// operation it may need to cancel mid-flight.
///
/// Grounded on the teacher's `ScanHandle { progress, cancelled: Arc<AtomicBool> }`
/// pattern (`indexing/scanner.rs`), generalized into its own reusable type since
/// the crawler, the monitor, and the processing pool all need one.
#[derive(Clone, Default)]
pub struct CancelToken(std::sync::Arc<std::sync::atomic::AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::Relaxed)
    }
}

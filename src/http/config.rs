//! Stream configuration
//!
//! This module provides the knobs of the polling loop, the diagnostic
//! verbosity that gates trace capture, and the cooperative cancellation flag.

use super::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Longest single readiness wait
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(1);

/// Pause used when the session has no descriptors to wait on yet
pub const DEFAULT_IDLE_SLEEP: Duration = Duration::from_micros(100);

/// How long an upload waits for `100 Continue` before sending anyway
pub const DEFAULT_EXPECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Largest slice pulled from the upload buffer per chunk
pub const DEFAULT_UPLOAD_CHUNK: usize = 64 * 1024;

/// Diagnostic verbosity threshold
///
/// Ordered from most to least verbose. A threshold includes every level at
/// or above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Verbosity {
    Debug5,
    Debug4,
    Debug3,
    Debug2,
    Debug1,
    Log,
    Info,
    Notice,
    #[default]
    Warning,
    Error,
}

impl Verbosity {
    /// Parse a level name (case-insensitive)
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "debug5" => Ok(Verbosity::Debug5),
            "debug4" => Ok(Verbosity::Debug4),
            "debug3" => Ok(Verbosity::Debug3),
            "debug2" | "debug" => Ok(Verbosity::Debug2),
            "debug1" => Ok(Verbosity::Debug1),
            "log" => Ok(Verbosity::Log),
            "info" => Ok(Verbosity::Info),
            "notice" => Ok(Verbosity::Notice),
            "warning" => Ok(Verbosity::Warning),
            "error" => Ok(Verbosity::Error),
            _ => Err(Error::Setup(format!("unknown verbosity level: {}", s))),
        }
    }

    /// Check whether messages at `level` pass this threshold
    pub fn includes(&self, level: Verbosity) -> bool {
        level >= *self
    }
}

/// Cooperative cancellation flag shared with the host
///
/// The stream checks it once per loop iteration.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fail with `Error::Cancelled` once cancellation was requested
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Configuration for one `HttpStream`
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub max_wait: Duration,
    pub idle_sleep: Duration,
    pub expect_timeout: Duration,
    pub upload_chunk: usize,
    pub verbosity: Verbosity,
    pub cancel: CancelToken,
}

impl StreamConfig {
    /// Create a builder starting from the defaults
    pub fn builder() -> StreamConfigBuilder {
        StreamConfigBuilder::new()
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            max_wait: DEFAULT_MAX_WAIT,
            idle_sleep: DEFAULT_IDLE_SLEEP,
            expect_timeout: DEFAULT_EXPECT_TIMEOUT,
            upload_chunk: DEFAULT_UPLOAD_CHUNK,
            verbosity: Verbosity::default(),
            cancel: CancelToken::default(),
        }
    }
}

/// Builder for `StreamConfig`
#[derive(Debug, Default)]
pub struct StreamConfigBuilder {
    config: StreamConfig,
}

impl StreamConfigBuilder {
    /// Create a new builder with default settings
    pub fn new() -> Self {
        StreamConfigBuilder::default()
    }

    /// Set the longest single readiness wait
    pub fn max_wait(mut self, wait: Duration) -> Self {
        self.config.max_wait = wait;
        self
    }

    /// Set the pause used when nothing can be waited on
    pub fn idle_sleep(mut self, sleep: Duration) -> Self {
        self.config.idle_sleep = sleep;
        self
    }

    /// Set how long uploads wait for `100 Continue`
    pub fn expect_timeout(mut self, timeout: Duration) -> Self {
        self.config.expect_timeout = timeout;
        self
    }

    /// Set the largest upload chunk
    pub fn upload_chunk(mut self, size: usize) -> Self {
        self.config.upload_chunk = size.max(1);
        self
    }

    /// Set the diagnostic verbosity threshold
    pub fn verbosity(mut self, verbosity: Verbosity) -> Self {
        self.config.verbosity = verbosity;
        self
    }

    /// Share a cancellation flag with the stream
    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.config.cancel = token;
        self
    }

    /// Build the configuration
    pub fn build(self) -> StreamConfig {
        self.config
    }
}

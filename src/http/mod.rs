//! Streaming HTTP/1.1 transport
//!
//! This module provides the buffered, non-blocking client used to stream
//! table data to and from the remote service.
//!
//! # Architecture
//!
//! The transport is split the same way a multi-handle HTTP library is:
//!
//! - `Transfer` is one logical request (the transport handle). It owns the
//!   socket and the HTTP/1.1 state machine.
//! - `Session` multiplexes registered transfers. It exposes readiness
//!   descriptors, a poll wait and a non-blocking `perform` step.
//! - `HttpStream` is the driver. It owns one transfer, one session and two
//!   `ByteBuffer`s, and wires the buffers to the transfer through the
//!   `TransferHandler` trait.
//! - `response` turns completion results and HTTP status codes into errors.
//!
//! # Examples
//!
//! ```no_run
//! use tabstream::http::{Headers, HttpStream, StreamConfig};
//!
//! let mut headers = Headers::new();
//! headers.append("X-GP-USER", "gpadmin");
//! headers.append("Connection", "close");
//!
//! let mut stream = HttpStream::download(
//!     "http://127.0.0.1:5888/pxf/read",
//!     &headers,
//!     StreamConfig::default(),
//! ).unwrap();
//!
//! let mut buf = [0u8; 8192];
//! loop {
//!     let n = stream.read(&mut buf).unwrap();
//!     if n == 0 {
//!         stream.check_connectivity().unwrap();
//!         break;
//!     }
//!     // process &buf[..n]
//! }
//! stream.cleanup(false).unwrap();
//! ```

pub mod buffer;
pub mod chunked;
pub mod client;
pub mod config;
pub mod headers;
pub mod message;
pub mod parser;
pub mod response;
pub mod session;
pub mod transfer;
pub mod url;

pub use buffer::ByteBuffer;
pub use client::{Direction, DriverState, HttpStream};
pub use config::{CancelToken, StreamConfig, StreamConfigBuilder, Verbosity};
pub use headers::Headers;
pub use message::{Method, Status, Version};
pub use response::Diagnostic;
pub use session::{Completion, Interest, Perform, PollEvents, Session, TransferId};
pub use transfer::{Supply, Transfer, TransferCode, TransferError, TransferHandler};
pub use self::url::Endpoint;

/// Result type for HTTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP transport errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid HTTP version: {0}")]
    InvalidVersion(String),

    #[error("Invalid HTTP status: {0}")]
    InvalidStatus(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Session or transfer could not be created or configured
    #[error("internal error: {0}")]
    Setup(String),

    /// The transfer itself failed, independent of the HTTP status
    #[error("{0}")]
    Transfer(#[from] TransferError),

    /// The remote service answered with a status other than 100 or 200
    #[error("remote service error ({status}): {diagnostic}")]
    Status { status: u16, diagnostic: Diagnostic },

    /// The peer stopped taking data while upload bytes were still buffered
    #[error("failed sending to remote component {peer}")]
    PrematureClose { peer: String },

    #[error("canceling statement due to user request")]
    Cancelled,

    #[error("operation requires a {0} stream")]
    Direction(&'static str),
}

impl Error {
    /// Hint attached to a status error, if any
    pub fn hint(&self) -> Option<&str> {
        match self {
            Error::Status { diagnostic, .. } => diagnostic.hint.as_deref(),
            _ => None,
        }
    }

    /// Supplementary detail: the status error trace or the transport's
    /// diagnostic buffer
    pub fn detail(&self) -> Option<&str> {
        match self {
            Error::Status { diagnostic, .. } => diagnostic.trace.as_deref(),
            Error::Transfer(err) => err.detail.as_deref(),
            _ => None,
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(err) => err,
            other => std::io::Error::other(other),
        }
    }
}

/// Default HTTP port
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// CRLF line ending
pub const CRLF: &str = "\r\n";

/// Extra room added every time a buffer has to be reallocated
pub const BUFFER_SLACK: usize = 1024;

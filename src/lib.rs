//! tabstream - streaming HTTP transport for tabular data exchange
//!
//! This crate moves table data between a database engine and a remote
//! data-interchange service over plain HTTP/1.1 without ever holding the
//! whole payload in memory. Scans stream a response body into a growable
//! buffer; exports push rows through a chunked request body.

pub mod bridge;
pub mod http;

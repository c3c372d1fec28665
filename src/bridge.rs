//! Scan and export adapters
//!
//! The database side thinks in "give me at least N bytes" and "take these
//! bytes". These adapters map those calls onto an `HttpStream` aimed at the
//! remote service's read and write endpoints.

use crate::http::{Headers, HttpStream, Result, StreamConfig};
use std::io;
use tracing::{debug, trace, warn};

/// Port the remote service listens on unless configured otherwise
pub const DEFAULT_SERVICE_PORT: u16 = 5888;

/// Path prefix of the service endpoints
pub const DEFAULT_SERVICE_PREFIX: &str = "pxf";

/// Location of the remote service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAddress {
    pub host: String,
    pub port: u16,
    pub prefix: String,
}

impl ServiceAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ServiceAddress {
            host: host.into(),
            port,
            prefix: DEFAULT_SERVICE_PREFIX.to_string(),
        }
    }

    /// Use another path prefix
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn read_uri(&self) -> String {
        format!("http://{}:{}/{}/read", self.host, self.port, self.prefix)
    }

    pub fn write_uri(&self) -> String {
        format!("http://{}:{}/{}/write", self.host, self.port, self.prefix)
    }
}

impl Default for ServiceAddress {
    fn default() -> Self {
        ServiceAddress::new("localhost", DEFAULT_SERVICE_PORT)
    }
}

/// Pulls table data from the service
#[derive(Debug)]
pub struct ScanBridge {
    stream: HttpStream,
}

impl ScanBridge {
    /// Open the read endpoint and make sure the service answered
    pub fn start(address: &ServiceAddress, headers: &Headers, config: StreamConfig) -> Result<Self> {
        let uri = address.read_uri();
        debug!(%uri, "starting scan");

        let mut stream = HttpStream::download(&uri, headers, config)?;
        stream.check_connectivity()?;
        Ok(ScanBridge { stream })
    }

    /// Read until `min_len` bytes are in `out` or the stream ends
    ///
    /// Never returns more than `out.len()` bytes. A zero-length result is
    /// only returned after the exchange was confirmed to have ended cleanly.
    pub fn read_min(&mut self, out: &mut [u8], min_len: usize) -> Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }

        let min_len = min_len.min(out.len());
        let mut filled = 0;
        while filled < min_len {
            let n = self.stream.read(&mut out[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == 0 {
            self.stream.check_connectivity()?;
        }

        trace!(bytes = filled, "scan read");
        Ok(filled)
    }

    pub fn stream(&self) -> &HttpStream {
        &self.stream
    }

    /// Confirm a clean end and release the stream
    pub fn finish(self) -> Result<()> {
        self.stream.cleanup(false)
    }

    /// Release the stream without further network traffic
    pub fn abort(self) {
        if let Err(err) = self.stream.cleanup(true) {
            warn!(%err, "scan abort failed");
        }
    }
}

impl io::Read for ScanBridge {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_min(buf, 1).map_err(io::Error::from)
    }
}

/// Pushes table data to the service
#[derive(Debug)]
pub struct ExportBridge {
    stream: HttpStream,
}

impl ExportBridge {
    /// Open the write endpoint
    ///
    /// The upload headers are appended to `headers`.
    pub fn start(address: &ServiceAddress, headers: &mut Headers, config: StreamConfig) -> Result<Self> {
        let uri = address.write_uri();
        debug!(%uri, "starting export");

        let stream = HttpStream::upload(&uri, headers, config)?;
        Ok(ExportBridge { stream })
    }

    /// Buffer `data` for the service; empty writes are ignored
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        let n = self.stream.write(data)?;
        trace!(bytes = n, "export write");
        Ok(n)
    }

    pub fn stream(&self) -> &HttpStream {
        &self.stream
    }

    /// Send the rest of the body and check the service's answer
    pub fn finish(self) -> Result<()> {
        self.stream.cleanup(false)
    }

    /// Release the stream without finishing the body
    pub fn abort(self) {
        if let Err(err) = self.stream.cleanup(true) {
            warn!(%err, "export abort failed");
        }
    }
}

impl io::Write for ExportBridge {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        ExportBridge::write(self, buf).map_err(io::Error::from)
    }

    /// Buffered bytes go out when the buffer fills and at `finish`
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

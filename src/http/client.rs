//! Streaming HTTP client
//!
//! `HttpStream` owns one transfer, the session that drives it and the two
//! buffers that decouple the caller's cadence from the network's. Reads pull
//! the perform loop forward until enough bytes are buffered; writes batch
//! into the upload buffer and flush it through the transfer when full.

use super::config::StreamConfig;
use super::response;
use super::url::{LOCALHOST_IPV4, LOCALHOST_NAME};
use super::{
    ByteBuffer, Endpoint, Error, Headers, Perform, Result, Session, Supply, Transfer, TransferHandler,
    TransferId,
};
use std::net::Ipv4Addr;
use std::thread;
use tracing::{debug, trace, warn};

/// Direction of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Download,
    Upload,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::Download => "download",
            Direction::Upload => "upload",
        }
    }
}

/// Lifecycle of the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    /// Transfer created, not attached to a session
    Idle,
    /// Attached and in flight
    Running,
    /// The session reported no more work
    Done,
}

/// Buffered, non-blocking HTTP stream
#[derive(Debug)]
pub struct HttpStream {
    direction: Direction,
    config: StreamConfig,
    /// Held here while detached from the session
    transfer: Option<Transfer>,
    session: Option<Session>,
    id: Option<TransferId>,
    state: DriverState,
    headline: Option<String>,
    head_open: bool,
    download: ByteBuffer,
    upload: ByteBuffer,
    body_finished: bool,
    end_sent: bool,
}

impl HttpStream {
    /// Start a GET of `url`
    pub fn download(url: &str, headers: &Headers, config: StreamConfig) -> Result<Self> {
        let mut stream = HttpStream::new(Direction::Download, url, headers, config)?;
        stream.setup()?;
        Ok(stream)
    }

    /// Start a chunked POST to `url`
    ///
    /// The upload headers are appended to `headers`.
    pub fn upload(url: &str, headers: &mut Headers, config: StreamConfig) -> Result<Self> {
        headers.append("Content-Type", "application/octet-stream");
        headers.append("Transfer-Encoding", "chunked");
        headers.append("Expect", "100-continue");

        let mut stream = HttpStream::new(Direction::Upload, url, headers, config)?;
        stream.setup()?;
        Ok(stream)
    }

    fn new(direction: Direction, url: &str, headers: &Headers, config: StreamConfig) -> Result<Self> {
        let endpoint = Endpoint::parse(url)?;
        debug!(%endpoint, direction = direction.as_str(), "creating stream");

        let mut transfer = Transfer::new(endpoint.clone());
        transfer.set_headers(headers);
        transfer.set_upload(direction == Direction::Upload);
        transfer.set_expect_timeout(config.expect_timeout);
        transfer.set_upload_chunk(config.upload_chunk);
        apply_loopback_override(&mut transfer, &endpoint);

        Ok(HttpStream {
            direction,
            transfer: Some(transfer),
            session: None,
            id: None,
            state: DriverState::Idle,
            headline: None,
            head_open: false,
            download: ByteBuffer::with_capacity(config.upload_chunk),
            upload: ByteBuffer::with_capacity(config.upload_chunk),
            body_finished: false,
            end_sent: false,
            config,
        })
    }

    /// Point the download at a new address and start over
    ///
    /// The transfer is detached from the session, not destroyed. `headers`
    /// replaces the request headers when given.
    pub fn restart_download(&mut self, url: &str, headers: Option<&Headers>) -> Result<()> {
        self.require(Direction::Download)?;
        let endpoint = Endpoint::parse(url)?;

        let (Some(session), Some(id)) = (self.session.as_mut(), self.id.take()) else {
            return Err(Error::Setup("restart of a stream that was never started".to_string()));
        };
        let mut transfer = session
            .remove(id)
            .ok_or_else(|| Error::Setup(format!("transfer {} is not attached", id)))?;

        debug!(%endpoint, "restarting download");
        transfer.set_endpoint(endpoint.clone());
        apply_loopback_override(&mut transfer, &endpoint);
        if let Some(headers) = headers {
            transfer.set_headers(headers);
        }

        self.headline = None;
        self.head_open = false;
        self.transfer = Some(transfer);
        self.setup()
    }

    /// Buffer `data` for upload, flushing first when the buffer is full
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.require(Direction::Upload)?;
        if data.is_empty() {
            return Ok(0);
        }

        if !self.upload.has_room(data.len()) {
            self.flush()?;
            self.upload.reserve(data.len());
        }

        self.upload.append(data);
        Ok(data.len())
    }

    /// Read up to `buf.len()` bytes; `0` means end of stream
    ///
    /// After a zero-length read the caller should confirm the outcome with
    /// `check_connectivity`.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.require(Direction::Download)?;
        self.fill(buf.len())?;
        self.drain_error_body()?;

        if !self.is_running() {
            self.check_response()?;
        }

        let n = self.download.copy_to(buf);
        trace!(bytes = n, unread = self.download.unread(), "read");
        Ok(n)
    }

    /// Confirm the exchange succeeded
    ///
    /// Downloads first wait for at least one byte or the end of the transfer.
    pub fn check_connectivity(&mut self) -> Result<()> {
        if self.direction == Direction::Download {
            self.fill(1)?;
            self.drain_error_body()?;
        }
        self.check_response()
    }

    /// Release the transfer, the session and both buffers
    ///
    /// Unless `after_error` is set, an upload is finished and a download is
    /// checked for a clean end first. With `after_error` nothing is sent or
    /// read and no error is returned.
    pub fn cleanup(mut self, after_error: bool) -> Result<()> {
        let result = if after_error {
            debug!("cleanup after error, skipping the final exchange");
            Ok(())
        } else {
            match self.direction {
                Direction::Upload => self.finish_upload(),
                Direction::Download => self.check_connectivity(),
            }
        };

        if let Err(err) = &result {
            warn!(%err, "stream failed during cleanup");
        }
        self.release();
        result
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// First line of the latest response, e.g. `HTTP/1.1 200 OK`
    pub fn response_headline(&self) -> Option<&str> {
        self.headline.as_deref()
    }

    /// Buffered download bytes not yet read
    pub fn buffered(&self) -> usize {
        self.download.unread()
    }

    /// Upload buffer, for inspection
    pub fn upload_buffer(&self) -> &ByteBuffer {
        &self.upload
    }

    /// Download buffer, for inspection
    pub fn download_buffer(&self) -> &ByteBuffer {
        &self.download
    }

    fn is_running(&self) -> bool {
        self.state == DriverState::Running
    }

    fn require(&self, direction: Direction) -> Result<()> {
        if self.direction == direction {
            Ok(())
        } else {
            Err(Error::Direction(direction.as_str()))
        }
    }

    /// Attach the transfer to the session and take the first step
    fn setup(&mut self) -> Result<()> {
        let transfer = self
            .transfer
            .take()
            .ok_or_else(|| Error::Setup("transfer is already attached".to_string()))?;

        let session = self.session.get_or_insert_with(Session::new);
        self.id = Some(session.register(transfer));
        self.state = DriverState::Running;

        self.perform_step()
    }

    /// Run `perform` until it stops asking to be called again
    fn perform_step(&mut self) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Err(Error::Setup("stream has no session".to_string()));
        };

        let mut handler = BufferHandler {
            direction: self.direction,
            download: &mut self.download,
            upload: &mut self.upload,
            headline: &mut self.headline,
            head_open: &mut self.head_open,
            body_finished: self.body_finished,
            end_sent: &mut self.end_sent,
        };

        loop {
            match session.perform(&mut handler) {
                Perform::CallAgain => continue,
                Perform::Running(0) => {
                    debug!("no transfers left running");
                    self.state = DriverState::Done;
                    break;
                }
                Perform::Running(_) => break,
            }
        }
        Ok(())
    }

    /// Wait for the session's descriptors, bounded by `max_wait`
    fn wait_for_activity(&mut self) -> Result<()> {
        let Some(session) = self.session.as_ref() else {
            return Ok(());
        };

        let timeout = session
            .timeout()
            .map_or(self.config.max_wait, |t| t.min(self.config.max_wait));
        let interests = session.readiness();

        self.config.cancel.check()?;

        if interests.is_empty() {
            thread::sleep(self.config.idle_sleep);
            return Ok(());
        }

        let ready = session.poll(&interests, timeout)?;
        trace!(ready, ?timeout, "wait finished");
        Ok(())
    }

    /// Run the loop until `want` bytes are buffered or the transfer stops
    fn fill(&mut self, want: usize) -> Result<()> {
        while self.is_running() && self.download.unread() < want {
            self.wait_for_activity()?;
            self.perform_step()?;
        }
        Ok(())
    }

    /// Buffer the rest of the response once a failing status is known
    ///
    /// The body is then only ever surfaced as the error's diagnostic.
    fn drain_error_body(&mut self) -> Result<()> {
        let status = self.response_status();
        if self.is_running() && !matches!(status, 0 | 100 | 200) {
            debug!(status, "failing status, buffering the error body");
            self.fill(usize::MAX)?;
        }
        Ok(())
    }

    /// Status of the latest response head, 0 before one arrived
    fn response_status(&self) -> u16 {
        self.id
            .zip(self.session.as_ref())
            .and_then(|(id, session)| session.transfer(id))
            .map_or(0, Transfer::response_code)
    }

    /// Push the whole upload buffer through the transfer
    fn flush(&mut self) -> Result<()> {
        if self.upload.is_pristine() {
            return Ok(());
        }

        while self.is_running() && self.upload.unread() > 0 {
            self.config.cancel.check()?;
            self.perform_step()?;
            if self.is_running() && self.upload.unread() > 0 {
                self.wait_for_activity()?;
            }
        }

        self.check_response()?;

        if !self.is_running() && self.upload.unread() > 0 {
            return Err(Error::PrematureClose { peer: self.peer() });
        }

        self.upload.reset();
        Ok(())
    }

    /// Flush, end the body and wait for the final response
    fn finish_upload(&mut self) -> Result<()> {
        if self.session.is_none() {
            return Ok(());
        }

        self.flush()?;
        self.body_finished = true;

        while self.is_running() {
            self.config.cancel.check()?;
            self.perform_step()?;
            if self.is_running() {
                self.wait_for_activity()?;
            }
        }

        self.check_response()
    }

    fn check_response(&mut self) -> Result<()> {
        let running = self.is_running();
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };

        response::check_transport_status(session)?;

        let Some(transfer) = self.id.and_then(|id| session.transfer(id)) else {
            return Ok(());
        };
        response::check_application_status(
            transfer,
            running,
            self.download.unread_slice(),
            self.config.verbosity,
        )
    }

    fn peer(&self) -> String {
        let attached = self
            .id
            .zip(self.session.as_ref())
            .and_then(|(id, session)| session.transfer(id));

        match attached.or(self.transfer.as_ref()) {
            Some(transfer) => transfer
                .peer_addr()
                .unwrap_or_else(|| transfer.endpoint().authority()),
            None => String::new(),
        }
    }

    fn release(&mut self) {
        if let (Some(session), Some(id)) = (self.session.as_mut(), self.id.take()) {
            session.remove(id);
        }
        self.session = None;
        self.transfer = None;
        self.download.release();
        self.upload.release();
        self.state = DriverState::Done;
        debug!("stream released");
    }
}

/// Pin `localhost` at the target port to the IPv4 loopback address when the
/// target is `127.0.0.1`
fn apply_loopback_override(transfer: &mut Transfer, endpoint: &Endpoint) {
    if endpoint.is_ipv4_loopback() {
        trace!(
            host = LOCALHOST_NAME,
            port = endpoint.port(),
            addr = LOCALHOST_IPV4,
            "pinning localhost resolution"
        );
        transfer.add_resolve(LOCALHOST_NAME, endpoint.port(), Ipv4Addr::LOCALHOST);
    }
}

/// Connects a transfer to the stream's buffers for one perform step
struct BufferHandler<'a> {
    direction: Direction,
    download: &'a mut ByteBuffer,
    upload: &'a mut ByteBuffer,
    headline: &'a mut Option<String>,
    head_open: &'a mut bool,
    body_finished: bool,
    end_sent: &'a mut bool,
}

impl TransferHandler for BufferHandler<'_> {
    fn on_header(&mut self, line: &[u8]) {
        if line.is_empty() {
            *self.head_open = false;
            return;
        }
        if !*self.head_open {
            *self.head_open = true;
            let line = String::from_utf8_lossy(line).into_owned();
            trace!(%line, "response headline");
            *self.headline = Some(line);
        }
    }

    fn on_data(&mut self, data: &[u8]) -> usize {
        self.download.reserve(data.len());
        self.download.append(data);
        data.len()
    }

    fn on_supply(&mut self, out: &mut [u8]) -> Supply {
        if self.direction != Direction::Upload {
            return Supply::End;
        }

        let n = self.upload.copy_to(out);
        if n > 0 {
            return Supply::Data(n);
        }

        if self.body_finished && !*self.end_sent {
            *self.end_sent = true;
            Supply::End
        } else {
            Supply::Pause
        }
    }
}

//! Transport handle
//!
//! A `Transfer` carries one HTTP/1.1 request and its response over a
//! non-blocking socket. It never blocks: `drive` advances the state machine
//! as far as the socket allows and then returns, leaving the caller to wait
//! on `interest()` before driving it again.
//!
//! Response data, header lines and upload body slices flow through a
//! `TransferHandler` supplied on every drive.

use super::chunked::{encode_chunk, ChunkedDecoder, LAST_CHUNK};
use super::message::{Method, RequestHead};
use super::parser::{find_head_end, head_lines, parse_response_head, ResponseHead, MAX_HEAD_SIZE};
use super::session::{poll_fds, PollEvents};
use super::{Endpoint, Headers};
use bytes::{Buf, BytesMut};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::fmt;
use std::io::{self, Read};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Socket bytes taken per `drive` before yielding to the caller
const READ_BUDGET: usize = 256 * 1024;

/// Size of a single socket read
const READ_CHUNK: usize = 16 * 1024;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

/// Answer of the upload supply handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Supply {
    /// This many bytes were written to the front of the slice
    Data(usize),
    /// Nothing to send right now; ask again on the next drive
    Pause,
    /// The body is complete
    End,
}

/// Callbacks through which a transfer exchanges data with its owner
pub trait TransferHandler {
    /// A response header line, without its line terminator
    ///
    /// An empty line closes each response head, interim heads included.
    fn on_header(&mut self, line: &[u8]);

    /// Response body bytes
    ///
    /// Returning less than `data.len()` fails the transfer.
    fn on_data(&mut self, data: &[u8]) -> usize;

    /// Fill `out` with the next slice of the upload body
    fn on_supply(&mut self, out: &mut [u8]) -> Supply;
}

/// Failure kinds a completed transfer can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferCode {
    CouldntResolveHost,
    CouldntConnect,
    WeirdServerReply,
    PartialFile,
    WriteError,
    GotNothing,
    SendError,
    RecvError,
}

impl TransferCode {
    /// Numeric code, matching the values transport libraries traditionally use
    pub fn code(&self) -> u32 {
        match self {
            TransferCode::CouldntResolveHost => 6,
            TransferCode::CouldntConnect => 7,
            TransferCode::WeirdServerReply => 8,
            TransferCode::PartialFile => 18,
            TransferCode::WriteError => 23,
            TransferCode::GotNothing => 52,
            TransferCode::SendError => 55,
            TransferCode::RecvError => 56,
        }
    }

    /// Generic reason text
    pub fn reason(&self) -> &'static str {
        match self {
            TransferCode::CouldntResolveHost => "Couldn't resolve host name",
            TransferCode::CouldntConnect => "Couldn't connect to server",
            TransferCode::WeirdServerReply => "Weird server reply",
            TransferCode::PartialFile => "Transferred a partial file",
            TransferCode::WriteError => "Failed writing received data to disk/application",
            TransferCode::GotNothing => "Server returned nothing (no headers, no data)",
            TransferCode::SendError => "Failed sending data to the peer",
            TransferCode::RecvError => "Failure when receiving data from the peer",
        }
    }
}

impl fmt::Display for TransferCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason())
    }
}

/// A transfer that completed with a failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferError {
    pub code: TransferCode,
    /// Remote `ip:port`, when a peer was chosen
    pub peer: Option<String>,
    /// Transport diagnostic text, when any was recorded
    pub detail: Option<String>,
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transfer error ({}): {}", self.code.code(), self.code.reason())?;
        if let Some(peer) = &self.peer {
            write!(f, " from '{}'", peer)?;
        }
        Ok(())
    }
}

impl std::error::Error for TransferError {}

/// Fixed host and port to address mapping, consulted before the resolver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveOverride {
    pub host: String,
    pub port: u16,
    pub addr: Ipv4Addr,
}

/// Result of one `drive`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    /// Waiting on the socket, or the read budget ran out
    Pending,
    /// State advanced without touching the socket; drive again now
    Again,
    /// The transfer has completed, successfully or not
    Done,
}

#[derive(Debug)]
enum State {
    Idle,
    Connecting,
    SendingHead,
    AwaitContinue { deadline: Instant },
    SendingBody,
    ReceivingHead,
    ReceivingBody(BodyReader),
    Done,
}

#[derive(Debug)]
enum BodyReader {
    Length(u64),
    Chunked(ChunkedDecoder),
    UntilClose,
}

enum Step {
    Continue,
    Blocked,
    Yield,
}

enum Fill {
    Data,
    Empty,
    Closed,
    Budget,
}

type StepResult = std::result::Result<Step, TransferCode>;

/// One HTTP/1.1 exchange over a non-blocking socket
#[derive(Debug)]
pub struct Transfer {
    endpoint: Endpoint,
    entries: Vec<String>,
    upload: bool,
    expect_timeout: Duration,
    upload_chunk: usize,
    resolve: Vec<ResolveOverride>,

    state: State,
    socket: Option<Socket>,
    peer: Option<SocketAddr>,
    outbound: BytesMut,
    inbound: BytesMut,
    scratch: Vec<u8>,
    paused: bool,
    body_ended: bool,
    response_code: u16,
    diagnostics: String,
    outcome: Option<Result<(), TransferCode>>,
}

impl Transfer {
    /// Create a GET transfer for `endpoint`
    pub fn new(endpoint: Endpoint) -> Self {
        Transfer {
            endpoint,
            entries: Vec::new(),
            upload: false,
            expect_timeout: Duration::from_secs(1),
            upload_chunk: 64 * 1024,
            resolve: Vec::new(),
            state: State::Idle,
            socket: None,
            peer: None,
            outbound: BytesMut::new(),
            inbound: BytesMut::new(),
            scratch: Vec::new(),
            paused: false,
            body_ended: false,
            response_code: 0,
            diagnostics: String::new(),
            outcome: None,
        }
    }

    pub fn set_endpoint(&mut self, endpoint: Endpoint) {
        self.endpoint = endpoint;
    }

    /// Snapshot the header entries sent with the request
    pub fn set_headers(&mut self, headers: &Headers) {
        self.entries = headers.entries().to_vec();
    }

    /// Send a POST with a chunked body pulled from the handler
    pub fn set_upload(&mut self, upload: bool) {
        self.upload = upload;
    }

    pub fn set_expect_timeout(&mut self, timeout: Duration) {
        self.expect_timeout = timeout;
    }

    pub fn set_upload_chunk(&mut self, size: usize) {
        self.upload_chunk = size.max(1);
    }

    /// Resolve `host:port` to `addr` without asking the system resolver
    pub fn add_resolve(&mut self, host: &str, port: u16, addr: Ipv4Addr) {
        debug!(host, port, %addr, "adding resolve override");
        self.resolve.retain(|o| !(o.host.eq_ignore_ascii_case(host) && o.port == port));
        self.resolve.push(ResolveOverride {
            host: host.to_string(),
            port,
            addr,
        });
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Installed host and port to address mappings
    pub fn resolve_overrides(&self) -> &[ResolveOverride] {
        &self.resolve
    }

    pub fn method(&self) -> Method {
        if self.upload {
            Method::Post
        } else {
            Method::Get
        }
    }

    /// Last response status seen, or 0 before any response head
    pub fn response_code(&self) -> u16 {
        self.response_code
    }

    #[cfg(test)]
    pub(crate) fn set_response_code(&mut self, code: u16) {
        self.response_code = code;
    }

    /// Remote `ip:port` once a peer was chosen
    pub fn peer_addr(&self) -> Option<String> {
        self.peer.map(|addr| addr.to_string())
    }

    /// Transport diagnostic text; empty unless the transfer failed
    pub fn diagnostics(&self) -> &str {
        &self.diagnostics
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, State::Done)
    }

    /// Completion result, once done
    pub fn outcome(&self) -> Option<Result<(), TransferCode>> {
        self.outcome
    }

    /// Drop the connection and forget all progress, keeping the options
    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.socket = None;
        self.peer = None;
        self.outbound.clear();
        self.inbound.clear();
        self.paused = false;
        self.body_ended = false;
        self.response_code = 0;
        self.diagnostics.clear();
        self.outcome = None;
    }

    /// Descriptor to wait on, if the transfer is waiting on one
    pub fn fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(|s| s.as_raw_fd())
    }

    /// Readiness the transfer needs before it can progress
    pub fn interest(&self) -> Option<PollEvents> {
        self.socket.as_ref()?;
        match self.state {
            State::Idle | State::Done => None,
            State::Connecting | State::SendingHead => Some(PollEvents::Write),
            State::SendingBody if self.paused && self.outbound.is_empty() => Some(PollEvents::Read),
            State::SendingBody => Some(PollEvents::Both),
            State::AwaitContinue { .. } | State::ReceivingHead | State::ReceivingBody(_) => {
                Some(PollEvents::Read)
            }
        }
    }

    /// Time left until the transfer wants to be driven regardless of I/O
    pub fn timeout(&self) -> Option<Duration> {
        match self.state {
            State::AwaitContinue { deadline } => {
                Some(deadline.saturating_duration_since(Instant::now()))
            }
            _ => None,
        }
    }

    /// Advance as far as the socket allows
    pub(crate) fn drive(&mut self, handler: &mut dyn TransferHandler) -> Progress {
        let mut budget = READ_BUDGET;

        loop {
            let step = match self.state {
                State::Idle => self.start(),
                State::Connecting => self.finish_connect(),
                State::SendingHead => self.send_head(),
                State::AwaitContinue { deadline } => self.await_continue(deadline, handler, &mut budget),
                State::SendingBody => self.send_body(handler, &mut budget),
                State::ReceivingHead => self.receive_head(handler, &mut budget),
                State::ReceivingBody(_) => self.receive_body(handler, &mut budget),
                State::Done => return Progress::Done,
            };

            match step {
                Ok(Step::Continue) => continue,
                Ok(Step::Blocked) => return Progress::Pending,
                Ok(Step::Yield) => return Progress::Again,
                Err(_) => return Progress::Done,
            }
        }
    }

    fn start(&mut self) -> StepResult {
        let addrs = self.resolve_addrs()?;

        let mut last_error = None;
        for addr in addrs {
            match open_socket(addr) {
                Ok((socket, connected)) => {
                    debug!(peer = %addr, connected, "connecting");
                    self.socket = Some(socket);
                    self.peer = Some(SocketAddr::V4(addr));
                    self.state = if connected {
                        State::SendingHead
                    } else {
                        State::Connecting
                    };
                    self.queue_request();
                    return Ok(Step::Continue);
                }
                Err(err) => {
                    self.peer = Some(SocketAddr::V4(addr));
                    last_error = Some(err);
                }
            }
        }

        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no usable address".to_string());
        Err(self.connect_failed(&reason))
    }

    fn resolve_addrs(&mut self) -> std::result::Result<Vec<SocketAddrV4>, TransferCode> {
        let host = self.endpoint.host();
        let port = self.endpoint.port();

        if let Some(entry) = self
            .resolve
            .iter()
            .find(|o| o.host.eq_ignore_ascii_case(host) && o.port == port)
        {
            trace!(host, port, addr = %entry.addr, "resolve override hit");
            return Ok(vec![SocketAddrV4::new(entry.addr, port)]);
        }

        let addrs: Vec<SocketAddrV4> = match (host, port).to_socket_addrs() {
            Ok(iter) => iter
                .filter_map(|addr| match addr {
                    SocketAddr::V4(v4) => Some(v4),
                    SocketAddr::V6(_) => None,
                })
                .collect(),
            Err(_) => Vec::new(),
        };

        if addrs.is_empty() {
            let detail = format!("Could not resolve host: {}", host);
            return Err(self.fail(TransferCode::CouldntResolveHost, detail));
        }
        Ok(addrs)
    }

    fn queue_request(&mut self) {
        let authority = self.endpoint.authority();
        let head = RequestHead {
            method: self.method(),
            target: self.endpoint.path(),
            host: &authority,
            entries: &self.entries,
        };
        let wire = head.to_wire();
        trace!(head = %String::from_utf8_lossy(&wire), "request head");

        self.outbound.clear();
        self.outbound.extend_from_slice(&wire);
    }

    fn finish_connect(&mut self) -> StepResult {
        let Some(socket) = self.socket.as_ref() else {
            return Err(self.connect_failed("socket vanished"));
        };

        let mut pfd = libc::pollfd {
            fd: socket.as_raw_fd(),
            events: libc::POLLOUT,
            revents: 0,
        };
        match poll_fds(std::slice::from_mut(&mut pfd), Duration::ZERO) {
            Ok(0) => return Ok(Step::Blocked),
            Ok(_) => {}
            Err(err) => return Err(self.connect_failed(&err.to_string())),
        }

        match socket.take_error() {
            Ok(None) => {
                debug!(peer = ?self.peer, "connected");
                self.state = State::SendingHead;
                Ok(Step::Continue)
            }
            Ok(Some(err)) | Err(err) => Err(self.connect_failed(&err.to_string())),
        }
    }

    fn send_head(&mut self) -> StepResult {
        match self.write_outbound() {
            Ok(true) => {}
            Ok(false) => return Ok(Step::Blocked),
            Err(err) => return Err(self.send_failed(err)),
        }

        self.state = if !self.upload {
            State::ReceivingHead
        } else if self.expects_continue() {
            State::AwaitContinue {
                deadline: Instant::now() + self.expect_timeout,
            }
        } else {
            State::SendingBody
        };
        Ok(Step::Continue)
    }

    fn expects_continue(&self) -> bool {
        self.entries.iter().any(|entry| {
            entry.split_once(':').is_some_and(|(name, value)| {
                name.trim().eq_ignore_ascii_case("Expect")
                    && value.trim().eq_ignore_ascii_case("100-continue")
            })
        })
    }

    fn await_continue(
        &mut self,
        deadline: Instant,
        handler: &mut dyn TransferHandler,
        budget: &mut usize,
    ) -> StepResult {
        let fill = self.fill_inbound(budget).map_err(|err| self.recv_failed(err))?;

        if let Some(end) = find_head_end(&self.inbound) {
            let status = self.peek_status(end)?;
            if status == 100 {
                self.take_head(end, handler)?;
                debug!("got 100 Continue");
                self.state = State::SendingBody;
                return Ok(Step::Yield);
            }
            if (101..200).contains(&status) {
                self.take_head(end, handler)?;
                return Ok(Step::Continue);
            }
            debug!(status, "final response before the upload body");
            self.state = State::ReceivingHead;
            return Ok(Step::Continue);
        }

        match fill {
            Fill::Closed => {
                self.state = State::ReceivingHead;
                Ok(Step::Continue)
            }
            _ if Instant::now() >= deadline => {
                debug!("no 100 Continue in time, sending the body");
                self.state = State::SendingBody;
                Ok(Step::Yield)
            }
            Fill::Data => Ok(Step::Continue),
            Fill::Empty | Fill::Budget => Ok(Step::Blocked),
        }
    }

    fn send_body(&mut self, handler: &mut dyn TransferHandler, budget: &mut usize) -> StepResult {
        if self.early_response(handler, budget)? {
            debug!("response arrived while sending the body, abandoning it");
            self.outbound.clear();
            self.state = State::ReceivingHead;
            return Ok(Step::Continue);
        }

        loop {
            if !self.outbound.is_empty() {
                match self.write_outbound() {
                    Ok(true) => continue,
                    Ok(false) => return Ok(Step::Blocked),
                    Err(err) => return Err(self.send_failed(err)),
                }
            }

            if self.body_ended {
                self.state = State::ReceivingHead;
                return Ok(Step::Continue);
            }

            let chunk = self.upload_chunk;
            if self.scratch.len() < chunk {
                self.scratch.resize(chunk, 0);
            }
            match handler.on_supply(&mut self.scratch[..chunk]) {
                Supply::Data(0) | Supply::Pause => {
                    self.paused = true;
                    return Ok(Step::Blocked);
                }
                Supply::Data(n) => {
                    self.paused = false;
                    encode_chunk(&mut self.outbound, &self.scratch[..n.min(chunk)]);
                    trace!(bytes = n, "body chunk");
                }
                Supply::End => {
                    self.paused = false;
                    self.body_ended = true;
                    self.outbound.extend_from_slice(LAST_CHUNK);
                    debug!("upload body complete");
                }
            }
        }
    }

    /// Look for a final response arriving before the body was sent
    ///
    /// Interim heads are consumed on the way.
    fn early_response(
        &mut self,
        handler: &mut dyn TransferHandler,
        budget: &mut usize,
    ) -> std::result::Result<bool, TransferCode> {
        let fill = self.fill_inbound(budget).map_err(|err| self.send_failed(err))?;

        while let Some(end) = find_head_end(&self.inbound) {
            let status = self.peek_status(end)?;
            if (100..200).contains(&status) {
                self.take_head(end, handler)?;
                continue;
            }
            return Ok(true);
        }

        if matches!(fill, Fill::Closed) {
            let detail = "Connection closed by peer while sending the request body".to_string();
            return Err(self.fail(TransferCode::SendError, detail));
        }
        Ok(false)
    }

    fn receive_head(&mut self, handler: &mut dyn TransferHandler, budget: &mut usize) -> StepResult {
        loop {
            if let Some(end) = find_head_end(&self.inbound) {
                let head = self.take_head(end, handler)?;
                if head.status.is_informational() {
                    continue;
                }
                return self.begin_body(&head);
            }

            if self.inbound.len() > MAX_HEAD_SIZE {
                let detail = format!("Response head exceeds {} bytes", MAX_HEAD_SIZE);
                return Err(self.fail(TransferCode::WeirdServerReply, detail));
            }

            match self.fill_inbound(budget) {
                Ok(Fill::Data) => continue,
                Ok(Fill::Empty) | Ok(Fill::Budget) => return Ok(Step::Blocked),
                Ok(Fill::Closed) if self.inbound.is_empty() => {
                    return Err(self.fail(TransferCode::GotNothing, "Empty reply from server".to_string()));
                }
                Ok(Fill::Closed) => {
                    let detail = "Connection closed inside the response head".to_string();
                    return Err(self.fail(TransferCode::WeirdServerReply, detail));
                }
                Err(err) => return Err(self.recv_failed(err)),
            }
        }
    }

    fn begin_body(&mut self, head: &ResponseHead) -> StepResult {
        let reader = if !head.status.has_body() {
            None
        } else if head.is_chunked() {
            Some(BodyReader::Chunked(ChunkedDecoder::new()))
        } else {
            match head.content_length() {
                Ok(Some(0)) => None,
                Ok(Some(len)) => Some(BodyReader::Length(len)),
                Ok(None) => Some(BodyReader::UntilClose),
                Err(err) => return Err(self.fail(TransferCode::WeirdServerReply, err.to_string())),
            }
        };

        match reader {
            Some(reader) => {
                trace!(?reader, "reading body");
                self.state = State::ReceivingBody(reader);
            }
            None => self.complete(),
        }
        Ok(Step::Continue)
    }

    fn receive_body(&mut self, handler: &mut dyn TransferHandler, budget: &mut usize) -> StepResult {
        loop {
            if !self.inbound.is_empty() {
                self.deliver(handler)?;
                if self.is_done() {
                    return Ok(Step::Continue);
                }
            }

            match self.fill_inbound(budget) {
                Ok(Fill::Data) => continue,
                Ok(Fill::Empty) | Ok(Fill::Budget) => return Ok(Step::Blocked),
                Ok(Fill::Closed) => {
                    let short = match &self.state {
                        State::ReceivingBody(BodyReader::Length(remaining)) => Some(format!(
                            "transfer closed with {} bytes remaining to read",
                            remaining
                        )),
                        State::ReceivingBody(BodyReader::Chunked(_)) => {
                            Some("transfer closed with outstanding read data remaining".to_string())
                        }
                        _ => None,
                    };
                    return match short {
                        Some(detail) => Err(self.fail(TransferCode::PartialFile, detail)),
                        None => {
                            self.complete();
                            Ok(Step::Continue)
                        }
                    };
                }
                Err(err) => return Err(self.recv_failed(err)),
            }
        }
    }

    /// Hand buffered body bytes to the handler
    fn deliver(&mut self, handler: &mut dyn TransferHandler) -> std::result::Result<(), TransferCode> {
        let decoded = match &mut self.state {
            State::ReceivingBody(BodyReader::Length(remaining)) => {
                let n = (*remaining).min(self.inbound.len() as u64);
                *remaining -= n;
                Ok((self.inbound.split_to(n as usize), *remaining == 0))
            }
            State::ReceivingBody(BodyReader::UntilClose) => Ok((self.inbound.split(), false)),
            State::ReceivingBody(BodyReader::Chunked(decoder)) => {
                if self.scratch.len() < self.inbound.len() {
                    self.scratch.resize(self.inbound.len(), 0);
                }
                match decoder.decode(&self.inbound, &mut self.scratch) {
                    Ok((consumed, produced, complete)) => {
                        self.inbound.advance(consumed);
                        Ok((BytesMut::from(&self.scratch[..produced]), complete))
                    }
                    Err(err) => Err(err.to_string()),
                }
            }
            _ => return Ok(()),
        };

        let (data, finished) = match decoded {
            Ok(decoded) => decoded,
            Err(detail) => return Err(self.fail(TransferCode::RecvError, detail)),
        };

        if !data.is_empty() {
            let accepted = handler.on_data(&data);
            if accepted != data.len() {
                let detail = format!(
                    "Failure writing output to destination, passed {} returned {}",
                    data.len(),
                    accepted
                );
                return Err(self.fail(TransferCode::WriteError, detail));
            }
        }

        if finished {
            self.complete();
        }
        Ok(())
    }

    fn peek_status(&mut self, end: usize) -> std::result::Result<u16, TransferCode> {
        match parse_response_head(&self.inbound[..end]) {
            Ok(head) => Ok(head.status.code()),
            Err(err) => Err(self.fail(TransferCode::WeirdServerReply, err.to_string())),
        }
    }

    /// Remove a complete head from the inbound buffer and report its lines
    fn take_head(
        &mut self,
        end: usize,
        handler: &mut dyn TransferHandler,
    ) -> std::result::Result<ResponseHead, TransferCode> {
        let raw = self.inbound.split_to(end);
        let head = match parse_response_head(&raw) {
            Ok(head) => head,
            Err(err) => return Err(self.fail(TransferCode::WeirdServerReply, err.to_string())),
        };

        for line in head_lines(&raw) {
            handler.on_header(line);
        }
        handler.on_header(b"");

        self.response_code = head.status.code();
        debug!(status = self.response_code, reason = %head.reason, "response head");
        Ok(head)
    }

    fn fill_inbound(&mut self, budget: &mut usize) -> io::Result<Fill> {
        if *budget == 0 {
            return Ok(Fill::Budget);
        }
        let Some(socket) = self.socket.as_ref() else {
            return Ok(Fill::Closed);
        };

        let start = self.inbound.len();
        self.inbound.resize(start + READ_CHUNK.min(*budget), 0);

        let mut reader: &Socket = socket;
        loop {
            match reader.read(&mut self.inbound[start..]) {
                Ok(0) => {
                    self.inbound.truncate(start);
                    trace!("peer closed the connection");
                    return Ok(Fill::Closed);
                }
                Ok(n) => {
                    self.inbound.truncate(start + n);
                    *budget = budget.saturating_sub(n);
                    trace!(bytes = n, "received");
                    return Ok(Fill::Data);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.inbound.truncate(start);
                    return Ok(Fill::Empty);
                }
                Err(err) => {
                    self.inbound.truncate(start);
                    return Err(err);
                }
            }
        }
    }

    /// Write queued bytes; true once the queue is empty
    fn write_outbound(&mut self) -> io::Result<bool> {
        let Some(socket) = self.socket.as_ref() else {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        };

        while !self.outbound.is_empty() {
            match socket.send_with_flags(&self.outbound, SEND_FLAGS) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => {
                    trace!(bytes = n, "sent");
                    self.outbound.advance(n);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) => return Err(err),
            }
        }
        Ok(true)
    }

    fn complete(&mut self) {
        debug!(status = self.response_code, "transfer complete");
        self.state = State::Done;
        self.socket = None;
        self.outcome = Some(Ok(()));
    }

    fn fail(&mut self, code: TransferCode, detail: String) -> TransferCode {
        debug!(code = code.code(), %detail, "transfer failed");
        self.diagnostics = detail;
        self.state = State::Done;
        self.socket = None;
        self.outcome = Some(Err(code));
        code
    }

    fn connect_failed(&mut self, reason: &str) -> TransferCode {
        let detail = format!(
            "Failed to connect to {} port {}: {}",
            self.endpoint.host(),
            self.endpoint.port(),
            reason
        );
        self.fail(TransferCode::CouldntConnect, detail)
    }

    fn send_failed(&mut self, err: io::Error) -> TransferCode {
        self.fail(TransferCode::SendError, format!("Send failure: {}", err))
    }

    fn recv_failed(&mut self, err: io::Error) -> TransferCode {
        self.fail(TransferCode::RecvError, format!("Recv failure: {}", err))
    }
}

/// Create a non-blocking IPv4 socket and start connecting it
///
/// Returns whether the connection completed immediately.
fn open_socket(addr: SocketAddrV4) -> io::Result<(Socket, bool)> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    socket.set_nosigpipe(true)?;

    match socket.connect(&SockAddr::from(addr)) {
        Ok(()) => Ok((socket, true)),
        Err(err)
            if err.raw_os_error() == Some(libc::EINPROGRESS)
                || err.kind() == io::ErrorKind::WouldBlock =>
        {
            Ok((socket, false))
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    #[derive(Default)]
    struct Collect {
        lines: Vec<String>,
        body: Vec<u8>,
        upload: Vec<u8>,
        ended: bool,
    }

    impl TransferHandler for Collect {
        fn on_header(&mut self, line: &[u8]) {
            self.lines.push(String::from_utf8_lossy(line).into_owned());
        }

        fn on_data(&mut self, data: &[u8]) -> usize {
            self.body.extend_from_slice(data);
            data.len()
        }

        fn on_supply(&mut self, out: &mut [u8]) -> Supply {
            if self.upload.is_empty() {
                if self.ended {
                    return Supply::Pause;
                }
                self.ended = true;
                return Supply::End;
            }
            let n = self.upload.len().min(out.len());
            out[..n].copy_from_slice(&self.upload[..n]);
            self.upload.drain(..n);
            Supply::Data(n)
        }
    }

    fn run(transfer: &mut Transfer, handler: &mut dyn TransferHandler) {
        for _ in 0..10_000 {
            if transfer.drive(handler) == Progress::Done {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("transfer did not finish");
    }

    fn read_request(stream: &mut TcpStream) -> Vec<u8> {
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while find_head_end(&request).is_none() {
            let n = std::io::Read::read(stream, &mut buf).unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
        }
        request
    }

    #[test]
    fn test_transfer_code_text() {
        let err = TransferError {
            code: TransferCode::CouldntConnect,
            peer: Some("127.0.0.1:5888".to_string()),
            detail: None,
        };
        assert_eq!(
            err.to_string(),
            "transfer error (7): Couldn't connect to server from '127.0.0.1:5888'"
        );
        assert_eq!(TransferCode::GotNothing.code(), 52);
    }

    #[test]
    fn test_get_with_content_length() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let request = read_request(&mut stream);
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nHello")
                .unwrap();
            request
        });

        let endpoint = Endpoint::parse(&format!("http://127.0.0.1:{}/data", addr.port())).unwrap();
        let mut transfer = Transfer::new(endpoint);
        let mut handler = Collect::default();
        run(&mut transfer, &mut handler);

        let request = String::from_utf8(server.join().unwrap()).unwrap();
        assert!(request.starts_with("GET /data HTTP/1.1\r\n"));
        assert_eq!(transfer.outcome(), Some(Ok(())));
        assert_eq!(transfer.response_code(), 200);
        assert_eq!(handler.body, b"Hello");
        assert_eq!(handler.lines, vec!["HTTP/1.1 200 OK", "Content-Length: 5", ""]);
        assert_eq!(transfer.peer_addr(), Some(addr.to_string()));
    }

    #[test]
    fn test_chunked_body_until_terminator() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            read_request(&mut stream);
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n")
                .unwrap();
            thread::sleep(Duration::from_millis(20));
            stream.write_all(b"2\r\nde\r\n0\r\n\r\n").unwrap();
            thread::sleep(Duration::from_millis(50));
        });

        let endpoint = Endpoint::parse(&format!("http://127.0.0.1:{}/", addr.port())).unwrap();
        let mut transfer = Transfer::new(endpoint);
        let mut handler = Collect::default();
        run(&mut transfer, &mut handler);
        server.join().unwrap();

        assert_eq!(transfer.outcome(), Some(Ok(())));
        assert_eq!(handler.body, b"abcde");
    }

    #[test]
    fn test_short_body_is_partial() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            read_request(&mut stream);
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc")
                .unwrap();
        });

        let endpoint = Endpoint::parse(&format!("http://127.0.0.1:{}/", addr.port())).unwrap();
        let mut transfer = Transfer::new(endpoint);
        let mut handler = Collect::default();
        run(&mut transfer, &mut handler);
        server.join().unwrap();

        assert_eq!(transfer.outcome(), Some(Err(TransferCode::PartialFile)));
        assert_eq!(
            transfer.diagnostics(),
            "transfer closed with 7 bytes remaining to read"
        );
        assert_eq!(handler.body, b"abc");
    }

    #[test]
    fn test_empty_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            read_request(&mut stream);
        });

        let endpoint = Endpoint::parse(&format!("http://127.0.0.1:{}/", addr.port())).unwrap();
        let mut transfer = Transfer::new(endpoint);
        let mut handler = Collect::default();
        run(&mut transfer, &mut handler);
        server.join().unwrap();

        assert_eq!(transfer.outcome(), Some(Err(TransferCode::GotNothing)));
        assert_eq!(transfer.response_code(), 0);
    }

    #[test]
    fn test_connection_refused() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let endpoint = Endpoint::parse(&format!("http://127.0.0.1:{}/", port)).unwrap();
        let mut transfer = Transfer::new(endpoint);
        let mut handler = Collect::default();
        run(&mut transfer, &mut handler);

        assert_eq!(transfer.outcome(), Some(Err(TransferCode::CouldntConnect)));
        assert!(transfer
            .diagnostics()
            .starts_with(&format!("Failed to connect to 127.0.0.1 port {}", port)));
    }

    #[test]
    fn test_upload_with_continue() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = read_request(&mut stream);
            stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").unwrap();

            let mut buf = [0u8; 1024];
            while !request.ends_with(LAST_CHUNK) {
                let n = std::io::Read::read(&mut stream, &mut buf).unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                .unwrap();
            request
        });

        let endpoint = Endpoint::parse(&format!("http://127.0.0.1:{}/write", addr.port())).unwrap();
        let mut transfer = Transfer::new(endpoint);
        let headers: Headers = [("Transfer-Encoding", "chunked"), ("Expect", "100-continue")]
            .into_iter()
            .collect();
        transfer.set_headers(&headers);
        transfer.set_upload(true);

        let mut handler = Collect {
            upload: b"row1\nrow2\n".to_vec(),
            ..Collect::default()
        };
        run(&mut transfer, &mut handler);

        let request = String::from_utf8(server.join().unwrap()).unwrap();
        assert!(request.starts_with("POST /write HTTP/1.1\r\n"));
        assert!(request.ends_with("\r\n\r\na\r\nrow1\nrow2\n\r\n0\r\n\r\n"));
        assert_eq!(transfer.outcome(), Some(Ok(())));
        assert_eq!(transfer.response_code(), 200);
        assert_eq!(handler.lines[0], "HTTP/1.1 100 Continue");
    }

    #[test]
    fn test_resolve_override_and_reset() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            read_request(&mut stream);
            stream
                .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
                .unwrap();
        });

        let endpoint = Endpoint::parse(&format!("http://service.invalid:{}/", addr.port())).unwrap();
        let mut transfer = Transfer::new(endpoint);
        transfer.add_resolve("service.invalid", addr.port(), Ipv4Addr::LOCALHOST);
        let mut handler = Collect::default();
        run(&mut transfer, &mut handler);
        server.join().unwrap();

        assert_eq!(transfer.outcome(), Some(Ok(())));
        assert_eq!(transfer.response_code(), 204);

        transfer.reset();
        assert_eq!(transfer.outcome(), None);
        assert_eq!(transfer.response_code(), 0);
        assert!(transfer.interest().is_none());
    }
}

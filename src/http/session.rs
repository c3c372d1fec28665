//! Multiplexed transfer session
//!
//! A `Session` drives any number of registered transfers without blocking.
//! The caller asks it which descriptors to wait on, waits with `poll`, then
//! runs a `perform` step. Finished transfers leave a `Completion` in a queue
//! that the caller drains with `info_read`.

use super::transfer::Progress;
use super::{Result, Transfer, TransferCode, TransferHandler};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;
use tracing::trace;

/// Poll events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvents {
    Read,
    Write,
    Both,
}

impl PollEvents {
    fn as_flags(self) -> libc::c_short {
        match self {
            PollEvents::Read => libc::POLLIN,
            PollEvents::Write => libc::POLLOUT,
            PollEvents::Both => libc::POLLIN | libc::POLLOUT,
        }
    }
}

/// A descriptor and the readiness a transfer is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub fd: RawFd,
    pub events: PollEvents,
}

/// Handle of a transfer registered with a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId(u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Completion message of a finished transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub id: TransferId,
    pub result: std::result::Result<(), TransferCode>,
}

/// Outcome of a perform step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Perform {
    /// A transfer changed state without I/O; perform again right away
    CallAgain,
    /// Number of transfers still in flight
    Running(usize),
}

/// Non-blocking multiplexer for transfers
#[derive(Debug, Default)]
pub struct Session {
    transfers: Vec<(TransferId, Transfer)>,
    completions: VecDeque<Completion>,
    next_id: u64,
}

impl Session {
    /// Create a new empty session
    pub fn new() -> Self {
        Session::default()
    }

    /// Attach a transfer; it starts from scratch on the next perform
    pub fn register(&mut self, mut transfer: Transfer) -> TransferId {
        transfer.reset();
        let id = TransferId(self.next_id);
        self.next_id += 1;
        trace!(%id, endpoint = %transfer.endpoint(), "registering transfer");
        self.transfers.push((id, transfer));
        id
    }

    /// Detach a transfer, dropping any completion it left behind
    pub fn remove(&mut self, id: TransferId) -> Option<Transfer> {
        self.completions.retain(|c| c.id != id);
        let idx = self.transfers.iter().position(|(tid, _)| *tid == id)?;
        trace!(%id, "removing transfer");
        Some(self.transfers.remove(idx).1)
    }

    /// Drive every unfinished transfer once
    pub fn perform(&mut self, handler: &mut dyn TransferHandler) -> Perform {
        let mut again = false;

        for (id, transfer) in self.transfers.iter_mut() {
            if transfer.is_done() {
                continue;
            }
            match transfer.drive(handler) {
                Progress::Pending => {}
                Progress::Again => again = true,
                Progress::Done => {
                    if let Some(result) = transfer.outcome() {
                        trace!(%id, ?result, "transfer finished");
                        self.completions.push_back(Completion { id: *id, result });
                    }
                }
            }
        }

        if again {
            Perform::CallAgain
        } else {
            Perform::Running(self.running())
        }
    }

    /// Number of registered transfers that have not finished
    pub fn running(&self) -> usize {
        self.transfers.iter().filter(|(_, t)| !t.is_done()).count()
    }

    /// Longest the caller may wait before the next perform, if bounded
    pub fn timeout(&self) -> Option<Duration> {
        self.transfers.iter().filter_map(|(_, t)| t.timeout()).min()
    }

    /// Descriptors the caller should wait on
    pub fn readiness(&self) -> Vec<Interest> {
        self.transfers
            .iter()
            .filter_map(|(_, t)| {
                Some(Interest {
                    fd: t.fd()?,
                    events: t.interest()?,
                })
            })
            .collect()
    }

    /// Wait until one of `interests` is ready or `timeout` elapses
    ///
    /// Returns the number of ready descriptors. An interrupted wait counts as
    /// a timeout.
    pub fn poll(&self, interests: &[Interest], timeout: Duration) -> Result<usize> {
        let mut fds: Vec<libc::pollfd> = interests
            .iter()
            .map(|i| libc::pollfd {
                fd: i.fd,
                events: i.events.as_flags(),
                revents: 0,
            })
            .collect();

        match poll_fds(&mut fds, timeout) {
            Ok(ready) => Ok(ready),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    /// Pop the next completion message
    pub fn info_read(&mut self) -> Option<Completion> {
        self.completions.pop_front()
    }

    pub fn transfer(&self, id: TransferId) -> Option<&Transfer> {
        self.transfers.iter().find(|(tid, _)| *tid == id).map(|(_, t)| t)
    }

    pub fn transfer_mut(&mut self, id: TransferId) -> Option<&mut Transfer> {
        self.transfers
            .iter_mut()
            .find(|(tid, _)| *tid == id)
            .map(|(_, t)| t)
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }
}

/// `poll(2)` over a set of descriptors
///
/// Sub-millisecond timeouts round up so a short wait never becomes a spin.
pub(crate) fn poll_fds(fds: &mut [libc::pollfd], timeout: Duration) -> io::Result<usize> {
    let timeout_ms = timeout
        .as_micros()
        .div_ceil(1000)
        .min(libc::c_int::MAX as u128) as libc::c_int;

    let result = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };

    if result < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(result as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Endpoint, Supply};
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::AsRawFd;
    use std::thread;
    use std::time::Instant;

    #[derive(Default)]
    struct Sink {
        body: Vec<u8>,
    }

    impl TransferHandler for Sink {
        fn on_header(&mut self, _line: &[u8]) {}

        fn on_data(&mut self, data: &[u8]) -> usize {
            self.body.extend_from_slice(data);
            data.len()
        }

        fn on_supply(&mut self, _out: &mut [u8]) -> Supply {
            Supply::End
        }
    }

    fn serve_once(response: &'static [u8]) -> (u16, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).unwrap();
            stream.write_all(response).unwrap();
        });
        (port, handle)
    }

    fn transfer_for(port: u16) -> Transfer {
        Transfer::new(Endpoint::parse(&format!("http://127.0.0.1:{}/", port)).unwrap())
    }

    #[test]
    fn test_poll_ready_descriptor() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"Hello").unwrap();
        });

        let stream = TcpStream::connect(addr).unwrap();
        let session = Session::new();
        let interest = Interest {
            fd: stream.as_raw_fd(),
            events: PollEvents::Read,
        };

        assert_eq!(session.poll(&[interest], Duration::from_secs(1)).unwrap(), 1);
        handle.join().unwrap();
    }

    #[test]
    fn test_poll_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let session = Session::new();
        let interest = Interest {
            fd: stream.as_raw_fd(),
            events: PollEvents::Read,
        };

        let start = Instant::now();
        assert_eq!(session.poll(&[interest], Duration::from_millis(50)).unwrap(), 0);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_perform_until_completion() {
        let (port, server) = serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");

        let mut session = Session::new();
        let id = session.register(transfer_for(port));
        let mut sink = Sink::default();

        let mut running = 1;
        while running > 0 {
            if let Perform::Running(n) = session.perform(&mut sink) {
                running = n;
            }
            if running > 0 {
                let interests = session.readiness();
                session.poll(&interests, Duration::from_millis(100)).unwrap();
            }
        }
        server.join().unwrap();

        assert_eq!(sink.body, b"ok");
        assert_eq!(
            session.info_read(),
            Some(Completion {
                id,
                result: Ok(())
            })
        );
        assert_eq!(session.info_read(), None);
        assert_eq!(session.transfer(id).unwrap().response_code(), 200);
    }

    #[test]
    fn test_remove_and_register_again() {
        let (port, server) = serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");

        let mut session = Session::new();
        let first = session.register(transfer_for(port));
        assert_eq!(session.running(), 1);
        assert!(session.timeout().is_none());

        let mut transfer = session.remove(first).unwrap();
        assert!(session.is_empty());
        assert!(session.remove(first).is_none());

        transfer.set_endpoint(Endpoint::parse(&format!("http://127.0.0.1:{}/other", port)).unwrap());
        let second = session.register(transfer);
        assert_ne!(first, second);

        let mut sink = Sink::default();
        for _ in 0..1000 {
            if session.perform(&mut sink) == Perform::Running(0) {
                break;
            }
            let interests = session.readiness();
            session.poll(&interests, Duration::from_millis(10)).unwrap();
        }
        server.join().unwrap();

        let completion = session.info_read().unwrap();
        assert_eq!(completion.id, second);
        assert_eq!(completion.result, Ok(()));
    }

    #[test]
    fn test_failed_transfer_reports_code() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let mut session = Session::new();
        let id = session.register(transfer_for(port));
        let mut sink = Sink::default();
        for _ in 0..1000 {
            if session.perform(&mut sink) == Perform::Running(0) {
                break;
            }
            let interests = session.readiness();
            session.poll(&interests, Duration::from_millis(10)).unwrap();
        }

        let completion = session.info_read().unwrap();
        assert_eq!(completion.id, id);
        assert_eq!(completion.result, Err(TransferCode::CouldntConnect));
        assert!(session.readiness().is_empty());
    }
}

//! Scripted transports and callback recorders for unit tests.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use mio::{event::Source, Interest, Registry, Token};
use parking_lot::Mutex;

use crate::net::handle::{KeepAlive, SocketHandle, SocketKind, Transport};
use crate::net::server::{Acceptor, ServerCallbacks};
use crate::net::state::SocketConnectionState;
use crate::net::traits::{Connection, SocketId};

/// One scripted outcome of `recv`.
#[derive(Debug, Clone)]
pub enum MockRead {
    Data(Vec<u8>),
    Eof,
    Fail(io::ErrorKind),
}

#[derive(Default)]
struct MockState {
    reads: VecDeque<MockRead>,
    written: Vec<u8>,
    // `None` accepts everything, `Some(n)` accepts n more bytes.
    send_budget: Option<usize>,
    keepalive_calls: Vec<KeepAlive>,
    refuse_keepalive: bool,
    session_id: Option<String>,
    fail_session_id: bool,
    fail_nonblocking: bool,
    socket_error: Option<io::ErrorKind>,
    nonblocking: Option<bool>,
    write_shutdowns: usize,
    registrations: usize,
    deregistrations: usize,
    dropped: bool,
}

/// Transport whose reads, writes and options are driven by a [`MockProbe`].
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

/// Test-side view of a [`MockTransport`], usable after the transport moved.
#[derive(Clone)]
pub struct MockProbe {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> (MockTransport, MockProbe) {
        let state = Arc::new(Mutex::new(MockState::default()));
        (
            MockTransport {
                state: Arc::clone(&state),
            },
            MockProbe { state },
        )
    }

    pub fn handle(kind: SocketKind) -> (SocketHandle, MockProbe) {
        let (transport, probe) = Self::new();
        (SocketHandle::new(kind, Box::new(transport)), probe)
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        self.state.lock().dropped = true;
    }
}

impl Source for MockTransport {
    fn register(&mut self, _: &Registry, _: Token, _: Interest) -> io::Result<()> {
        self.state.lock().registrations += 1;
        Ok(())
    }

    fn reregister(&mut self, _: &Registry, _: Token, _: Interest) -> io::Result<()> {
        Ok(())
    }

    fn deregister(&mut self, _: &Registry) -> io::Result<()> {
        self.state.lock().deregistrations += 1;
        Ok(())
    }
}

impl Transport for MockTransport {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        match state.reads.pop_front() {
            None => Err(io::ErrorKind::WouldBlock.into()),
            Some(MockRead::Eof) => Ok(0),
            Some(MockRead::Fail(kind)) => Err(kind.into()),
            Some(MockRead::Data(mut bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                if n < bytes.len() {
                    bytes.drain(..n);
                    state.reads.push_front(MockRead::Data(bytes));
                }
                Ok(n)
            }
        }
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        let n = match state.send_budget {
            None => buf.len(),
            Some(0) => return Err(io::ErrorKind::WouldBlock.into()),
            Some(budget) => {
                let n = budget.min(buf.len());
                state.send_budget = Some(budget - n);
                n
            }
        };
        state.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(SocketAddr::from(([127, 0, 0, 1], 1935)))
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(SocketAddr::from(([127, 0, 0, 1], 40000)))
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.fail_nonblocking {
            return Err(io::Error::new(io::ErrorKind::Other, "mode switch refused"));
        }
        state.nonblocking = Some(nonblocking);
        Ok(())
    }

    fn set_keepalive(&self, keepalive: &KeepAlive) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.refuse_keepalive {
            return Err(io::ErrorKind::Unsupported.into());
        }
        state.keepalive_calls.push(*keepalive);
        Ok(())
    }

    fn session_id(&self, _max_len: usize) -> io::Result<Option<String>> {
        let state = self.state.lock();
        if state.fail_session_id {
            return Err(io::Error::new(io::ErrorKind::Other, "no handshake"));
        }
        Ok(state.session_id.clone())
    }

    fn shutdown_write(&mut self) -> io::Result<()> {
        self.state.lock().write_shutdowns += 1;
        Ok(())
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        Ok(self.state.lock().socket_error.take().map(io::Error::from))
    }
}

impl MockProbe {
    pub fn push_read(&self, read: MockRead) {
        self.state.lock().reads.push_back(read);
    }

    pub fn pending_reads(&self) -> usize {
        self.state.lock().reads.len()
    }

    pub fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    pub fn block_sends(&self) {
        self.state.lock().send_budget = Some(0);
    }

    /// Lets `n` more bytes through, then blocks again.
    pub fn allow_sends(&self, n: usize) {
        self.state.lock().send_budget = Some(n);
    }

    pub fn unblock_sends(&self) {
        self.state.lock().send_budget = None;
    }

    pub fn keepalive_calls(&self) -> Vec<KeepAlive> {
        self.state.lock().keepalive_calls.clone()
    }

    pub fn refuse_keepalive(&self) {
        self.state.lock().refuse_keepalive = true;
    }

    pub fn set_session_id(&self, id: &str) {
        self.state.lock().session_id = Some(id.to_string());
    }

    pub fn fail_session_id(&self) {
        self.state.lock().fail_session_id = true;
    }

    pub fn fail_nonblocking(&self) {
        self.state.lock().fail_nonblocking = true;
    }

    /// Error reported once by the next `take_error`.
    pub fn set_socket_error(&self, kind: io::ErrorKind) {
        self.state.lock().socket_error = Some(kind);
    }

    pub fn nonblocking(&self) -> Option<bool> {
        self.state.lock().nonblocking
    }

    pub fn write_shutdowns(&self) -> usize {
        self.state.lock().write_shutdowns
    }

    pub fn registrations(&self) -> usize {
        self.state.lock().registrations
    }

    pub fn deregistrations(&self) -> usize {
        self.state.lock().deregistrations
    }

    pub fn is_dropped(&self) -> bool {
        self.state.lock().dropped
    }
}

/// Acceptor fed from the test through the queue returned by
/// [`MockAcceptor::new`].
pub struct MockAcceptor {
    pending: Arc<Mutex<VecDeque<SocketHandle>>>,
    fail_next: Option<io::ErrorKind>,
}

impl MockAcceptor {
    pub fn new() -> (MockAcceptor, Arc<Mutex<VecDeque<SocketHandle>>>) {
        let pending = Arc::new(Mutex::new(VecDeque::new()));
        (
            MockAcceptor {
                pending: Arc::clone(&pending),
                fail_next: None,
            },
            pending,
        )
    }

    /// Makes the first `accept` fail with `kind`, queue untouched.
    pub fn fail_next(mut self, kind: io::ErrorKind) -> Self {
        self.fail_next = Some(kind);
        self
    }
}

impl Source for MockAcceptor {
    fn register(&mut self, _: &Registry, _: Token, _: Interest) -> io::Result<()> {
        Ok(())
    }

    fn reregister(&mut self, _: &Registry, _: Token, _: Interest) -> io::Result<()> {
        Ok(())
    }

    fn deregister(&mut self, _: &Registry) -> io::Result<()> {
        Ok(())
    }
}

impl Acceptor for MockAcceptor {
    fn accept(&mut self) -> io::Result<(SocketHandle, SocketAddr)> {
        if let Some(kind) = self.fail_next.take() {
            return Err(kind.into());
        }
        let handle = self
            .pending
            .lock()
            .pop_front()
            .ok_or(io::ErrorKind::WouldBlock)?;
        let peer = handle.transport().peer_addr()?;
        Ok((handle, peer))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(SocketAddr::from(([127, 0, 0, 1], 1935)))
    }
}

/// What a [`Recorder`] saw, in callback order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    State(SocketId, SocketConnectionState, Option<String>),
    Data(SocketId, Vec<u8>),
}

/// Collects every connection and data callback.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<Recorded>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callbacks(&self) -> ServerCallbacks {
        let on_state = Arc::clone(&self.events);
        let on_data = Arc::clone(&self.events);
        ServerCallbacks::new()
            .on_connection(move |client, state, error| {
                on_state.lock().push(Recorded::State(
                    client.id(),
                    state,
                    error.map(ToString::to_string),
                ));
            })
            .on_data(move |client, buffer| {
                on_data
                    .lock()
                    .push(Recorded::Data(client.id(), buffer.into_vec()));
            })
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().clone()
    }

    pub fn for_socket(&self, id: SocketId) -> Vec<Recorded> {
        self.events()
            .into_iter()
            .filter(|event| match event {
                Recorded::State(socket, ..) | Recorded::Data(socket, _) => *socket == id,
            })
            .collect()
    }

    pub fn states(&self, id: SocketId) -> Vec<SocketConnectionState> {
        self.for_socket(id)
            .into_iter()
            .filter_map(|event| match event {
                Recorded::State(_, state, _) => Some(state),
                Recorded::Data(..) => None,
            })
            .collect()
    }

    pub fn data(&self, id: SocketId) -> Vec<Vec<u8>> {
        self.for_socket(id)
            .into_iter()
            .filter_map(|event| match event {
                Recorded::Data(_, bytes) => Some(bytes),
                Recorded::State(..) => None,
            })
            .collect()
    }
}

//! The socket core shared by every connection type.
//!
//! A [`Socket`] owns one [`SocketHandle`] behind a mutex, so at most one I/O
//! call runs against the native socket at any time. It also carries the
//! connection state machine, the address pair, the idle-timeout clock and the
//! per-socket queue of [`DispatchCommand`]s that its worker feeds.
//!
//! ```text
//!  Created ──prepare()──▶ Prepared ──on_connected──▶ Connected
//!     │                      │                          │
//!     │ setup failure        │                          ├─close()─▶ Disconnecting ─▶ Disconnected ─┐
//!     ▼                      ▼                          │                                            │
//!   Error                  Closed ◀──────── peer close / I/O error / idle timeout ◀─────────────────┘
//! ```
//!
//! Releasing the handle is arbitrated by the compare-and-swap into `Closed`:
//! whichever caller wins deregisters and drops the handle, every other caller
//! sees `Closed` and returns.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{Interest, Registry, Token};
use parking_lot::Mutex;

use crate::buffer::Buffer;
use crate::error::{NetworkError, Result};
use crate::event::DispatchCommand;
use crate::net::address::SocketAddress;
use crate::net::handle::{SocketHandle, SocketKind, Transport, TCP_KEEPALIVE};
use crate::net::state::{AtomicState, ConnectionState};
use crate::net::traits::{LogLevel, Logger, SocketId};
use crate::worker::{WorkerId, WorkerLink};

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_socket_id() -> SocketId {
    SocketId(NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed))
}

/// Outcome of a single non-blocking send or receive.
#[derive(Debug)]
pub enum IoStatus {
    /// The call moved this many bytes.
    Done(usize),
    /// Nothing could be moved right now; wait for the next readiness event.
    WouldBlock,
    /// The connection is unusable.
    Failed(NetworkError),
}

impl IoStatus {
    pub fn is_would_block(&self) -> bool {
        matches!(self, IoStatus::WouldBlock)
    }

    pub fn bytes(&self) -> Option<usize> {
        match self {
            IoStatus::Done(n) => Some(*n),
            _ => None,
        }
    }
}

pub struct Socket {
    id: SocketId,
    kind: SocketKind,
    handle: Mutex<Option<SocketHandle>>,
    state: AtomicState,
    local: Option<SocketAddress>,
    remote: Option<SocketAddress>,
    interest: Interest,
    created_at: Instant,
    // Milliseconds after `created_at`.
    last_send: AtomicU64,
    link: Mutex<Option<WorkerLink>>,
    commands: Mutex<VecDeque<DispatchCommand>>,
    logger: Arc<dyn Logger>,
}

impl Socket {
    /// Takes ownership of `handle`. The addresses are read once, here.
    pub fn new(handle: SocketHandle, logger: Arc<dyn Logger>) -> Self {
        let kind = handle.kind();
        let local = handle.transport().local_addr().ok().map(SocketAddress::from);
        let remote = handle.transport().peer_addr().ok().map(SocketAddress::from);

        Self {
            id: next_socket_id(),
            kind,
            handle: Mutex::new(Some(handle)),
            state: AtomicState::new(ConnectionState::Created),
            local,
            remote,
            interest: Interest::READABLE | Interest::WRITABLE,
            created_at: Instant::now(),
            last_send: AtomicU64::new(0),
            link: Mutex::new(None),
            commands: Mutex::new(VecDeque::new()),
            logger,
        }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn local_address(&self) -> Option<SocketAddress> {
        self.local
    }

    pub fn remote_address(&self) -> Option<SocketAddress> {
        self.remote
    }

    pub fn interest(&self) -> Interest {
        self.interest
    }

    /// Worker this socket is pinned to, if it has been attached.
    pub fn worker_id(&self) -> Option<WorkerId> {
        self.link.lock().as_ref().map(WorkerLink::worker)
    }

    /// Whether the socket still owns a native handle.
    pub fn has_handle(&self) -> bool {
        self.handle.lock().is_some()
    }

    pub(crate) fn advance(&self, next: ConnectionState) -> Option<ConnectionState> {
        self.state.advance(next)
    }

    pub(crate) fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state.transition(from, to)
    }

    pub(crate) fn log(&self, level: LogLevel, message: impl fmt::Display) {
        self.logger
            .log(level, &format!("[{} {}] {}", self.kind, self.id, message));
    }

    pub(crate) fn with_handle<R>(&self, f: impl FnOnce(&mut SocketHandle) -> R) -> Option<R> {
        self.handle.lock().as_mut().map(f)
    }

    /// Applies the generic options for this socket's protocol.
    ///
    /// TCP gets keep-alive ([`TCP_KEEPALIVE`]). UDP and reliable UDP get
    /// nothing: their tuning belongs to protocol negotiation.
    pub fn set_options(&self) -> Result<()> {
        let guard = self.handle.lock();
        let handle = guard.as_ref().ok_or(NetworkError::Closed)?;

        match handle.kind() {
            SocketKind::Tcp => handle
                .transport()
                .set_keepalive(&TCP_KEEPALIVE)
                .map_err(|e| match e.kind() {
                    io::ErrorKind::Unsupported => NetworkError::UnsupportedOption(SocketKind::Tcp),
                    _ => NetworkError::Io(e),
                }),
            SocketKind::Udp | SocketKind::ReliableUdp => Ok(()),
        }
    }

    pub fn make_nonblocking(&self) -> Result<()> {
        let guard = self.handle.lock();
        let handle = guard.as_ref().ok_or(NetworkError::Closed)?;
        handle.transport().set_nonblocking(true)?;
        Ok(())
    }

    /// Sends as much of `data` as the transport takes without blocking.
    pub fn send(&self, data: &[u8]) -> IoStatus {
        let mut guard = self.handle.lock();
        let Some(handle) = guard.as_mut() else {
            return IoStatus::Failed(NetworkError::Closed);
        };

        loop {
            match handle.transport_mut().send(data) {
                Ok(n) => {
                    if n > 0 {
                        self.touch_send();
                    }
                    return IoStatus::Done(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return IoStatus::WouldBlock,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return IoStatus::Failed(NetworkError::Io(e)),
            }
        }
    }

    /// Replaces the contents of `buffer` with the next chunk of input.
    ///
    /// A zero-byte read from a stream transport means the peer closed and is
    /// reported as [`NetworkError::PeerClosed`]. Datagram transports may
    /// legitimately yield `Done(0)`.
    pub fn recv(&self, buffer: &mut Buffer) -> IoStatus {
        let mut guard = self.handle.lock();
        let Some(handle) = guard.as_mut() else {
            return IoStatus::Failed(NetworkError::Closed);
        };

        buffer.clear();
        if buffer.limit() == 0 {
            return IoStatus::Done(0);
        }

        let stream = handle.kind().is_stream();
        loop {
            match buffer.fill_with(|tail| handle.transport_mut().recv(tail)) {
                Ok(0) if stream => return IoStatus::Failed(NetworkError::PeerClosed),
                Ok(n) => return IoStatus::Done(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return IoStatus::WouldBlock,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return IoStatus::Failed(NetworkError::Io(e)),
            }
        }
    }

    /// Cause of an error readiness, read from the socket itself.
    pub(crate) fn take_error(&self) -> NetworkError {
        match self.with_handle(|handle| handle.transport().take_error()) {
            Some(Ok(Some(e))) | Some(Err(e)) => NetworkError::Io(e),
            Some(Ok(None)) | None => NetworkError::SocketError,
        }
    }

    pub(crate) fn shutdown_write(&self) -> io::Result<()> {
        self.with_handle(|handle| handle.transport_mut().shutdown_write())
            .unwrap_or(Ok(()))
    }

    fn touch_send(&self) {
        let elapsed = self.created_at.elapsed().as_millis() as u64;
        self.last_send.fetch_max(elapsed, Ordering::AcqRel);
    }

    /// Time of the last successful send, or creation time if none happened.
    pub fn last_send(&self) -> Instant {
        self.created_at + Duration::from_millis(self.last_send.load(Ordering::Acquire))
    }

    /// Whether `now` is at least `timeout` past the last successful send.
    pub fn is_idle_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_send()) >= timeout
    }

    pub fn append_command(&self, command: DispatchCommand) {
        self.commands.lock().push_back(command);
    }

    pub(crate) fn pop_command(&self) -> Option<DispatchCommand> {
        self.commands.lock().pop_front()
    }

    pub(crate) fn clear_commands(&self) {
        self.commands.lock().clear();
    }

    pub fn pending_commands(&self) -> usize {
        self.commands.lock().len()
    }

    pub(crate) fn bind_worker(&self, link: WorkerLink) {
        *self.link.lock() = Some(link);
    }

    /// Has the owning worker drain this socket's queue from its own thread.
    pub(crate) fn schedule(&self) -> bool {
        self.link.lock().as_ref().is_some_and(WorkerLink::schedule)
    }

    pub(crate) fn register(&self, registry: &Registry, token: Token) -> io::Result<()> {
        if self.state().is_terminal() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "socket released"));
        }
        let interest = self.interest;
        self.with_handle(|handle| registry.register(handle.transport_mut(), token, interest))
            .unwrap_or_else(|| Err(io::Error::new(io::ErrorKind::NotConnected, "socket released")))
    }

    /// Moves the socket to `Closed` and drops its handle.
    ///
    /// Returns the state that was left, or `None` if another caller already
    /// released the socket.
    pub(crate) fn release(&self) -> Option<ConnectionState> {
        let previous = self.state.advance(ConnectionState::Closed)?;
        self.drop_handle();
        Some(previous)
    }

    /// Marks the socket failed and drops its handle. Used when setup aborts.
    pub(crate) fn abort(&self) -> Option<ConnectionState> {
        let previous = self.state.advance(ConnectionState::Error)?;
        self.drop_handle();
        Some(previous)
    }

    fn drop_handle(&self) {
        let handle = self.handle.lock().take();
        let link = self.link.lock().take();

        match (handle, link) {
            (Some(mut handle), Some(link)) => link.detach(Some(handle.transport_mut())),
            (None, Some(link)) => link.detach::<dyn Transport>(None),
            _ => {}
        }
    }

    /// Releases the socket. Repeated calls are no-ops.
    pub fn close(&self) -> Result<()> {
        if self.release().is_some() {
            self.log(LogLevel::Debug, "closed");
        }
        Ok(())
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("remote", &self.remote)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::testing::{MockRead, MockTransport};
    use crate::net::traits::NoOpLogger;

    fn socket(kind: SocketKind) -> (Socket, crate::net::testing::MockProbe) {
        let (transport, probe) = MockTransport::new();
        let handle = SocketHandle::new(kind, Box::new(transport));
        (Socket::new(handle, Arc::new(NoOpLogger)), probe)
    }

    #[test]
    fn test_addresses_read_from_transport() {
        let (socket, _) = socket(SocketKind::Tcp);
        assert_eq!(socket.remote_address().unwrap().port(), 40000);
        assert_eq!(socket.local_address().unwrap().port(), 1935);
    }

    #[test]
    fn test_tcp_options_set_keepalive() {
        let (socket, probe) = socket(SocketKind::Tcp);
        socket.set_options().unwrap();
        assert_eq!(probe.keepalive_calls(), vec![TCP_KEEPALIVE]);
        assert_eq!(TCP_KEEPALIVE.idle, Duration::from_secs(30));
        assert_eq!(TCP_KEEPALIVE.interval, Duration::from_secs(10));
        assert_eq!(TCP_KEEPALIVE.probes, 3);
    }

    #[test]
    fn test_datagram_kinds_skip_generic_options() {
        for kind in [SocketKind::Udp, SocketKind::ReliableUdp] {
            let (socket, probe) = socket(kind);
            socket.set_options().unwrap();
            assert!(probe.keepalive_calls().is_empty(), "{kind} must not touch keep-alive");
        }
    }

    #[test]
    fn test_tcp_options_on_incapable_transport_fail() {
        let (socket, probe) = socket(SocketKind::Tcp);
        probe.refuse_keepalive();
        assert!(matches!(
            socket.set_options(),
            Err(NetworkError::UnsupportedOption(SocketKind::Tcp))
        ));
    }

    #[test]
    fn test_recv_tri_state() {
        let (socket, probe) = socket(SocketKind::Tcp);
        probe.push_read(MockRead::Data(b"abc".to_vec()));
        probe.push_read(MockRead::Fail(io::ErrorKind::ConnectionReset));

        let mut buffer = Buffer::with_capacity(64);
        assert_eq!(socket.recv(&mut buffer).bytes(), Some(3));
        assert_eq!(buffer.as_slice(), b"abc");
        assert!(matches!(socket.recv(&mut buffer), IoStatus::Failed(NetworkError::Io(_))));
        assert!(socket.recv(&mut buffer).is_would_block());
    }

    #[test]
    fn test_zero_read_depends_on_kind() {
        let (tcp, tcp_probe) = socket(SocketKind::Tcp);
        tcp_probe.push_read(MockRead::Eof);
        let mut buffer = Buffer::with_capacity(16);
        assert!(matches!(
            tcp.recv(&mut buffer),
            IoStatus::Failed(NetworkError::PeerClosed)
        ));

        let (udp, udp_probe) = socket(SocketKind::Udp);
        udp_probe.push_read(MockRead::Eof);
        assert_eq!(udp.recv(&mut buffer).bytes(), Some(0));
    }

    #[test]
    fn test_interrupted_is_retried() {
        let (socket, probe) = socket(SocketKind::Tcp);
        probe.push_read(MockRead::Fail(io::ErrorKind::Interrupted));
        probe.push_read(MockRead::Data(b"x".to_vec()));
        let mut buffer = Buffer::with_capacity(8);
        assert_eq!(socket.recv(&mut buffer).bytes(), Some(1));
    }

    #[test]
    fn test_send_updates_idle_clock() {
        let (socket, probe) = socket(SocketKind::Tcp);
        let later = Instant::now() + Duration::from_secs(61);
        assert!(socket.is_idle_expired(later, Duration::from_secs(60)));

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(socket.send(b"ping").bytes(), Some(4));
        assert_eq!(probe.written(), b"ping");
        assert!(socket.last_send() > socket.created_at);

        probe.block_sends();
        assert!(socket.send(b"pong").is_would_block());
    }

    #[test]
    fn test_close_is_idempotent_and_drops_handle() {
        let (socket, probe) = socket(SocketKind::Tcp);
        socket.close().unwrap();
        assert!(probe.is_dropped());
        assert_eq!(socket.state(), ConnectionState::Closed);

        socket.close().unwrap();
        assert!(matches!(socket.send(b"late"), IoStatus::Failed(NetworkError::Closed)));
    }

    #[test]
    fn test_release_has_one_winner() {
        let (socket, _) = socket(SocketKind::Udp);
        assert_eq!(socket.release(), Some(ConnectionState::Created));
        assert_eq!(socket.release(), None);
        assert_eq!(socket.abort(), None);
    }
}

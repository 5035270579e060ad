//! Accepted connections.
//!
//! A [`ClientSocket`] is a [`Socket`] bound to one peer. Its handlers run on
//! the owning worker's thread and are serialized by a re-entrant dispatch
//! guard, which is also taken by [`close`](ClientSocket::close) when it is
//! called from any other thread. Re-entrancy lets callbacks close their own
//! connection. A thread never blocks on a second client's guard while it
//! holds one: such a close is handed to the owning worker instead.
//!
//! Callback contract per connection:
//!
//! ```text
//! Connected  (data)*  (Disconnect | Disconnected)
//! ```
//!
//! A connection that never reached `Connected` produces no callbacks at all.

use std::cell::Cell;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use mio::{Interest, Registry, Token};
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};

use crate::buffer::{Buffer, BufferPool};
use crate::error::{NetworkError, Result};
use crate::event::DispatchCommand;
use crate::handler::{DispatchOutcome, DispatchTarget};
use crate::net::address::SocketAddress;
use crate::net::config::ServerConfig;
use crate::net::handle::{SocketHandle, SocketKind, MAX_SESSION_ID_LEN};
use crate::net::server::{ServerCallbacks, ServerCore};
use crate::net::socket::{IoStatus, Socket};
use crate::net::state::{ConnectionState, SocketConnectionState};
use crate::net::traits::{Connection, LogLevel, SocketId};
use crate::worker::{WorkerId, WorkerLink};

thread_local! {
    // Dispatch guards held by this thread, over all clients.
    static HELD_GUARDS: Cell<usize> = const { Cell::new(0) };
}

fn holds_dispatch_guard() -> bool {
    HELD_GUARDS.with(|held| held.get() > 0)
}

/// A client's dispatch guard, counted per thread.
struct DispatchGuard<'a> {
    _inner: ReentrantMutexGuard<'a, ()>,
}

impl<'a> DispatchGuard<'a> {
    fn new(inner: ReentrantMutexGuard<'a, ()>) -> Self {
        HELD_GUARDS.with(|held| held.set(held.get() + 1));
        Self { _inner: inner }
    }
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        HELD_GUARDS.with(|held| held.set(held.get() - 1));
    }
}

pub struct ClientSocket {
    socket: Socket,
    server: Weak<ServerCore>,
    callbacks: ServerCallbacks,
    session_id: OnceLock<String>,
    backlog: Mutex<Buffer>,
    max_read_per_dispatch: usize,
    idle_timeout: Duration,
    buffers: BufferPool,
    guard: ReentrantMutex<()>,
    // Graceful close left to the owning worker.
    close_requested: AtomicBool,
    weak_self: Weak<ClientSocket>,
}

impl ClientSocket {
    pub(crate) fn new(
        handle: SocketHandle,
        server: Weak<ServerCore>,
        callbacks: ServerCallbacks,
        config: &ServerConfig,
        buffers: BufferPool,
    ) -> Arc<Self> {
        let socket = Socket::new(handle, Arc::clone(&config.logger));
        Arc::new_cyclic(|weak_self| Self {
            socket,
            server,
            callbacks,
            session_id: OnceLock::new(),
            backlog: Mutex::new(Buffer::bounded(config.max_send_backlog)),
            max_read_per_dispatch: config.max_read_per_dispatch,
            idle_timeout: config.idle_timeout,
            buffers,
            guard: ReentrantMutex::new(()),
            close_requested: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        })
    }

    /// Makes the socket ready for a worker.
    ///
    /// Reliable-UDP sockets first read their negotiated session id. Then the
    /// protocol options are applied and the handle switches to non-blocking
    /// mode. On success the socket is `Prepared` and holds a queued
    /// `Connected` command. On failure it is moved to `Error`, its handle is
    /// dropped and it must not be attached.
    pub fn prepare(&self) -> Result<()> {
        let _guard = self.enter();
        if self.state() != ConnectionState::Created {
            return Err(NetworkError::Setup(format!(
                "cannot prepare a socket in state {}",
                self.state()
            )));
        }

        if self.kind() == SocketKind::ReliableUdp {
            let _ = self.session_id.set(self.negotiated_session_id());
        }

        let setup = self
            .socket
            .set_options()
            .and_then(|_| self.socket.make_nonblocking());
        if let Err(e) = setup {
            self.socket.abort();
            self.socket
                .log(LogLevel::Warn, format_args!("setup failed: {}", e));
            return Err(NetworkError::Setup(e.to_string()));
        }

        if !self
            .socket
            .transition(ConnectionState::Created, ConnectionState::Prepared)
        {
            return Err(NetworkError::Setup("socket closed during setup".to_string()));
        }
        self.socket.append_command(DispatchCommand::Connected);
        Ok(())
    }

    fn negotiated_session_id(&self) -> String {
        let negotiated = self
            .socket
            .with_handle(|handle| handle.transport().session_id(MAX_SESSION_ID_LEN));

        match negotiated {
            Some(Ok(Some(id))) => truncate_at_char_boundary(id, MAX_SESSION_ID_LEN),
            Some(Err(e)) => {
                self.socket.log(
                    LogLevel::Debug,
                    format_args!("no session id negotiated: {}", e),
                );
                String::new()
            }
            Some(Ok(None)) | None => String::new(),
        }
    }

    /// Session id negotiated by a reliable-UDP transport. Empty for every
    /// other kind and when negotiation produced none.
    pub fn session_id(&self) -> &str {
        self.session_id.get().map(String::as_str).unwrap_or("")
    }

    pub fn worker_id(&self) -> Option<WorkerId> {
        self.socket.worker_id()
    }

    /// Bytes queued for the peer but not yet written.
    pub fn backlog_len(&self) -> usize {
        self.backlog.lock().len()
    }

    pub fn last_send(&self) -> Instant {
        self.socket.last_send()
    }

    fn enter(&self) -> DispatchGuard<'_> {
        DispatchGuard::new(self.guard.lock())
    }

    fn try_enter(&self) -> Option<DispatchGuard<'_>> {
        self.guard.try_lock().map(DispatchGuard::new)
    }

    fn on_connected(self: &Arc<Self>) {
        if !self
            .socket
            .transition(ConnectionState::Prepared, ConnectionState::Connected)
        {
            return;
        }
        self.socket.log(LogLevel::Debug, "connected");
        if let Some(callback) = self.callbacks.connection_callback() {
            callback(self, SocketConnectionState::Connected, None);
        }
    }

    fn on_readable(self: &Arc<Self>) -> DispatchOutcome {
        let mut scratch = self.buffers.acquire();
        let mut drained = 0;

        loop {
            if self.state() != ConnectionState::Connected
                || self.close_requested.load(Ordering::Acquire)
            {
                return DispatchOutcome::Idle;
            }
            if drained >= self.max_read_per_dispatch {
                return DispatchOutcome::Rearm;
            }

            match self.socket.recv(&mut scratch) {
                IoStatus::Done(0) | IoStatus::WouldBlock => return DispatchOutcome::Idle,
                IoStatus::Done(n) => {
                    drained += n;
                    if let Some(callback) = self.callbacks.data_callback() {
                        callback(self, (*scratch).clone());
                    }
                }
                IoStatus::Failed(NetworkError::Closed) => return DispatchOutcome::Idle,
                IoStatus::Failed(NetworkError::PeerClosed) => {
                    self.finish(None);
                    return DispatchOutcome::Idle;
                }
                IoStatus::Failed(e) => {
                    self.finish(Some(e));
                    return DispatchOutcome::Idle;
                }
            }
        }
    }

    fn on_writable(&self) {
        if let Err(e) = self.flush_backlog() {
            self.finish(Some(e));
        }
    }

    /// A bare error readiness is replaced by the error pending on the socket.
    fn on_closed(&self, error: Option<NetworkError>) {
        let error = match error {
            Some(NetworkError::SocketError) => Some(self.socket.take_error()),
            other => other,
        };
        self.finish(error);
    }

    /// Writes queued bytes until the backlog is empty or the peer stops
    /// accepting.
    fn flush_backlog(&self) -> Result<()> {
        let mut backlog = self.backlog.lock();
        while !backlog.is_empty() {
            match self.socket.send(backlog.as_slice()) {
                IoStatus::Done(0) | IoStatus::WouldBlock => break,
                IoStatus::Done(n) => backlog.consume(n),
                IoStatus::Failed(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Releases the socket and, for the single caller that wins the release,
    /// reports the terminal state. The server registry is always told.
    fn finish(&self, error: Option<NetworkError>) {
        let _guard = self.enter();

        if let Some(previous) = self.socket.release() {
            self.socket.clear_commands();
            self.backlog.lock().clear();

            if previous >= ConnectionState::Connected {
                let state = if previous == ConnectionState::Disconnected {
                    SocketConnectionState::Disconnected
                } else {
                    SocketConnectionState::Disconnect
                };
                match &error {
                    Some(e) => self
                        .socket
                        .log(LogLevel::Info, format_args!("{} ({})", state, e)),
                    None => self.socket.log(LogLevel::Debug, state),
                }

                if let (Some(callback), Some(this)) =
                    (self.callbacks.connection_callback(), self.weak_self.upgrade())
                {
                    callback(&this, state, error.as_ref());
                }
            }
        }

        if let Some(server) = self.server.upgrade() {
            server.on_client_disconnected(self.id());
        }
    }

    /// Hands the close to the owning worker so a sender on another thread
    /// never waits on this socket's dispatch guard. Detached sockets close
    /// in place.
    fn close_backlog_full(&self, limit: usize) {
        self.socket
            .append_command(DispatchCommand::Closed(Some(NetworkError::BacklogFull(limit))));
        if !self.socket.schedule() {
            self.finish(Some(NetworkError::BacklogFull(limit)));
        }
    }

    /// Marks a graceful close for the owning worker's next dispatch.
    /// Returns `false` for detached sockets.
    fn defer_close(&self) -> bool {
        self.close_requested.store(true, Ordering::Release);
        if self.socket.schedule() {
            true
        } else {
            self.close_requested.store(false, Ordering::Release);
            false
        }
    }

    /// Closes the connection gracefully.
    ///
    /// A connected socket moves through `Disconnecting`, flushes what it can,
    /// half-closes its write side and reaches `Disconnected` before being
    /// released, so its terminal callback reports
    /// [`SocketConnectionState::Disconnected`]. Safe from any thread and from
    /// inside callbacks. Repeated calls are no-ops.
    ///
    /// Called from another client's callback while this client is being
    /// dispatched elsewhere, the close is completed by this client's worker
    /// and the call returns before the terminal callback has run.
    pub fn close(&self) -> Result<()> {
        let _guard = match self.try_enter() {
            Some(guard) => guard,
            // Waiting here while holding another guard can deadlock two workers.
            None if holds_dispatch_guard() && self.defer_close() => return Ok(()),
            None => self.enter(),
        };

        if self
            .socket
            .transition(ConnectionState::Connected, ConnectionState::Disconnecting)
        {
            if let Err(e) = self.flush_backlog() {
                self.socket
                    .log(LogLevel::Debug, format_args!("unflushed on close: {}", e));
            }
            if let Err(e) = self.socket.shutdown_write() {
                self.socket
                    .log(LogLevel::Debug, format_args!("write shutdown failed: {}", e));
            }
            self.socket.advance(ConnectionState::Disconnected);
        }

        self.finish(None);
        Ok(())
    }
}

fn truncate_at_char_boundary(mut id: String, max_len: usize) -> String {
    if id.len() > max_len {
        let mut end = max_len;
        while !id.is_char_boundary(end) {
            end -= 1;
        }
        id.truncate(end);
    }
    id
}

impl Connection for ClientSocket {
    fn id(&self) -> SocketId {
        self.socket.id()
    }

    fn kind(&self) -> SocketKind {
        self.socket.kind()
    }

    fn state(&self) -> ConnectionState {
        self.socket.state()
    }

    fn local_address(&self) -> Option<SocketAddress> {
        self.socket.local_address()
    }

    fn remote_address(&self) -> Option<SocketAddress> {
        self.socket.remote_address()
    }

    /// Writes directly while nothing is queued and keeps the rest for the
    /// next writable event. Returns `Done(data.len())` once every byte is
    /// either written or queued. Overflowing the backlog closes the
    /// connection with [`NetworkError::BacklogFull`].
    fn send(&self, data: &[u8]) -> IoStatus {
        if self.state() != ConnectionState::Connected {
            return IoStatus::Failed(NetworkError::Closed);
        }

        let mut backlog = self.backlog.lock();
        let written = if backlog.is_empty() {
            match self.socket.send(data) {
                IoStatus::Done(n) => n,
                IoStatus::WouldBlock => 0,
                failed @ IoStatus::Failed(_) => return failed,
            }
        } else {
            0
        };

        let rest = &data[written..];
        if rest.len() > backlog.remaining() {
            let limit = backlog.limit();
            drop(backlog);
            self.socket.log(
                LogLevel::Warn,
                format_args!("send backlog full at {} bytes", limit),
            );
            self.close_backlog_full(limit);
            return IoStatus::Failed(NetworkError::BacklogFull(limit));
        }
        backlog.append(rest);
        IoStatus::Done(data.len())
    }

    fn recv(&self, buffer: &mut Buffer) -> IoStatus {
        self.socket.recv(buffer)
    }

    fn close(&self) -> Result<()> {
        ClientSocket::close(self)
    }
}

impl DispatchTarget for ClientSocket {
    fn interest(&self) -> Interest {
        self.socket.interest()
    }

    fn register(&self, registry: &Registry, token: Token) -> io::Result<()> {
        self.socket.register(registry, token)
    }

    fn bind(&self, link: WorkerLink) {
        self.socket.bind_worker(link);
    }

    fn append_command(&self, command: DispatchCommand) {
        self.socket.append_command(command);
    }

    fn dispatch_pending(&self) -> DispatchOutcome {
        let Some(this) = self.weak_self.upgrade() else {
            return DispatchOutcome::Idle;
        };
        let _guard = self.enter();

        let mut outcome = DispatchOutcome::Idle;
        loop {
            if self.close_requested.swap(false, Ordering::AcqRel) {
                let _ = this.close();
            }
            let Some(command) = self.socket.pop_command() else {
                break;
            };
            match command {
                DispatchCommand::Connected => this.on_connected(),
                DispatchCommand::Readable => {
                    if this.on_readable() == DispatchOutcome::Rearm {
                        outcome = DispatchOutcome::Rearm;
                    }
                }
                DispatchCommand::Writable => this.on_writable(),
                DispatchCommand::Closed(error) => this.on_closed(error),
            }
        }

        if self.state().is_terminal() {
            DispatchOutcome::Idle
        } else {
            outcome
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        !self.state().is_terminal() && self.socket.is_idle_expired(now, self.idle_timeout)
    }

    fn expire(&self) {
        self.socket.log(LogLevel::Info, "idle timeout");
        self.finish(Some(NetworkError::IdleTimeout));
    }

    fn shutdown(&self) {
        let _ = ClientSocket::close(self);
    }
}

impl fmt::Debug for ClientSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSocket")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("state", &self.state())
            .field("remote", &self.remote_address())
            .field("session_id", &self.session_id())
            .finish()
    }
}

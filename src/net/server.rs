//! Listening side: accept loop, client registry and callback pair.
//!
//! The registry is a lock-free map shared by the accept path, the workers
//! (which remove clients as they close) and application threads.
//!
//! ```text
//!   accept() ──▶ ClientSocket::new ──▶ prepare() ──▶ registry.insert ──▶ pool.attach
//!                                          │
//!                                          └─ failure: dropped before registration
//!
//!   ClientSocket::finish ──▶ connection callback ──▶ on_client_disconnected ──▶ registry.remove
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use lockfree::map::Map as LockfreeMap;
use mio::event::Source;
use mio::net::TcpListener;
use mio::{Interest, Registry, Token};
use parking_lot::Mutex;

use crate::buffer::{Buffer, BufferPool};
use crate::error::{NetworkError, Result};
use crate::event::DispatchCommand;
use crate::handler::{DispatchOutcome, DispatchTarget};
use crate::net::address::SocketAddress;
use crate::net::client::ClientSocket;
use crate::net::config::ServerConfig;
use crate::net::handle::SocketHandle;
use crate::net::socket::IoStatus;
use crate::net::state::SocketConnectionState;
use crate::net::traits::{
    Connection, ConnectionCallback, DataCallback, LogLevel, SocketId,
};
use crate::pool::SocketPool;
use crate::worker::WorkerLink;

/// Receive buffers kept warm per server.
const POOLED_RECV_BUFFERS: usize = 20;

/// Source of accepted connections for a [`ServerSocket`].
pub trait Acceptor: Source + Send {
    /// Next pending connection, or `WouldBlock` when none is left.
    fn accept(&mut self) -> io::Result<(SocketHandle, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Acceptor for TcpListener {
    fn accept(&mut self) -> io::Result<(SocketHandle, SocketAddr)> {
        let (stream, peer) = TcpListener::accept(self)?;
        Ok((SocketHandle::tcp(stream), peer))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// The connection and data callbacks a server hands to every client.
///
/// Set once through the builder methods, read-only afterwards.
#[derive(Clone, Default)]
pub struct ServerCallbacks {
    connection: Option<ConnectionCallback>,
    data: Option<DataCallback>,
}

impl ServerCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connection<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Arc<ClientSocket>, SocketConnectionState, Option<&NetworkError>)
            + Send
            + Sync
            + 'static,
    {
        self.connection = Some(Arc::new(callback));
        self
    }

    pub fn on_data<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Arc<ClientSocket>, Buffer) + Send + Sync + 'static,
    {
        self.data = Some(Arc::new(callback));
        self
    }

    pub fn connection_callback(&self) -> Option<&ConnectionCallback> {
        self.connection.as_ref()
    }

    pub fn data_callback(&self) -> Option<&DataCallback> {
        self.data.as_ref()
    }
}

impl fmt::Debug for ServerCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCallbacks")
            .field("connection", &self.connection.is_some())
            .field("data", &self.data.is_some())
            .finish()
    }
}

/// Counters kept by a server since it was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub accepted: u64,
    /// Dropped by the connection limit or a failed `prepare()`.
    pub rejected: u64,
    pub disconnected: u64,
    pub active: usize,
}

pub(crate) struct ServerCore {
    config: ServerConfig,
    callbacks: ServerCallbacks,
    clients: LockfreeMap<u64, Arc<ClientSocket>>,
    // Registered clients plus admissions in progress.
    active: AtomicUsize,
    acceptor: Mutex<Option<Box<dyn Acceptor>>>,
    local: Option<SocketAddr>,
    pool: OnceLock<Weak<SocketPool>>,
    listener: Mutex<Option<WorkerLink>>,
    commands: Mutex<VecDeque<DispatchCommand>>,
    // Set while accept keeps failing, so the error is logged once.
    accept_failing: AtomicBool,
    buffers: BufferPool,
    accepted: AtomicU64,
    rejected: AtomicU64,
    disconnected: AtomicU64,
    weak_self: Weak<ServerCore>,
}

impl ServerCore {
    fn log(&self, level: LogLevel, message: impl fmt::Display) {
        match self.local {
            Some(addr) => self
                .config
                .logger
                .log(level, &format!("[server {}] {}", addr, message)),
            None => self.config.logger.log(level, &format!("[server] {}", message)),
        }
    }

    fn pool(&self) -> Option<Arc<SocketPool>> {
        self.pool.get().and_then(Weak::upgrade)
    }

    fn reserve_slot(&self) -> bool {
        let max = self.config.max_connections;
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| match max {
                Some(max) if n >= max => None,
                _ => Some(n + 1),
            })
            .is_ok()
    }

    /// Turns an accepted handle into a registered, prepared client and, once
    /// the server is started, attaches it to a worker.
    fn admit(&self, handle: SocketHandle, peer: SocketAddr) -> Result<Arc<ClientSocket>> {
        if !self.reserve_slot() {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            self.log(
                LogLevel::Warn,
                format_args!("Max connections reached, rejecting {}", peer),
            );
            return Err(NetworkError::MaxConnectionsReached(peer));
        }

        let client = ClientSocket::new(
            handle,
            self.weak_self.clone(),
            self.callbacks.clone(),
            &self.config,
            self.buffers.clone(),
        );

        if let Err(e) = client.prepare() {
            self.active.fetch_sub(1, Ordering::AcqRel);
            self.rejected.fetch_add(1, Ordering::Relaxed);
            self.log(LogLevel::Warn, format_args!("dropping {}: {}", peer, e));
            return Err(e);
        }

        self.clients.insert(client.id().as_u64(), Arc::clone(&client));
        self.accepted.fetch_add(1, Ordering::Relaxed);

        if let Some(pool) = self.pool() {
            if let Err(e) = pool.attach(client.clone()) {
                self.log(
                    LogLevel::Error,
                    format_args!("failed to attach {}: {}", client.id(), e),
                );
                let _ = client.close();
                return Err(e);
            }
        }

        self.log(
            LogLevel::Debug,
            format_args!("New connection: {} (id: {})", peer, client.id()),
        );
        Ok(client)
    }

    /// Removes `id` from the registry. Returns `false` if it was already gone.
    pub(crate) fn on_client_disconnected(&self, id: SocketId) -> bool {
        if self.clients.remove(&id.as_u64()).is_none() {
            return false;
        }
        self.active.fetch_sub(1, Ordering::AcqRel);
        self.disconnected.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Accepts until the acceptor runs dry. Returns `Rearm` when a hard
    /// error, such as running out of descriptors, left connections queued.
    fn accept_pending(&self) -> DispatchOutcome {
        loop {
            let accepted = match self.acceptor.lock().as_mut() {
                Some(acceptor) => acceptor.accept(),
                None => return DispatchOutcome::Idle,
            };

            match accepted {
                Ok((handle, peer)) => {
                    self.accept_failing.store(false, Ordering::Relaxed);
                    // Failures are logged by `admit`.
                    let _ = self.admit(handle, peer);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.accept_failing.store(false, Ordering::Relaxed);
                    return DispatchOutcome::Idle;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    self.log(LogLevel::Debug, NetworkError::Accept(e));
                }
                Err(e) => {
                    if !self.accept_failing.swap(true, Ordering::Relaxed) {
                        self.log(LogLevel::Error, NetworkError::Accept(e));
                    }
                    return DispatchOutcome::Rearm;
                }
            }
        }
    }

    /// Deregisters and drops the acceptor. Returns `false` if it was gone.
    fn close_listener(&self) -> bool {
        let link = self.listener.lock().take();
        let acceptor = self.acceptor.lock().take();
        let was_open = acceptor.is_some();

        match (acceptor, link) {
            (Some(mut acceptor), Some(link)) => link.detach(Some(&mut *acceptor)),
            (None, Some(link)) => link.detach::<dyn Acceptor>(None),
            _ => {}
        }
        if was_open {
            self.log(LogLevel::Info, "stopped listening");
        }
        was_open
    }

    fn clients(&self) -> Vec<Arc<ClientSocket>> {
        self.clients
            .iter()
            .map(|entry| Arc::clone(entry.val()))
            .collect()
    }
}

impl DispatchTarget for ServerCore {
    fn interest(&self) -> Interest {
        Interest::READABLE
    }

    fn register(&self, registry: &Registry, token: Token) -> io::Result<()> {
        match self.acceptor.lock().as_mut() {
            Some(acceptor) => registry.register(&mut **acceptor, token, Interest::READABLE),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "listener already closed",
            )),
        }
    }

    fn bind(&self, link: WorkerLink) {
        *self.listener.lock() = Some(link);
    }

    fn append_command(&self, command: DispatchCommand) {
        self.commands.lock().push_back(command);
    }

    fn dispatch_pending(&self) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::Idle;
        loop {
            let command = self.commands.lock().pop_front();
            match command {
                Some(DispatchCommand::Readable) => outcome = self.accept_pending(),
                Some(DispatchCommand::Closed(Some(e))) => {
                    self.log(LogLevel::Error, format_args!("listener error: {}", e));
                }
                Some(_) => {}
                None => return outcome,
            }
        }
    }

    fn shutdown(&self) {
        self.close_listener();
    }
}

/// Owns the listening acceptor and the registry of active clients.
///
/// Dropping a `ServerSocket` shuts it down.
pub struct ServerSocket {
    core: Arc<ServerCore>,
}

impl ServerSocket {
    /// Binds a TCP listener on `config.address`.
    pub fn bind(config: ServerConfig, callbacks: ServerCallbacks) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.address)?;
        Self::with_acceptor(config, callbacks, listener)
    }

    /// Serves connections from any [`Acceptor`]. Fails with
    /// [`NetworkError::Configuration`] if `config` does not validate.
    pub fn with_acceptor<A>(
        config: ServerConfig,
        callbacks: ServerCallbacks,
        acceptor: A,
    ) -> Result<Self>
    where
        A: Acceptor + 'static,
    {
        config.validate()?;
        let local = acceptor.local_addr().ok();
        let buffers = BufferPool::new(POOLED_RECV_BUFFERS, config.buffer_size);

        let core = Arc::new_cyclic(|weak_self| ServerCore {
            config,
            callbacks,
            clients: LockfreeMap::new(),
            active: AtomicUsize::new(0),
            acceptor: Mutex::new(Some(Box::new(acceptor))),
            local,
            pool: OnceLock::new(),
            listener: Mutex::new(None),
            commands: Mutex::new(VecDeque::new()),
            accept_failing: AtomicBool::new(false),
            buffers,
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            disconnected: AtomicU64::new(0),
            weak_self: weak_self.clone(),
        });

        Ok(Self { core })
    }

    /// Attaches the listener to `pool`. Accepted clients are spread over the
    /// pool's workers from then on.
    pub fn start(&self, pool: &Arc<SocketPool>) -> Result<()> {
        if self.core.pool.set(Arc::downgrade(pool)).is_err() {
            return Err(NetworkError::Configuration(
                "server already started".to_string(),
            ));
        }

        let (worker, _) = pool.attach(self.core.clone())?;
        self.core
            .log(LogLevel::Info, format_args!("listening on {}", worker));
        Ok(())
    }

    /// Registers a connection accepted elsewhere, such as a reliable-UDP
    /// session handed over by its handshake layer.
    pub fn adopt(&self, handle: SocketHandle) -> Result<Arc<ClientSocket>> {
        let peer = handle
            .transport()
            .peer_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        self.core.admit(handle, peer)
    }

    pub fn local_address(&self) -> Option<SocketAddress> {
        self.core.local.map(SocketAddress::from)
    }

    pub fn client_count(&self) -> usize {
        self.core.clients.iter().count()
    }

    pub fn client(&self, id: SocketId) -> Option<Arc<ClientSocket>> {
        self.core
            .clients
            .get(&id.as_u64())
            .map(|entry| Arc::clone(entry.val()))
    }

    pub fn clients(&self) -> Vec<Arc<ClientSocket>> {
        self.core.clients()
    }

    /// Sends to one client. Bytes the peer cannot take yet are queued.
    pub fn send_to(&self, id: SocketId, data: &[u8]) -> Result<usize> {
        let client = self.client(id).ok_or(NetworkError::NotRegistered)?;
        match client.send(data) {
            IoStatus::Done(n) => Ok(n),
            IoStatus::WouldBlock => Ok(0),
            IoStatus::Failed(e) => Err(e),
        }
    }

    pub fn close_client(&self, id: SocketId) -> Result<()> {
        self.client(id).ok_or(NetworkError::NotRegistered)?.close()
    }

    /// Sends `data` to every client. Returns how many accepted it.
    pub fn broadcast(&self, data: &[u8]) -> usize {
        self.clients()
            .iter()
            .filter(|client| matches!(client.send(data), IoStatus::Done(_)))
            .count()
    }

    /// Called by a client once it has been released. Safe to call again.
    pub fn on_client_disconnected(&self, id: SocketId) -> bool {
        self.core.on_client_disconnected(id)
    }

    pub fn connection_callback(&self) -> Option<&ConnectionCallback> {
        self.core.callbacks.connection_callback()
    }

    pub fn data_callback(&self) -> Option<&DataCallback> {
        self.core.callbacks.data_callback()
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            accepted: self.core.accepted.load(Ordering::Relaxed),
            rejected: self.core.rejected.load(Ordering::Relaxed),
            disconnected: self.core.disconnected.load(Ordering::Relaxed),
            active: self.core.active.load(Ordering::Acquire),
        }
    }

    /// Stops accepting and closes every client gracefully.
    pub fn shutdown(&self) {
        self.core.close_listener();
        for client in self.core.clients() {
            let _ = client.close();
        }
    }
}

impl Drop for ServerSocket {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for ServerSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSocket")
            .field("local", &self.core.local)
            .field("clients", &self.client_count())
            .finish()
    }
}

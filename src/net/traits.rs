use std::fmt;
use std::sync::Arc;

use crate::buffer::Buffer;
use crate::error::{NetworkError, Result};
use crate::net::address::SocketAddress;
use crate::net::client::ClientSocket;
use crate::net::handle::SocketKind;
use crate::net::socket::IoStatus;
use crate::net::state::{ConnectionState, SocketConnectionState};

/// Unique identifier for sockets.
///
/// Every socket gets one when it is created. It keys the server registry and
/// stays constant for the socket's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SocketId(pub u64);

impl SocketId {
    pub fn new(id: u64) -> Self {
        SocketId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Receives connection lifecycle transitions.
///
/// Called once with [`SocketConnectionState::Connected`] and once with a
/// terminal state. The error, when present, explains an abnormal termination.
pub type ConnectionCallback = Arc<
    dyn Fn(&Arc<ClientSocket>, SocketConnectionState, Option<&NetworkError>) + Send + Sync,
>;

/// Receives the bytes read from a connection. Each call owns its buffer.
pub type DataCallback = Arc<dyn Fn(&Arc<ClientSocket>, Buffer) + Send + Sync>;

/// What upper layers can do with a live connection.
pub trait Connection: Send + Sync {
    fn id(&self) -> SocketId;

    fn kind(&self) -> SocketKind;

    fn state(&self) -> ConnectionState;

    fn local_address(&self) -> Option<SocketAddress>;

    fn remote_address(&self) -> Option<SocketAddress>;

    fn send(&self, data: &[u8]) -> IoStatus;

    fn recv(&self, buffer: &mut Buffer) -> IoStatus;

    /// Closes the connection. Calling it again is a no-op.
    fn close(&self) -> Result<()>;
}

/// Log levels for network events
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Logger trait for network events
///
/// Sockets, workers and servers receive their logger through configuration,
/// so library users decide where events go.
pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);
}

/// Default no-op logger that discards all messages
#[derive(Debug, Default, Clone)]
pub struct NoOpLogger;

impl Logger for NoOpLogger {
    fn log(&self, _level: LogLevel, _message: &str) {}
}

/// Forwards to the [`log`] facade under the `mill_socket` target.
#[derive(Debug, Default, Clone)]
pub struct LogFacade;

impl Logger for LogFacade {
    fn log(&self, level: LogLevel, message: &str) {
        let level = match level {
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Error => log::Level::Error,
        };
        log::log!(target: "mill_socket", level, "{}", message);
    }
}

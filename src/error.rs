use std::fmt;
use std::io;
use std::net::SocketAddr;

use crate::net::handle::SocketKind;

/// Errors produced by the socket core.
///
/// Only setup failures are returned to callers synchronously. Everything that
/// happens after a connection is registered travels through the terminal
/// connection callback instead.
#[derive(Debug)]
pub enum NetworkError {
    Io(io::Error),
    Accept(io::Error),
    /// `prepare()` failed; the socket is unusable.
    Setup(String),
    /// The transport behind a handle cannot apply the options its kind requires.
    UnsupportedOption(SocketKind),
    PeerClosed,
    /// The multiplexer flagged the socket as failed. Handlers replace it with
    /// the socket's pending error when there is one.
    SocketError,
    IdleTimeout,
    BacklogFull(usize),
    MaxConnectionsReached(SocketAddr),
    /// I/O was attempted after the handle was released.
    Closed,
    NotRegistered,
    WorkerGone,
    Configuration(String),
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::Io(e) => write!(f, "IO Error: {}", e),
            NetworkError::Accept(e) => write!(f, "Accept Error: {}", e),
            NetworkError::Setup(msg) => write!(f, "Setup Error: {}", msg),
            NetworkError::UnsupportedOption(kind) => {
                write!(f, "Transport cannot apply {} socket options", kind)
            }
            NetworkError::PeerClosed => write!(f, "Connection closed by peer"),
            NetworkError::SocketError => write!(f, "Socket reported an error condition"),
            NetworkError::IdleTimeout => write!(f, "No data sent within the idle timeout"),
            NetworkError::BacklogFull(limit) => {
                write!(f, "Send backlog exceeded {} bytes", limit)
            }
            NetworkError::MaxConnectionsReached(addr) => {
                write!(f, "Max connections reached, rejecting {}", addr)
            }
            NetworkError::Closed => write!(f, "Socket is closed"),
            NetworkError::NotRegistered => write!(f, "Socket is not registered with a worker"),
            NetworkError::WorkerGone => write!(f, "Pool worker is gone"),
            NetworkError::Configuration(msg) => write!(f, "Configuration Error: {}", msg),
        }
    }
}

impl std::error::Error for NetworkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NetworkError::Io(e) | NetworkError::Accept(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for NetworkError {
    fn from(err: io::Error) -> Self {
        NetworkError::Io(err)
    }
}

pub type Result<T> = std::result::Result<T, NetworkError>;

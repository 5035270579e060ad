//! Connection state machine.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of a socket.
///
/// States only move forward in declaration order. `Error` may be entered from
/// any state below `Closed`; nothing leaves `Closed` or `Error`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Created = 0,
    Prepared = 1,
    Connected = 2,
    Disconnecting = 3,
    Disconnected = 4,
    Closed = 5,
    Error = 6,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Prepared,
            2 => Self::Connected,
            3 => Self::Disconnecting,
            4 => Self::Disconnected,
            5 => Self::Closed,
            _ => Self::Error,
        }
    }

    /// `Closed` or `Error`: the socket is out of the multiplexer for good.
    pub fn is_terminal(&self) -> bool {
        *self >= Self::Closed
    }

    fn can_advance_to(self, next: Self) -> bool {
        match next {
            Self::Error => self < Self::Closed,
            _ => next > self && !self.is_terminal(),
        }
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Created
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Prepared => write!(f, "Prepared"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Closed => write!(f, "Closed"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// State reported to the connection callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SocketConnectionState {
    Connected,
    /// Peer-initiated or abnormal termination.
    Disconnect,
    /// Termination after a local graceful close.
    Disconnected,
}

impl fmt::Display for SocketConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "Connected"),
            Self::Disconnect => write!(f, "Disconnect"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Lock-free holder enforcing forward-only transitions.
#[derive(Debug, Default)]
pub struct AtomicState(AtomicU8);

impl AtomicState {
    pub fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves to `next` if that is a legal forward step. Returns the state that
    /// was replaced, or `None` when the transition was refused.
    pub fn advance(&self, next: ConnectionState) -> Option<ConnectionState> {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let state = ConnectionState::from_u8(current);
            if !state.can_advance_to(next) {
                return None;
            }
            match self.0.compare_exchange_weak(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(state),
                Err(actual) => current = actual,
            }
        }
    }

    /// Like [`advance`](Self::advance) but only from exactly `from`.
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        from.can_advance_to(to)
            && self
                .0
                .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }
}

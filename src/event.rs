use mio::{event::Event, Token};
use std::fmt;

use crate::error::NetworkError;

/// One unit of work for a socket's handler.
///
/// Commands are queued per socket and consumed in FIFO order by that socket's
/// handler on its worker thread.
pub enum DispatchCommand {
    Connected,
    Readable,
    Writable,
    /// Carries the cause when the close was abnormal.
    Closed(Option<NetworkError>),
}

impl fmt::Debug for DispatchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchCommand::Connected => write!(f, "Connected"),
            DispatchCommand::Readable => write!(f, "Readable"),
            DispatchCommand::Writable => write!(f, "Writable"),
            DispatchCommand::Closed(None) => write!(f, "Closed"),
            DispatchCommand::Closed(Some(e)) => write!(f, "Closed({})", e),
        }
    }
}

/// Platform-neutral snapshot of a `mio` readiness event.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    pub read_closed: bool,
    pub error: bool,
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Readiness")
            .field("token", &self.token)
            .field("readable", &self.readable)
            .field("writable", &self.writable)
            .field("read_closed", &self.read_closed)
            .field("error", &self.error)
            .finish()
    }
}

impl Readiness {
    pub fn token(&self) -> Token {
        self.token
    }

    /// Commands this readiness turns into, in handling order.
    ///
    /// An error short-circuits to `Closed` carrying
    /// [`NetworkError::SocketError`], which the handler resolves against the
    /// socket. A read-side hangup is handled as readable so that buffered
    /// bytes are drained before the zero-byte read reports the close.
    pub fn into_commands(self) -> impl Iterator<Item = DispatchCommand> {
        let (read, write) = if self.error {
            (Some(DispatchCommand::Closed(Some(NetworkError::SocketError))), None)
        } else {
            (
                (self.readable || self.read_closed).then_some(DispatchCommand::Readable),
                self.writable.then_some(DispatchCommand::Writable),
            )
        };
        [read, write].into_iter().flatten()
    }
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            token: event.token(),
            readable: event.is_readable(),
            writable: event.is_writable(),
            read_closed: event.is_read_closed(),
            error: event.is_error(),
        }
    }
}

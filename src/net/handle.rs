//! Native socket ownership.
//!
//! A [`SocketHandle`] pairs a [`Transport`] with the protocol it speaks. The
//! handle is the only thing that can perform I/O on the underlying socket and
//! it is deliberately not `Clone`: passing it on moves it, so whoever gave it
//! away can no longer touch the connection.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::time::Duration;

use mio::event::Source;
use mio::net::{TcpStream, UdpSocket};
use socket2::{SockRef, TcpKeepalive};

/// Largest session identifier accepted from a reliable-UDP handshake.
pub const MAX_SESSION_ID_LEN: usize = 512;

/// Keep-alive applied to every accepted TCP connection.
pub const TCP_KEEPALIVE: KeepAlive = KeepAlive {
    idle: Duration::from_secs(30),
    interval: Duration::from_secs(10),
    probes: 3,
};

/// Protocol spoken over a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKind {
    Tcp,
    Udp,
    /// Reliable transport over UDP that negotiates a session id during setup.
    ReliableUdp,
}

impl SocketKind {
    /// Whether a zero-byte read means the peer went away.
    pub fn is_stream(&self) -> bool {
        matches!(self, SocketKind::Tcp)
    }
}

impl fmt::Display for SocketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketKind::Tcp => write!(f, "TCP"),
            SocketKind::Udp => write!(f, "UDP"),
            SocketKind::ReliableUdp => write!(f, "ReliableUDP"),
        }
    }
}

/// TCP keep-alive probe schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive {
    /// Quiet time before the first probe.
    pub idle: Duration,
    pub interval: Duration,
    pub probes: u32,
}

/// Protocol strategy behind a [`SocketHandle`].
///
/// Built-in implementations cover [`mio::net::TcpStream`] and connected
/// [`mio::net::UdpSocket`]s. Reliable-UDP stacks live above this crate and plug
/// in by implementing this trait, typically overriding [`session_id`].
///
/// All methods are called with the socket already switched to non-blocking
/// mode, except [`set_nonblocking`] itself.
///
/// [`session_id`]: Transport::session_id
/// [`set_nonblocking`]: Transport::set_nonblocking
pub trait Transport: Source + Send {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn send(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn peer_addr(&self) -> io::Result<SocketAddr>;

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;

    /// Applies TCP keep-alive. Transports that have no such notion keep the
    /// default, which refuses.
    fn set_keepalive(&self, keepalive: &KeepAlive) -> io::Result<()> {
        let _ = keepalive;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "transport has no keep-alive",
        ))
    }

    /// Session identifier negotiated during the handshake, if any.
    fn session_id(&self, max_len: usize) -> io::Result<Option<String>> {
        let _ = max_len;
        Ok(None)
    }

    /// Half-closes the sending side ahead of a local close.
    fn shutdown_write(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Takes the error pending on the socket (`SO_ERROR`), if any.
    fn take_error(&self) -> io::Result<Option<io::Error>> {
        Ok(None)
    }
}

impl Transport for TcpStream {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf)
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write(buf)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::local_addr(self)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        SockRef::from(self).set_nonblocking(nonblocking)
    }

    fn set_keepalive(&self, keepalive: &KeepAlive) -> io::Result<()> {
        let sock = SockRef::from(self);
        sock.set_keepalive(true)?;
        let params = TcpKeepalive::new()
            .with_time(keepalive.idle)
            .with_interval(keepalive.interval)
            .with_retries(keepalive.probes);
        sock.set_tcp_keepalive(&params)
    }

    fn shutdown_write(&mut self) -> io::Result<()> {
        match self.shutdown(Shutdown::Write) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        TcpStream::take_error(self)
    }
}

impl Transport for UdpSocket {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        UdpSocket::recv(self, buf)
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        UdpSocket::send(self, buf)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::peer_addr(self)
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        SockRef::from(self).set_nonblocking(nonblocking)
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        UdpSocket::take_error(self)
    }
}

/// Exclusive owner of one native socket.
pub struct SocketHandle {
    kind: SocketKind,
    transport: Box<dyn Transport>,
}

impl SocketHandle {
    pub fn new(kind: SocketKind, transport: Box<dyn Transport>) -> Self {
        Self { kind, transport }
    }

    pub fn tcp(stream: TcpStream) -> Self {
        Self::new(SocketKind::Tcp, Box::new(stream))
    }

    /// Wraps a UDP socket that has already been `connect`ed to its peer.
    pub fn udp(socket: UdpSocket) -> Self {
        Self::new(SocketKind::Udp, Box::new(socket))
    }

    pub fn reliable_udp<T>(transport: T) -> Self
    where
        T: Transport + 'static,
    {
        Self::new(SocketKind::ReliableUdp, Box::new(transport))
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    pub fn transport(&self) -> &dyn Transport {
        &*self.transport
    }

    pub fn transport_mut(&mut self) -> &mut dyn Transport {
        &mut *self.transport
    }

    pub fn into_transport(self) -> Box<dyn Transport> {
        self.transport
    }
}

impl fmt::Debug for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketHandle")
            .field("kind", &self.kind)
            .field("peer", &self.transport.peer_addr().ok())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::testing::MockTransport;

    #[test]
    fn test_stream_kinds() {
        assert!(SocketKind::Tcp.is_stream());
        assert!(!SocketKind::Udp.is_stream());
        assert!(!SocketKind::ReliableUdp.is_stream());
    }

    #[test]
    fn test_handle_transfer_leaves_no_copy() {
        let (transport, probe) = MockTransport::new();
        let mut accepted = Some(SocketHandle::new(SocketKind::Tcp, Box::new(transport)));

        let moved = accepted.take();
        assert!(accepted.is_none());
        assert!(moved.is_some());

        drop(moved);
        assert!(probe.is_dropped(), "the only owner released the transport");
    }

    #[test]
    fn test_default_keepalive_refuses() {
        struct Bare;
        impl Source for Bare {
            fn register(&mut self, _: &mio::Registry, _: mio::Token, _: mio::Interest) -> io::Result<()> {
                Ok(())
            }
            fn reregister(&mut self, _: &mio::Registry, _: mio::Token, _: mio::Interest) -> io::Result<()> {
                Ok(())
            }
            fn deregister(&mut self, _: &mio::Registry) -> io::Result<()> {
                Ok(())
            }
        }
        impl Transport for Bare {
            fn recv(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Ok(0)
            }
            fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
                Ok(buf.len())
            }
            fn local_addr(&self) -> io::Result<SocketAddr> {
                Ok("127.0.0.1:1".parse().unwrap())
            }
            fn peer_addr(&self) -> io::Result<SocketAddr> {
                Ok("127.0.0.1:2".parse().unwrap())
            }
            fn set_nonblocking(&self, _: bool) -> io::Result<()> {
                Ok(())
            }
        }

        let err = Bare.set_keepalive(&TCP_KEEPALIVE).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
        assert_eq!(Bare.session_id(MAX_SESSION_ID_LEN).unwrap(), None);
    }

    #[test]
    fn test_tcp_keepalive_applied() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        drop(client);

        let stream = TcpStream::from_std(server);
        stream.set_keepalive(&TCP_KEEPALIVE).unwrap();

        let sock = SockRef::from(&stream);
        assert!(sock.keepalive().unwrap());
        assert_eq!(sock.keepalive_time().unwrap(), Duration::from_secs(30));
        assert_eq!(sock.keepalive_interval().unwrap(), Duration::from_secs(10));
        assert_eq!(sock.keepalive_retries().unwrap(), 3);
    }
}

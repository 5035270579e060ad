//! Sockets and the connection lifecycle.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Upper layers                           │
//! │   connection callback        data callback       send()     │
//! └──────────▲──────────────────────▲─────────────────┬─────────┘
//!            │                      │                 │
//! ┌──────────┴──────────────────────┴─────────────────▼─────────┐
//! │  ServerSocket ──owns registry of──▶ ClientSocket             │
//! │      │                                  │                    │
//! │   Acceptor                         Socket (state, clock)     │
//! │                                         │                    │
//! │                                   SocketHandle ─▶ Transport  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! A [`SocketHandle`] pairs a [`Transport`] with its [`SocketKind`] and has
//! exactly one owner. The accept path moves it into a [`ClientSocket`],
//! which is the only thing that performs I/O on it from then on.
//!
//! Built-in transports cover TCP streams and connected UDP sockets. A
//! reliable-UDP stack supplies its own [`Transport`], usually reporting a
//! session id, and hands sessions over with [`ServerSocket::adopt`].

pub mod address;
pub mod client;
pub mod config;
pub mod handle;
pub mod server;
pub mod socket;
pub mod state;
pub mod traits;

#[cfg(test)]
pub(crate) mod testing;

pub use address::{AddressFamily, SocketAddress};
pub use client::ClientSocket;
pub use config::{ServerConfig, ServerConfigBuilder, CLIENT_IDLE_TIMEOUT};
pub use handle::{KeepAlive, SocketHandle, SocketKind, Transport, MAX_SESSION_ID_LEN, TCP_KEEPALIVE};
pub use server::{Acceptor, ServerCallbacks, ServerSocket, ServerStats};
pub use socket::{IoStatus, Socket};
pub use state::{ConnectionState, SocketConnectionState};
pub use traits::{
    Connection, ConnectionCallback, DataCallback, LogFacade, LogLevel, Logger, NoOpLogger,
    SocketId,
};

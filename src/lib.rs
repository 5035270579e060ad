//! # mill-socket
//! The connection core of a real-time media server: many TCP, UDP and
//! reliable-UDP client connections multiplexed over a small pool of [`mio`]
//! event-loop workers, with no thread per connection and no async runtime.
//!
//! Upper layers see three narrow contracts:
//! - a connection callback receiving `Connected`, then exactly one terminal
//!   state per connection;
//! - a data callback receiving each chunk read from a connection as an owned
//!   [`Buffer`];
//! - the [`Buffer`] primitive itself.
//!
//! ## Architecture Overview
//! ```text
//! ┌──────────────┐  accept   ┌──────────────┐  attach  ┌──────────────┐
//! │ ServerSocket │─────────▶│ ClientSocket │────────▶│  SocketPool  │
//! │  (registry)  │◀─────────│  (handlers)  │          └──────┬───────┘
//! └──────────────┘ on close  └──────▲───────┘                 │
//!                                   │ DispatchCommand  ┌──────▼───────┐
//!                                   └──────────────────│  PoolWorker  │ × N
//!                                                      │ (mio::Poll)  │
//!                                                      └──────────────┘
//! ```
//!
//! Every connection is pinned to one worker. The worker turns readiness
//! events into [`DispatchCommand`]s and runs the connection's handler on its
//! own thread, so events for one connection are handled strictly in order and
//! never concurrently.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mill_socket::prelude::*;
//! use std::sync::Arc;
//!
//! fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//!     let pool = Arc::new(SocketPool::new(PoolConfig::builder().workers(4).build())?);
//!
//!     let callbacks = ServerCallbacks::new()
//!         .on_connection(|client, state, error| {
//!             println!("{} {} {:?}", client.id(), state, error);
//!         })
//!         .on_data(|client, data| {
//!             let _ = client.send(&data);
//!         });
//!
//!     let config = ServerConfig::builder()
//!         .address("127.0.0.1:1935".parse()?)
//!         .build();
//!     let server = ServerSocket::bind(config, callbacks)?;
//!     server.start(&pool)?;
//!
//!     std::thread::park();
//!     Ok(())
//! }
//! ```
//!
//! - [`pool`]: worker pool and its configuration
//! - [`worker`]: the per-thread event loop
//! - [`net`]: sockets, handles, the server and its clients
//! - [`buffer`]: bounded byte buffers and the receive buffer pool
//! - [`error`]: error types and result handling

pub mod buffer;
pub mod error;
pub mod event;
pub mod handler;
pub mod net;
pub mod poll;
pub mod pool;
pub mod worker;

pub use buffer::{Buffer, BufferPool};
pub use error::{NetworkError, Result};
pub use event::DispatchCommand;
pub use handler::{DispatchOutcome, DispatchTarget};
pub use pool::{PoolConfig, SocketPool, WorkerSelection};
pub use worker::{PoolWorker, WorkerId};

/// Commonly used types and traits.
///
/// ```rust
/// use mill_socket::prelude::*;
/// ```
pub mod prelude {
    pub use crate::buffer::Buffer;
    pub use crate::error::{NetworkError, Result};
    pub use crate::net::{
        ClientSocket, Connection, ConnectionState, IoStatus, LogFacade, LogLevel, Logger,
        ServerCallbacks, ServerConfig, ServerSocket, SocketConnectionState, SocketHandle,
        SocketId, SocketKind,
    };
    pub use crate::pool::{PoolConfig, SocketPool, WorkerSelection};
}

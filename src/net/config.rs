use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use crate::buffer::DEFAULT_BUFFER_SIZE;
use crate::error::{NetworkError, Result};
use crate::net::traits::{Logger, NoOpLogger};

/// Default idle timeout: a client with no successful send for this long is
/// closed by its worker's sweep.
pub const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

pub const DEFAULT_MAX_READ_PER_DISPATCH: usize = 512 * 1024;

pub const DEFAULT_MAX_SEND_BACKLOG: usize = 4 * 1024 * 1024;

/// Configuration for a [`ServerSocket`](crate::net::server::ServerSocket).
///
/// Controls the bind address, the per-client buffers and limits, and the idle
/// timeout. Use `ServerConfig::builder()` for ergonomic construction.
///
/// ## Resource Limits
///
/// - buffer_size: size of the receive scratch buffers recycled per client
/// - max_connections: hard limit on concurrent clients (None for unlimited)
/// - max_read_per_dispatch: bytes one readable dispatch may drain before the
///   client yields to the rest of its worker
/// - max_send_backlog: bytes a client may queue while its peer is not reading
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub address: SocketAddr,
    /// Size of receive buffers
    pub buffer_size: usize,
    /// Maximum number of connections
    pub max_connections: Option<usize>,
    /// Time without a successful send before a client is closed
    pub idle_timeout: Duration,
    pub max_read_per_dispatch: usize,
    pub max_send_backlog: usize,
    /// Logger for network events
    pub logger: Arc<dyn Logger>,
}

impl ServerConfig {
    /// Create a new builder for ServerConfig
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    /// Rejects limits that would leave a client unable to read.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(NetworkError::Configuration(
                "buffer_size must be greater than zero".to_string(),
            ));
        }
        if self.max_read_per_dispatch == 0 {
            return Err(NetworkError::Configuration(
                "max_read_per_dispatch must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_connections: None,
            idle_timeout: CLIENT_IDLE_TIMEOUT,
            max_read_per_dispatch: DEFAULT_MAX_READ_PER_DISPATCH,
            max_send_backlog: DEFAULT_MAX_SEND_BACKLOG,
            logger: Arc::new(NoOpLogger),
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("address", &self.address)
            .field("buffer_size", &self.buffer_size)
            .field("max_connections", &self.max_connections)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_read_per_dispatch", &self.max_read_per_dispatch)
            .field("max_send_backlog", &self.max_send_backlog)
            .finish()
    }
}

/// Builder for ServerConfig.
///
/// All fields are optional and will use defaults from ServerConfig::default()
/// if not explicitly set.
#[derive(Default)]
pub struct ServerConfigBuilder {
    address: Option<SocketAddr>,
    buffer_size: Option<usize>,
    max_connections: Option<usize>,
    idle_timeout: Option<Duration>,
    max_read_per_dispatch: Option<usize>,
    max_send_backlog: Option<usize>,
    logger: Option<Arc<dyn Logger>>,
}

impl ServerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the address to bind to
    pub fn address(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }

    /// Set the receive buffer size
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    /// Set the maximum number of connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn max_read_per_dispatch(mut self, bytes: usize) -> Self {
        self.max_read_per_dispatch = Some(bytes);
        self
    }

    pub fn max_send_backlog(mut self, bytes: usize) -> Self {
        self.max_send_backlog = Some(bytes);
        self
    }

    /// Set the logger implementation
    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn build(self) -> ServerConfig {
        let default = ServerConfig::default();
        ServerConfig {
            address: self.address.unwrap_or(default.address),
            buffer_size: self.buffer_size.unwrap_or(default.buffer_size),
            max_connections: self.max_connections.or(default.max_connections),
            idle_timeout: self.idle_timeout.unwrap_or(default.idle_timeout),
            max_read_per_dispatch: self
                .max_read_per_dispatch
                .unwrap_or(default.max_read_per_dispatch),
            max_send_backlog: self.max_send_backlog.unwrap_or(default.max_send_backlog),
            logger: self.logger.unwrap_or(default.logger),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.address.to_string(), "127.0.0.1:8080");
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.max_read_per_dispatch, 512 * 1024);
        assert!(config.max_connections.is_none());
    }

    #[test]
    fn test_builder_overrides() {
        let config = ServerConfig::builder()
            .address("0.0.0.0:1935".parse().unwrap())
            .max_connections(2)
            .idle_timeout(Duration::from_secs(5))
            .build();
        assert_eq!(config.address.port(), 1935);
        assert_eq!(config.max_connections, Some(2));
        assert_eq!(config.idle_timeout, Duration::from_secs(5));
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        assert!(ServerConfig::default().validate().is_ok());

        let no_buffer = ServerConfig::builder().buffer_size(0).build();
        assert!(matches!(
            no_buffer.validate(),
            Err(NetworkError::Configuration(_))
        ));

        let no_reads = ServerConfig::builder().max_read_per_dispatch(0).build();
        assert!(matches!(
            no_reads.validate(),
            Err(NetworkError::Configuration(_))
        ));
    }
}

use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::{NetworkError, Result};
use crate::handler::TcpHandler;
use crate::net::options::{SocketOption, SocketOptions};
use crate::net::tcp::TcpServer;
use crate::net::{AssignStrategy, NetServer};
use crate::thread_pool::{default_factory, ThreadFactory};

pub const DEFAULT_WORKER_THREADS: usize = 1;
pub const DEFAULT_BUFFER_SIZE: usize = 8192;
pub const DEFAULT_BACKLOG: i32 = 128;

pub(crate) fn default_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

/// Resolved configuration of a [`TcpServer`].
#[derive(Clone)]
pub struct TcpServerConfig {
    /// Address to bind to; port 0 picks an ephemeral port
    pub address: SocketAddr,
    /// Number of worker threads
    pub worker_threads: usize,
    /// Per-connection read buffer capacity
    pub buffer_size: usize,
    /// OS accept backlog
    pub backlog: i32,
    pub socket_options: SocketOptions,
    pub assign_strategy: AssignStrategy,
    pub(crate) handler: Arc<dyn TcpHandler>,
    pub(crate) acceptor_factory: Arc<dyn ThreadFactory>,
    pub(crate) worker_factory: Arc<dyn ThreadFactory>,
}

impl std::fmt::Debug for TcpServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServerConfig")
            .field("address", &self.address)
            .field("worker_threads", &self.worker_threads)
            .field("buffer_size", &self.buffer_size)
            .field("backlog", &self.backlog)
            .field("socket_options", &self.socket_options)
            .field("assign_strategy", &self.assign_strategy)
            .finish_non_exhaustive()
    }
}

/// Builder for [`TcpServer`].
///
/// Only the handler is required. Values are validated by [`build`](Self::build), so setters
/// never fail.
#[derive(Default)]
pub struct TcpServerBuilder {
    handler: Option<Arc<dyn TcpHandler>>,
    address: Option<SocketAddr>,
    worker_threads: Option<usize>,
    buffer_size: Option<usize>,
    backlog: Option<i32>,
    socket_options: SocketOptions,
    assign_strategy: Option<AssignStrategy>,
    acceptor_factory: Option<Arc<dyn ThreadFactory>>,
    worker_factory: Option<Arc<dyn ThreadFactory>>,
}

impl TcpServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler<H: TcpHandler>(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Uses a handler that is already shared with the rest of the application.
    pub fn shared_handler(mut self, handler: Arc<dyn TcpHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Number of worker threads, at least 1. Defaults to [`DEFAULT_WORKER_THREADS`].
    pub fn worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = Some(count);
        self
    }

    pub fn worker_thread_factory<F: ThreadFactory>(mut self, factory: F) -> Self {
        self.worker_factory = Some(Arc::new(factory));
        self
    }

    pub fn acceptor_thread_factory<F: ThreadFactory>(mut self, factory: F) -> Self {
        self.acceptor_factory = Some(Arc::new(factory));
        self
    }

    /// Per-connection read buffer capacity, at least 1. Defaults to [`DEFAULT_BUFFER_SIZE`].
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    /// Maximum number of pending connections queued by the OS. Defaults to [`DEFAULT_BACKLOG`].
    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = Some(backlog);
        self
    }

    /// Sets a socket option on the listening socket. May be called repeatedly.
    pub fn socket_option(mut self, option: SocketOption) -> Self {
        self.socket_options.set(option);
        self
    }

    pub fn assign_strategy(mut self, strategy: AssignStrategy) -> Self {
        self.assign_strategy = Some(strategy);
        self
    }

    /// Address to bind to when the server starts.
    pub fn bind(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }

    /// Binds to an ephemeral port on all interfaces.
    pub fn bind_any(mut self) -> Self {
        self.address = Some(default_address());
        self
    }

    pub fn build_config(self) -> Result<TcpServerConfig> {
        let handler = self
            .handler
            .ok_or_else(|| NetworkError::Configuration("a handler is required".into()))?;
        let worker_threads = self.worker_threads.unwrap_or(DEFAULT_WORKER_THREADS);
        if worker_threads == 0 {
            return Err(NetworkError::Configuration(
                "worker_threads must be at least 1".into(),
            ));
        }
        let buffer_size = self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE);
        if buffer_size == 0 {
            return Err(NetworkError::Configuration(
                "buffer_size must be positive".into(),
            ));
        }
        let backlog = match self.backlog {
            Some(b) if b > 0 => b,
            _ => DEFAULT_BACKLOG,
        };

        Ok(TcpServerConfig {
            address: self.address.unwrap_or_else(default_address),
            worker_threads,
            buffer_size,
            backlog,
            socket_options: self.socket_options,
            assign_strategy: self.assign_strategy.unwrap_or_default(),
            handler,
            acceptor_factory: self.acceptor_factory.unwrap_or_else(default_factory),
            worker_factory: self.worker_factory.unwrap_or_else(default_factory),
        })
    }

    /// Builds a server in the `NotStarted` state.
    pub fn build(self) -> Result<TcpServer> {
        Ok(TcpServer::new(self.build_config()?))
    }

    /// Builds and starts the server.
    pub fn start(self) -> Result<TcpServer> {
        let server = self.build()?;
        server.start()?;
        Ok(server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::NoOpHandler;

    #[test]
    fn test_defaults() {
        let config = TcpServerBuilder::new()
            .handler(NoOpHandler)
            .build_config()
            .unwrap();
        assert_eq!(config.worker_threads, DEFAULT_WORKER_THREADS);
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.backlog, DEFAULT_BACKLOG);
        assert_eq!(config.address, default_address());
        assert_eq!(config.assign_strategy, AssignStrategy::RoundRobin);
        assert!(config.socket_options.is_empty());
    }

    #[test]
    fn test_handler_is_required() {
        let err = TcpServerBuilder::new().build_config().unwrap_err();
        assert!(matches!(err, NetworkError::Configuration(_)));
        assert!(err.is_setup());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(TcpServerBuilder::new()
            .handler(NoOpHandler)
            .worker_threads(0)
            .build_config()
            .is_err());
        assert!(TcpServerBuilder::new()
            .handler(NoOpHandler)
            .buffer_size(0)
            .build_config()
            .is_err());
    }

    #[test]
    fn test_non_positive_backlog_uses_default() {
        let config = TcpServerBuilder::new()
            .handler(NoOpHandler)
            .backlog(-5)
            .build_config()
            .unwrap();
        assert_eq!(config.backlog, DEFAULT_BACKLOG);
    }

    #[test]
    fn test_custom_values() {
        let config = TcpServerBuilder::new()
            .handler(NoOpHandler)
            .worker_threads(3)
            .buffer_size(1024)
            .backlog(16)
            .socket_option(SocketOption::RecvBufferSize(1024))
            .assign_strategy(AssignStrategy::LeastConnections)
            .bind("127.0.0.1:0".parse().unwrap())
            .build_config()
            .unwrap();
        assert_eq!(config.worker_threads, 3);
        assert_eq!(config.buffer_size, 1024);
        assert_eq!(config.backlog, 16);
        assert_eq!(config.socket_options.len(), 1);
        assert_eq!(config.assign_strategy, AssignStrategy::LeastConnections);
        assert_eq!(config.address, "127.0.0.1:0".parse::<SocketAddr>().unwrap());
    }
}

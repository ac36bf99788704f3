use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::{NetworkError, Result};
use crate::handler::UdpHandler;
use crate::net::options::{SocketOption, SocketOptions};
use crate::net::tcp::config::default_address;
use crate::net::udp::UdpServer;
use crate::net::NetServer;
use crate::thread_pool::{default_factory, ThreadFactory};

/// Largest datagram delivered whole; longer ones are truncated by the OS.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 8192;

#[derive(Clone)]
pub struct UdpServerConfig {
    pub address: SocketAddr,
    pub max_packet_size: usize,
    pub socket_options: SocketOptions,
    pub(crate) handler: Arc<dyn UdpHandler>,
    pub(crate) thread_factory: Arc<dyn ThreadFactory>,
}

impl std::fmt::Debug for UdpServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpServerConfig")
            .field("address", &self.address)
            .field("max_packet_size", &self.max_packet_size)
            .field("socket_options", &self.socket_options)
            .finish_non_exhaustive()
    }
}

/// Builder for [`UdpServer`]. Only the handler is required.
#[derive(Default)]
pub struct UdpServerBuilder {
    handler: Option<Arc<dyn UdpHandler>>,
    address: Option<SocketAddr>,
    max_packet_size: Option<usize>,
    socket_options: SocketOptions,
    thread_factory: Option<Arc<dyn ThreadFactory>>,
}

impl UdpServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler<H: UdpHandler>(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn shared_handler(mut self, handler: Arc<dyn UdpHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Factory for the single loop thread, created as [`ThreadKind::Acceptor`](crate::thread_pool::ThreadKind).
    pub fn thread_factory<F: ThreadFactory>(mut self, factory: F) -> Self {
        self.thread_factory = Some(Arc::new(factory));
        self
    }

    /// Size of the receive buffer. Defaults to [`DEFAULT_MAX_PACKET_SIZE`].
    pub fn max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = Some(size);
        self
    }

    pub fn socket_option(mut self, option: SocketOption) -> Self {
        self.socket_options.set(option);
        self
    }

    pub fn bind(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }

    pub fn bind_any(mut self) -> Self {
        self.address = Some(default_address());
        self
    }

    pub fn build_config(self) -> Result<UdpServerConfig> {
        let handler = self
            .handler
            .ok_or_else(|| NetworkError::Configuration("a handler is required".into()))?;
        let max_packet_size = self.max_packet_size.unwrap_or(DEFAULT_MAX_PACKET_SIZE);
        if max_packet_size == 0 {
            return Err(NetworkError::Configuration(
                "max_packet_size must be positive".into(),
            ));
        }
        Ok(UdpServerConfig {
            address: self.address.unwrap_or_else(default_address),
            max_packet_size,
            socket_options: self.socket_options,
            handler,
            thread_factory: self.thread_factory.unwrap_or_else(default_factory),
        })
    }

    pub fn build(self) -> Result<UdpServer> {
        Ok(UdpServer::new(self.build_config()?))
    }

    pub fn start(self) -> Result<UdpServer> {
        let server = self.build()?;
        server.start()?;
        Ok(server)
    }
}

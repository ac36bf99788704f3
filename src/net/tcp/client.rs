//! Blocking TCP client, mainly for talking to a [`TcpServer`](super::TcpServer) from tests,
//! tools and demos.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use crate::error::{NetworkError, Result};
use crate::net::options::{SocketOption, SocketOptions};
use crate::net::tcp::config::DEFAULT_BUFFER_SIZE;

#[derive(Debug, Default)]
pub struct TcpClientBuilder {
    remote_address: Option<SocketAddr>,
    local_address: Option<SocketAddr>,
    socket_options: SocketOptions,
    buffer_size: Option<usize>,
    read_timeout: Option<Duration>,
}

impl TcpClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address of the server to connect to. Required.
    pub fn remote_address(mut self, address: SocketAddr) -> Self {
        self.remote_address = Some(address);
        self
    }

    /// Local address to bind before connecting; the OS picks one when unset.
    pub fn bind(mut self, address: SocketAddr) -> Self {
        self.local_address = Some(address);
        self
    }

    pub fn socket_option(mut self, option: SocketOption) -> Self {
        self.socket_options.set(option);
        self
    }

    /// Maximum bytes returned by one [`TcpClient::read_available`].
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    /// Bounds every blocking read; `None` (the default) waits forever.
    pub fn read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<TcpClient> {
        let remote_address = self
            .remote_address
            .ok_or_else(|| NetworkError::Configuration("a remote address is required".into()))?;
        let buffer_size = self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE);
        if buffer_size == 0 {
            return Err(NetworkError::Configuration(
                "buffer_size must be positive".into(),
            ));
        }
        if self.read_timeout == Some(Duration::ZERO) {
            return Err(NetworkError::Configuration(
                "read_timeout must be non-zero".into(),
            ));
        }
        Ok(TcpClient {
            remote_address,
            local_address: self.local_address,
            socket_options: self.socket_options,
            read_timeout: self.read_timeout,
            buffer: vec![0; buffer_size].into_boxed_slice(),
            stream: None,
            closed: false,
        })
    }

    /// Builds the client and connects it.
    pub fn connect(self) -> Result<TcpClient> {
        let mut client = self.build()?;
        client.connect()?;
        Ok(client)
    }
}

/// A single blocking connection.
///
/// Goes through the same states as a server: created, connected, closed. A closed client
/// cannot be reconnected.
pub struct TcpClient {
    remote_address: SocketAddr,
    local_address: Option<SocketAddr>,
    socket_options: SocketOptions,
    read_timeout: Option<Duration>,
    buffer: Box<[u8]>,
    stream: Option<TcpStream>,
    closed: bool,
}

impl TcpClient {
    pub fn builder() -> TcpClientBuilder {
        TcpClientBuilder::new()
    }

    pub fn connect(&mut self) -> Result<()> {
        if self.closed {
            return Err(NetworkError::Closed);
        }
        if self.stream.is_some() {
            return Err(NetworkError::AlreadyConnected);
        }

        let socket = Socket::new(
            Domain::for_address(self.remote_address),
            Type::STREAM,
            Some(Protocol::TCP),
        )
        .map_err(|e| NetworkError::io("creating the client socket", e))?;
        self.socket_options
            .apply_all(&socket)
            .map_err(|(option, e)| NetworkError::io(format!("setting {}", option.name()), e))?;
        if let Some(local) = self.local_address {
            socket.bind(&local.into()).map_err(|source| NetworkError::Bind {
                addr: local,
                source,
            })?;
        }
        socket
            .connect(&self.remote_address.into())
            .map_err(|e| NetworkError::io(format!("connecting to {}", self.remote_address), e))?;
        socket
            .set_read_timeout(self.read_timeout)
            .map_err(|e| NetworkError::io("setting the read timeout", e))?;

        let stream: TcpStream = socket.into();
        self.local_address = Some(
            stream
                .local_addr()
                .map_err(|e| NetworkError::io("reading the local address", e))?,
        );
        debug!(remote = %self.remote_address, local = ?self.local_address, "client connected");
        self.stream = Some(stream);
        Ok(())
    }

    fn stream(&mut self) -> Result<&mut TcpStream> {
        if self.closed {
            return Err(NetworkError::Closed);
        }
        self.stream.as_mut().ok_or(NetworkError::NotConnected)
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream()?;
        stream
            .write_all(data)
            .and_then(|()| stream.flush())
            .map_err(|e| NetworkError::io("writing to server", e))
    }

    /// Performs one read of at most `buffer_size` bytes, blocking until data arrives.
    ///
    /// Returns `None` once the server has closed the connection.
    pub fn read_available(&mut self) -> Result<Option<Vec<u8>>> {
        if self.closed {
            return Err(NetworkError::Closed);
        }
        let stream = self.stream.as_mut().ok_or(NetworkError::NotConnected)?;
        loop {
            return match stream.read(&mut self.buffer) {
                Ok(0) => Ok(None),
                Ok(n) => Ok(Some(self.buffer[..n].to_vec())),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => Err(NetworkError::io("reading from server", e)),
            };
        }
    }

    /// Blocks until exactly `n` bytes have been read.
    pub fn read_exact_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        let stream = self.stream()?;
        let mut out = vec![0; n];
        stream
            .read_exact(&mut out)
            .map_err(|e| NetworkError::io(format!("reading {n} bytes from server"), e))?;
        Ok(out)
    }

    /// Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote_address
    }

    /// Bound local address; known once connected (or when bound explicitly).
    pub fn local_address(&self) -> Option<SocketAddr> {
        self.local_address
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for TcpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpClient")
            .field("remote_address", &self.remote_address)
            .field("local_address", &self.local_address)
            .field("connected", &self.is_connected())
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_remote_address_required() {
        let err = TcpClient::builder().build().unwrap_err();
        assert!(matches!(err, NetworkError::Configuration(_)));
    }

    #[test]
    fn test_connect_states() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpClient::builder()
            .remote_address(listener.local_addr().unwrap())
            .build()
            .unwrap();
        assert!(matches!(
            client.write_bytes(b"x"),
            Err(NetworkError::NotConnected)
        ));

        client.connect().unwrap();
        assert!(client.is_connected());
        assert!(client.local_address().is_some());
        assert!(matches!(
            client.connect(),
            Err(NetworkError::AlreadyConnected)
        ));

        client.close();
        client.close();
        assert!(client.is_closed());
        assert!(matches!(client.connect(), Err(NetworkError::Closed)));
        assert!(matches!(client.read_available(), Err(NetworkError::Closed)));
    }

    #[test]
    fn test_read_and_write() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpClient::builder()
            .remote_address(listener.local_addr().unwrap())
            .buffer_size(4)
            .read_timeout(Some(Duration::from_secs(5)))
            .connect()
            .unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        client.write_bytes(b"ping").unwrap();
        let mut got = [0u8; 4];
        peer.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"ping");

        peer.write_all(b"abcdef").unwrap();
        assert_eq!(client.read_exact_bytes(2).unwrap(), b"ab");
        let rest = client.read_available().unwrap().unwrap();
        assert!(!rest.is_empty() && rest.len() <= 4);

        drop(peer);
        let mut remaining = rest.len();
        while let Some(bytes) = client.read_available().unwrap() {
            remaining += bytes.len();
        }
        assert_eq!(remaining, 4);
    }
}

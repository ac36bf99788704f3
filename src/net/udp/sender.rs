use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::trace;

use crate::error::{NetworkError, Result};

/// Unbound-peer datagram sender, optionally allowed to broadcast.
///
/// The socket binds an ephemeral IPv4 port on all interfaces.
pub struct UdpSender {
    socket: Option<UdpSocket>,
    local_addr: SocketAddr,
    broadcast: bool,
}

impl UdpSender {
    pub fn new(broadcast: bool) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| NetworkError::io("creating the sender socket", e))?;
        if broadcast {
            socket
                .set_broadcast(true)
                .map_err(|e| NetworkError::io("setting SO_BROADCAST", e))?;
        }
        let any = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
        socket
            .bind(&any.into())
            .map_err(|source| NetworkError::Bind { addr: any, source })?;
        let socket: UdpSocket = socket.into();
        let local_addr = socket
            .local_addr()
            .map_err(|e| NetworkError::io("reading the sender address", e))?;
        Ok(Self {
            socket: Some(socket),
            local_addr,
            broadcast,
        })
    }

    /// Sends `data` as one datagram.
    pub fn send_data(&self, data: &[u8], target: SocketAddr) -> Result<()> {
        let socket = self.socket.as_ref().ok_or(NetworkError::Closed)?;
        let n = socket
            .send_to(data, target)
            .map_err(|e| NetworkError::io(format!("sending to {target}"), e))?;
        trace!(bytes = n, %target, "datagram sent");
        Ok(())
    }

    pub fn send_str(&self, text: &str, target: SocketAddr) -> Result<()> {
        self.send_data(text.as_bytes(), target)
    }

    /// Sends `data` to `255.255.255.255:port`. The sender must have been created with
    /// `broadcast` enabled.
    pub fn send_broadcast(&self, data: &[u8], port: u16) -> Result<()> {
        if !self.broadcast {
            return Err(NetworkError::Configuration(
                "sender was created without broadcast enabled".into(),
            ));
        }
        self.send_data(data, SocketAddrV4::new(Ipv4Addr::BROADCAST, port).into())
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_broadcast(&self) -> bool {
        self.broadcast
    }

    /// Releases the socket. Idempotent; later sends fail with [`NetworkError::Closed`].
    pub fn close(&mut self) {
        self.socket = None;
    }

    pub fn is_closed(&self) -> bool {
        self.socket.is_none()
    }
}

impl std::fmt::Debug for UdpSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpSender")
            .field("local_addr", &self.local_addr)
            .field("broadcast", &self.broadcast)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_send_and_close() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let target = receiver.local_addr().unwrap();

        let mut sender = UdpSender::new(false).unwrap();
        assert_ne!(sender.local_address().port(), 0);
        sender.send_data(&[1, 2, 3], target).unwrap();
        sender.send_str("hi", target).unwrap();

        let mut buf = [0u8; 16];
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);
        let (n, from) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hi");
        assert_eq!(from.port(), sender.local_address().port());

        sender.close();
        sender.close();
        assert!(sender.is_closed());
        assert!(matches!(
            sender.send_data(b"x", target),
            Err(NetworkError::Closed)
        ));
    }

    #[test]
    fn test_broadcast_requires_flag() {
        let sender = UdpSender::new(false).unwrap();
        assert!(matches!(
            sender.send_broadcast(b"x", 9),
            Err(NetworkError::Configuration(_))
        ));
        assert!(UdpSender::new(true).unwrap().is_broadcast());
    }
}

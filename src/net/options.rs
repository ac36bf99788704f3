//! Socket options forwarded verbatim to the OS before a socket is bound.

use std::io;
use std::mem::discriminant;
use std::time::Duration;

use socket2::Socket;

/// A socket option and its value.
///
/// Options are applied through `setsockopt` in insertion order. An option the OS rejects for
/// the socket type (for example `NoDelay` on a datagram socket) makes `start()` fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    /// `SO_RCVBUF`
    RecvBufferSize(usize),
    /// `SO_SNDBUF`
    SendBufferSize(usize),
    /// `SO_REUSEADDR`
    ReuseAddress(bool),
    /// `SO_BROADCAST`
    Broadcast(bool),
    /// `TCP_NODELAY`
    NoDelay(bool),
    /// `SO_KEEPALIVE`
    KeepAlive(bool),
    /// `SO_LINGER`
    Linger(Option<Duration>),
    /// `IP_TTL`
    Ttl(u32),
}

impl SocketOption {
    pub fn name(&self) -> &'static str {
        match self {
            SocketOption::RecvBufferSize(_) => "SO_RCVBUF",
            SocketOption::SendBufferSize(_) => "SO_SNDBUF",
            SocketOption::ReuseAddress(_) => "SO_REUSEADDR",
            SocketOption::Broadcast(_) => "SO_BROADCAST",
            SocketOption::NoDelay(_) => "TCP_NODELAY",
            SocketOption::KeepAlive(_) => "SO_KEEPALIVE",
            SocketOption::Linger(_) => "SO_LINGER",
            SocketOption::Ttl(_) => "IP_TTL",
        }
    }

    pub fn apply(&self, socket: &Socket) -> io::Result<()> {
        match *self {
            SocketOption::RecvBufferSize(size) => socket.set_recv_buffer_size(size),
            SocketOption::SendBufferSize(size) => socket.set_send_buffer_size(size),
            SocketOption::ReuseAddress(on) => socket.set_reuse_address(on),
            SocketOption::Broadcast(on) => socket.set_broadcast(on),
            SocketOption::NoDelay(on) => socket.set_nodelay(on),
            SocketOption::KeepAlive(on) => socket.set_keepalive(on),
            SocketOption::Linger(linger) => socket.set_linger(linger),
            SocketOption::Ttl(ttl) => socket.set_ttl(ttl),
        }
    }
}

/// Ordered set of options; setting an option twice keeps the first position and the last value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketOptions {
    options: Vec<SocketOption>,
}

impl SocketOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, option: SocketOption) {
        match self
            .options
            .iter_mut()
            .find(|o| discriminant(&**o) == discriminant(&option))
        {
            Some(slot) => *slot = option,
            None => self.options.push(option),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &SocketOption> {
        self.options.iter()
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    /// Applies every option; stops at the first rejection and reports which option failed.
    pub fn apply_all(&self, socket: &Socket) -> Result<(), (SocketOption, io::Error)> {
        for option in &self.options {
            option.apply(socket).map_err(|e| (*option, e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use socket2::{Domain, Protocol, Type};

    #[test]
    fn test_later_value_replaces_earlier() {
        let mut options = SocketOptions::new();
        options.set(SocketOption::RecvBufferSize(1024));
        options.set(SocketOption::ReuseAddress(true));
        options.set(SocketOption::RecvBufferSize(4096));

        let collected: Vec<_> = options.iter().copied().collect();
        assert_eq!(
            collected,
            vec![
                SocketOption::RecvBufferSize(4096),
                SocketOption::ReuseAddress(true)
            ]
        );
    }

    #[test]
    fn test_apply_to_udp_socket() {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).unwrap();
        let mut options = SocketOptions::new();
        options.set(SocketOption::Broadcast(true));
        options.set(SocketOption::ReuseAddress(true));
        options.set(SocketOption::RecvBufferSize(8192));
        options.apply_all(&socket).unwrap();

        assert!(socket.broadcast().unwrap());
        assert!(socket.reuse_address().unwrap());
        // the kernel may round the buffer size, but never below what was asked
        assert!(socket.recv_buffer_size().unwrap() >= 4096);
    }

    #[test]
    fn test_rejected_option_is_named() {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).unwrap();
        let mut options = SocketOptions::new();
        options.set(SocketOption::NoDelay(true));
        let (option, _err) = options.apply_all(&socket).unwrap_err();
        assert_eq!(option.name(), "TCP_NODELAY");
    }
}

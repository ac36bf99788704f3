//! Per-connection state handed to [`TcpHandler`](crate::handler::TcpHandler) callbacks.
//!
//! A context owns one accepted stream and one fixed-size read buffer. The buffer holds exactly
//! one chunk: every read clears it first, so bytes the handler leaves unconsumed during
//! `channel_read` are gone once the next chunk arrives.
//!
//! ```text
//!  buffer: [ consumed | available ........ | free ]
//!           0         pos                  len    capacity
//! ```

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};

use mio::net::TcpStream;
use socket2::SockRef;
use tracing::debug;

use crate::error::{NetworkError, Result};

/// Unique identifier for connections.
///
/// Assigned when a connection is accepted and constant for its lifetime. Identifiers are
/// unique per server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        ConnectionId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Result of one read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n > 0` bytes are now available in the buffer.
    Data(usize),
    /// Nothing to read right now (spurious wakeup, or the socket is drained).
    Empty,
    /// The peer closed its side.
    EndOfStream,
}

pub struct TcpContext {
    id: ConnectionId,
    worker_index: usize,
    stream: Option<TcpStream>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    buffer: Box<[u8]>,
    pos: usize,
    len: usize,
    open: bool,
}

impl TcpContext {
    pub(crate) fn new(
        id: ConnectionId,
        worker_index: usize,
        stream: TcpStream,
        remote_addr: SocketAddr,
        buffer_size: usize,
    ) -> io::Result<Self> {
        let local_addr = stream.local_addr()?;
        Ok(Self {
            id,
            worker_index,
            stream: Some(stream),
            local_addr,
            remote_addr,
            buffer: vec![0; buffer_size].into_boxed_slice(),
            pos: 0,
            len: 0,
            open: true,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Index of the worker that owns this connection.
    pub fn worker_index(&self) -> usize {
        self.worker_index
    }

    /// Server-side address of the connection.
    pub fn local_address(&self) -> SocketAddr {
        self.local_addr
    }

    /// Peer address of the connection.
    pub fn remote_address(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Capacity of the read buffer.
    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }

    /// Unconsumed bytes of the current chunk.
    pub fn available(&self) -> &[u8] {
        &self.buffer[self.pos..self.len]
    }

    /// Marks `n` bytes of the current chunk as consumed (clamped to what is available).
    pub fn consume(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.len);
    }

    /// Consumes and returns the rest of the current chunk, or `None` when it is drained.
    pub fn take_bytes(&mut self) -> Option<Vec<u8>> {
        if self.pos == self.len {
            return None;
        }
        let bytes = self.available().to_vec();
        self.pos = self.len;
        Some(bytes)
    }

    /// Writes all of `data` to the peer.
    ///
    /// The socket is non-blocking; if the kernel send buffer is full the socket is switched to
    /// blocking mode until the remaining bytes are accepted, which stalls the owning worker.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        if !self.open {
            return Err(NetworkError::Closed);
        }
        let stream = self.stream.as_mut().ok_or(NetworkError::Closed)?;
        let mut written = 0;
        while written < data.len() {
            match stream.write(&data[written..]) {
                Ok(0) => {
                    return Err(NetworkError::io(
                        "writing to connection",
                        io::ErrorKind::WriteZero.into(),
                    ))
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return write_blocking(stream, &data[written..])
                        .map_err(|e| NetworkError::io("writing to connection", e));
                }
                Err(e) => return Err(NetworkError::io("writing to connection", e)),
            }
        }
        Ok(())
    }

    /// Closes the connection. Idempotent, and safe to call from inside a callback.
    ///
    /// The worker notices the closed context once the current callback returns, deregisters
    /// it and delivers `channel_close`.
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        self.pos = 0;
        self.len = 0;
        if let Some(stream) = self.stream.as_ref() {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                debug!(conn = self.id.as_u64(), error = %e, "shutdown failed");
            }
        }
    }

    /// Performs a single read into the cleared buffer.
    pub(crate) fn read(&mut self) -> io::Result<ReadOutcome> {
        self.pos = 0;
        self.len = 0;
        if !self.open {
            return Ok(ReadOutcome::EndOfStream);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(ReadOutcome::EndOfStream);
        };
        loop {
            return match stream.read(&mut self.buffer) {
                Ok(0) => Ok(ReadOutcome::EndOfStream),
                Ok(n) => {
                    self.len = n;
                    Ok(ReadOutcome::Data(n))
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::Empty),
                Err(e) => Err(e),
            };
        }
    }

    pub(crate) fn stream_mut(&mut self) -> Option<&mut TcpStream> {
        self.stream.as_mut()
    }

    /// Drops the socket. Called by the owning worker after deregistration.
    pub(crate) fn release(&mut self) {
        self.close();
        self.stream = None;
    }
}

fn write_blocking(stream: &TcpStream, data: &[u8]) -> io::Result<()> {
    let socket = SockRef::from(stream);
    socket.set_nonblocking(false)?;
    let result = (&*socket).write_all(data);
    let restored = socket.set_nonblocking(true);
    result.and(restored)
}

impl Read for TcpContext {
    /// Reads from the current chunk only; returns `Ok(0)` once it is drained.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let available = self.available();
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

impl Write for TcpContext {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf).map_err(into_io)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.stream.as_mut() {
            Some(stream) if self.open => stream.flush(),
            _ => Err(into_io(NetworkError::Closed)),
        }
    }
}

fn into_io(err: NetworkError) -> io::Error {
    match err {
        NetworkError::Io { source, .. } => source,
        NetworkError::Closed => io::Error::new(io::ErrorKind::NotConnected, "connection closed"),
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

impl std::fmt::Debug for TcpContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpContext")
            .field("id", &self.id)
            .field("worker_index", &self.worker_index)
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("open", &self.open)
            .field("available", &(self.len - self.pos))
            .finish()
    }
}

//! Datagram server.
//!
//! Datagrams carry no connection, so there is no worker pool: a single loop thread owns the
//! bound socket, receives every datagram and calls
//! [`UdpHandler::channel_read`](crate::handler::UdpHandler::channel_read) with its payload and
//! sender. There is no open or close callback per peer.

pub mod config;
pub mod sender;

use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use mio::net::UdpSocket;
use mio::{Events, Interest, Token};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tracing::{debug, error, info, warn};

use crate::error::{NetworkError, Result};
use crate::handler::UdpHandler;
use crate::lifecycle::{Lifecycle, ReleaseOnDrop, ServerState, Termination};
use crate::net::options::SocketOptions;
use crate::net::{NetServer, WorkerInfo};
use crate::poll::{Multiplexer, PollHandle, Selection, Waker};
use crate::thread_pool::ThreadKind;

pub use config::{UdpServerBuilder, UdpServerConfig};
pub use sender::UdpSender;

const SOCKET_TOKEN: Token = Token(1);
const EVENTS_CAPACITY: usize = 64;

/// The server's bound socket as seen by a handler.
pub struct UdpContext {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl UdpContext {
    pub fn local_address(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sends one datagram from the server's socket, e.g. a reply to the sender of the
    /// datagram being handled.
    pub fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<()> {
        let sent = match self.socket.send_to(data, target) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => send_blocking(&self.socket, data, target),
            other => other,
        };
        let n = sent.map_err(|e| NetworkError::io(format!("sending to {target}"), e))?;
        if n != data.len() {
            return Err(NetworkError::io(
                format!("sending to {target}"),
                io::Error::new(io::ErrorKind::WriteZero, "datagram truncated"),
            ));
        }
        Ok(())
    }
}

fn send_blocking(socket: &UdpSocket, data: &[u8], target: SocketAddr) -> io::Result<usize> {
    let sock = SockRef::from(socket);
    sock.set_nonblocking(false)?;
    let result = sock.send_to(data, &target.into());
    let restored = sock.set_nonblocking(true);
    result.and_then(|n| restored.map(|()| n))
}

impl std::fmt::Debug for UdpContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpContext")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

pub struct UdpServer {
    config: UdpServerConfig,
    lifecycle: Lifecycle,
    termination: Arc<Termination>,
    running: Mutex<Option<Running>>,
}

struct Running {
    local_addr: SocketAddr,
    waker: Waker,
    thread: Option<JoinHandle<()>>,
}

impl UdpServer {
    pub fn builder() -> UdpServerBuilder {
        UdpServerBuilder::new()
    }

    pub(crate) fn new(config: UdpServerConfig) -> Self {
        Self {
            config,
            lifecycle: Lifecycle::new(),
            termination: Arc::new(Termination::new()),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &UdpServerConfig {
        &self.config
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn launch(&self) -> Result<Running> {
        let config = &self.config;
        let mut socket = bind_socket(config.address, &config.socket_options)?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| NetworkError::io("reading the bound address", e))?;
        let poll = PollHandle::new()
            .map_err(|e| NetworkError::io("creating the datagram multiplexer", e))?;
        poll.register(&mut socket, SOCKET_TOKEN, Interest::READABLE)
            .map_err(NetworkError::Register)?;

        let waker = poll.waker();
        let datagram_loop = DatagramLoop {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            ctx: UdpContext { socket, local_addr },
            handler: config.handler.clone(),
            buffer: vec![0; config.max_packet_size].into_boxed_slice(),
        };
        let termination = self.termination.clone();
        let thread = config
            .thread_factory
            .new_thread(
                ThreadKind::Acceptor,
                Box::new(move || {
                    let _release = ReleaseOnDrop(&termination);
                    datagram_loop.run();
                }),
            )
            .map_err(|e| NetworkError::io("spawning the datagram thread", e))?;

        Ok(Running {
            local_addr,
            waker,
            thread: Some(thread),
        })
    }
}

impl NetServer for UdpServer {
    fn start(&self) -> Result<()> {
        let mut running = self.running();
        match self.lifecycle.get() {
            ServerState::Started => return Err(NetworkError::AlreadyStarted),
            ServerState::Closed => return Err(NetworkError::Closed),
            ServerState::NotStarted => {}
        }
        let launched = self.launch()?;
        info!(address = %launched.local_addr, "udp server started");
        *running = Some(launched);
        self.lifecycle
            .transition(ServerState::NotStarted, ServerState::Started)
            .map_err(|_| NetworkError::AlreadyStarted)
    }

    fn close(&self) {
        let running = self.running();
        if self.lifecycle.close() == ServerState::Closed {
            return;
        }
        match running.as_ref() {
            None => self.termination.release(),
            Some(running) => {
                if let Err(e) = running.waker.close() {
                    warn!(error = %e, "failed to wake the datagram loop during close");
                }
                info!(address = %running.local_addr, "udp server closing");
            }
        }
    }

    fn await_termination(&self) {
        self.termination.wait();
        let handle = self
            .running()
            .as_mut()
            .and_then(|running| running.thread.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("datagram thread panicked");
            }
        }
    }

    fn local_address(&self) -> Result<SocketAddr> {
        self.running()
            .as_ref()
            .map(|running| running.local_addr)
            .ok_or(NetworkError::NotStarted)
    }

    fn workers(&self) -> Vec<WorkerInfo> {
        Vec::new()
    }

    fn state(&self) -> ServerState {
        self.lifecycle.get()
    }
}

impl Drop for UdpServer {
    fn drop(&mut self) {
        self.close();
    }
}

fn bind_socket(address: SocketAddr, options: &SocketOptions) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(address), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::io("creating the datagram socket", e))?;
    options
        .apply_all(&socket)
        .map_err(|(option, e)| NetworkError::io(format!("setting {}", option.name()), e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| NetworkError::io("making the datagram socket non-blocking", e))?;
    socket
        .bind(&address.into())
        .map_err(|source| NetworkError::Bind {
            addr: address,
            source,
        })?;
    let socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(socket))
}

struct DatagramLoop<M: Multiplexer> {
    poll: M,
    events: Events,
    ctx: UdpContext,
    handler: Arc<dyn UdpHandler>,
    buffer: Box<[u8]>,
}

impl<M: Multiplexer> DatagramLoop<M> {
    fn run(mut self) {
        debug!(address = %self.ctx.local_addr, "datagram loop started");
        loop {
            match self.poll.select(&mut self.events, None) {
                Ok(Selection::Ready) => {}
                Ok(Selection::Closed) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "select failed, stopping datagram loop");
                    self.report(None, NetworkError::io("waiting for datagrams", e));
                    break;
                }
            }
            let readable = self
                .events
                .iter()
                .any(|event| event.token() == SOCKET_TOKEN);
            if readable && !self.receive_pending() {
                break;
            }
        }

        if let Err(e) = self.poll.deregister(&mut self.ctx.socket) {
            debug!(error = %e, "deregistering the datagram socket failed");
        }
        debug!(address = %self.ctx.local_addr, "datagram loop stopped");
    }

    /// Receives until the socket would block. Returns `false` when the socket is unusable.
    fn receive_pending(&mut self) -> bool {
        loop {
            match self.ctx.socket.recv_from(&mut self.buffer) {
                Ok((n, from)) => self.dispatch(n, from),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // ICMP errors from earlier sends surface here on some platforms
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    self.report(None, NetworkError::io("receiving a datagram", e));
                }
                Err(e) => {
                    error!(error = %e, "receive failed, stopping datagram loop");
                    self.report(None, NetworkError::io("receiving a datagram", e));
                    return false;
                }
            }
        }
    }

    fn dispatch(&self, n: usize, from: SocketAddr) {
        let handler = self.handler.as_ref();
        let data = &self.buffer[..n];
        let outcome =
            panic::catch_unwind(AssertUnwindSafe(|| handler.channel_read(&self.ctx, data, from)));
        let err = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e,
            Err(payload) => NetworkError::from_panic(payload),
        };
        warn!(peer = %from, error = %err, "handler callback failed");
        self.report(Some(&self.ctx), err);
    }

    fn report(&self, ctx: Option<&UdpContext>, err: NetworkError) {
        let handler = self.handler.as_ref();
        let delivered = panic::catch_unwind(AssertUnwindSafe(|| handler.exception_caught(ctx, err)));
        if delivered.is_err() {
            error!("exception_caught panicked");
        }
    }
}

//! TCP server: one acceptor thread plus a fixed pool of worker threads.
//!
//! The acceptor owns the listening socket. Every accepted connection gets a [`ConnectionId`]
//! and is handed to exactly one worker, which owns it until it is closed:
//!
//! ```text
//! 1. Acceptor:
//!    listener readable ──> accept() until WouldBlock
//!        - pick a running worker (AssignStrategy, round-robin by default)
//!        - push onto the worker's pending queue, wake the worker
//!        - accept errors, no running worker ──> exception_caught(None, ..)
//!
//! 2. Worker:
//!    woken ──> register pending connections ──> channel_open
//!    readable ──> read chunk ──> channel_read      (bounded number of chunks per round)
//!    EOF / read error / ctx.close() ──> channel_close, connection dropped
//!
//! 3. close():
//!    mark Closed ──> close the acceptor's multiplexer ──> wait until the listener is dropped
//!    acceptor ──> drops the listener ──> stops and joins the workers ──> await_termination returns
//! ```
//!
//! Callbacks for one connection always run on its worker's thread, in the order
//! `channel_open`, `channel_read`*, `channel_close`.

pub mod client;
pub mod config;
pub mod context;
pub(crate) mod worker;

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Token};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use crate::error::{NetworkError, Result};
use crate::handler::TcpHandler;
use crate::lifecycle::{Lifecycle, ReleaseOnDrop, ServerState, Termination};
use crate::net::options::SocketOptions;
use crate::net::{AssignStrategy, NetServer, WorkerInfo};
use crate::poll::{Multiplexer, PollHandle, Selection, Waker};
use crate::thread_pool::ThreadKind;

pub use client::{TcpClient, TcpClientBuilder};
pub use config::{TcpServerBuilder, TcpServerConfig};
pub use context::{ConnectionId, ReadOutcome, TcpContext};

use worker::{report, PendingConnection, WorkerLoop, WorkerShared, EVENTS_CAPACITY};

const LISTENER_TOKEN: Token = Token(1);

/// Reactor-style TCP server.
///
/// Created by [`TcpServer::builder`]; does nothing until [`start`](NetServer::start).
pub struct TcpServer {
    config: TcpServerConfig,
    lifecycle: Lifecycle,
    termination: Arc<Termination>,
    running: Mutex<Option<Running>>,
}

/// Handles kept by the server while its threads run.
struct Running {
    local_addr: SocketAddr,
    acceptor_waker: Waker,
    acceptor_id: ThreadId,
    acceptor_thread: Option<JoinHandle<()>>,
    listener_closed: Arc<Termination>,
    workers: Vec<WorkerInfo>,
}

impl TcpServer {
    pub fn builder() -> TcpServerBuilder {
        TcpServerBuilder::new()
    }

    pub(crate) fn new(config: TcpServerConfig) -> Self {
        Self {
            config,
            lifecycle: Lifecycle::new(),
            termination: Arc::new(Termination::new()),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &TcpServerConfig {
        &self.config
    }

    /// Connections currently owned by all workers together.
    pub fn connection_count(&self) -> usize {
        self.workers().iter().map(WorkerInfo::connection_count).sum()
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn launch(&self) -> Result<Running> {
        let config = &self.config;
        let mut listener = bind_listener(config.address, &config.socket_options, config.backlog)?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| NetworkError::io("reading the bound address", e))?;

        let acceptor_poll =
            PollHandle::new().map_err(|e| NetworkError::io("creating the acceptor multiplexer", e))?;
        acceptor_poll
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(NetworkError::Register)?;

        let mut shared = Vec::with_capacity(config.worker_threads);
        let mut polls = Vec::with_capacity(config.worker_threads);
        for index in 0..config.worker_threads {
            let poll = PollHandle::new()
                .map_err(|e| NetworkError::io("creating a worker multiplexer", e))?;
            shared.push(Arc::new(WorkerShared::new(index, poll.waker())));
            polls.push(poll);
        }

        let mut pool = WorkerPool {
            shared: shared.clone(),
            threads: Vec::with_capacity(config.worker_threads),
        };
        for (poll, worker_shared) in polls.into_iter().zip(shared.iter()) {
            let index = worker_shared.index();
            let worker = WorkerLoop::new(
                worker_shared.clone(),
                poll,
                config.handler.clone(),
                config.buffer_size,
            );
            let handle = config
                .worker_factory
                .new_thread(ThreadKind::Worker(index), Box::new(move || worker.run()))
                .map_err(|e| NetworkError::io("spawning a worker thread", e))?;
            pool.threads.push(handle);
        }

        let workers: Vec<WorkerInfo> = shared
            .iter()
            .zip(pool.threads.iter())
            .map(|(s, handle)| WorkerInfo::new(s.clone(), handle.thread().clone()))
            .collect();

        let acceptor_waker = acceptor_poll.waker();
        let acceptor = Acceptor::new(
            acceptor_poll,
            listener,
            local_addr,
            config.handler.clone(),
            shared,
            config.assign_strategy,
        );
        let termination = self.termination.clone();
        let listener_closed = Arc::new(Termination::new());
        let listening = listener_closed.clone();
        let task = Box::new(move || {
            let _terminated = ReleaseOnDrop(&termination);
            let _pool = pool;
            let listener_guard = ReleaseOnDrop(&listening);
            acceptor.run();
            drop(listener_guard);
        });
        // a task that never ran is dropped here, stopping the workers it owned
        let acceptor_thread = config
            .acceptor_factory
            .new_thread(ThreadKind::Acceptor, task)
            .map_err(|e| NetworkError::io("spawning the acceptor thread", e))?;

        Ok(Running {
            local_addr,
            acceptor_waker,
            acceptor_id: acceptor_thread.thread().id(),
            acceptor_thread: Some(acceptor_thread),
            listener_closed,
            workers,
        })
    }
}

impl NetServer for TcpServer {
    fn start(&self) -> Result<()> {
        let mut running = self.running();
        match self.lifecycle.get() {
            ServerState::Started => return Err(NetworkError::AlreadyStarted),
            ServerState::Closed => return Err(NetworkError::Closed),
            ServerState::NotStarted => {}
        }

        let launched = self.launch()?;
        info!(
            address = %launched.local_addr,
            workers = launched.workers.len(),
            "tcp server started"
        );
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
        let Some(current) = running.as_ref() else {
            self.termination.release();
            return;
        };

        // workers are stopped by the acceptor once it no longer assigns connections
        let woken = current.acceptor_waker.close();
        let local_addr = current.local_addr;
        let listener_closed = current.listener_closed.clone();
        let on_acceptor = thread::current().id() == current.acceptor_id;
        drop(running);

        match woken {
            Ok(()) if !on_acceptor => listener_closed.wait(),
            Ok(()) => {}
            Err(e) => warn!(error = %e, "failed to wake the acceptor during close"),
        }
        info!(address = %local_addr, "tcp server closing");
    }

    fn await_termination(&self) {
        self.termination.wait();
        let handle = self
            .running()
            .as_mut()
            .and_then(|running| running.acceptor_thread.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("acceptor thread panicked");
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
        self.running()
            .as_ref()
            .map(|running| running.workers.clone())
            .unwrap_or_default()
    }

    fn state(&self) -> ServerState {
        self.lifecycle.get()
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Worker threads of one server. Dropping the pool stops every worker and joins it.
struct WorkerPool {
    shared: Vec<Arc<WorkerShared>>,
    threads: Vec<JoinHandle<()>>,
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for worker in &self.shared {
            if let Err(e) = worker.waker().close() {
                warn!(worker = worker.index(), error = %e, "failed to stop worker");
            }
        }
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                warn!("worker thread panicked");
            }
        }
        // a worker that panicked never drained its queue
        for worker in &self.shared {
            let dropped = worker.reclaim().len();
            if dropped > 0 {
                debug!(worker = worker.index(), dropped, "dropped connections that were never opened");
            }
        }
    }
}

pub(crate) fn bind_listener(
    address: SocketAddr,
    options: &SocketOptions,
    backlog: i32,
) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| NetworkError::io("creating the listening socket", e))?;
    #[cfg(unix)]
    socket
        .set_reuse_address(true)
        .map_err(|e| NetworkError::io("setting SO_REUSEADDR", e))?;
    options
        .apply_all(&socket)
        .map_err(|(option, e)| NetworkError::io(format!("setting {}", option.name()), e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| NetworkError::io("making the listening socket non-blocking", e))?;
    socket
        .bind(&address.into())
        .map_err(|source| NetworkError::Bind {
            addr: address,
            source,
        })?;
    socket
        .listen(backlog)
        .map_err(|e| NetworkError::io(format!("listening on {address}"), e))?;
    let listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(listener))
}

/// The loop owning the listening socket.
///
/// The listener lives exactly as long as the acceptor: it is closed when [`run`](Self::run)
/// returns.
struct Acceptor<M: Multiplexer> {
    poll: M,
    events: Events,
    listener: TcpListener,
    local_addr: SocketAddr,
    handler: Arc<dyn TcpHandler>,
    workers: Vec<Arc<WorkerShared>>,
    strategy: AssignStrategy,
    sequence: usize,
    next_id: u64,
}

impl<M: Multiplexer> Acceptor<M> {
    fn new(
        poll: M,
        listener: TcpListener,
        local_addr: SocketAddr,
        handler: Arc<dyn TcpHandler>,
        workers: Vec<Arc<WorkerShared>>,
        strategy: AssignStrategy,
    ) -> Self {
        Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listener,
            local_addr,
            handler,
            workers,
            strategy,
            sequence: 0,
            next_id: 1,
        }
    }

    fn run(mut self) {
        debug!(address = %self.local_addr, "acceptor loop started");
        loop {
            match self.poll.select(&mut self.events, None) {
                Ok(Selection::Ready) => {}
                Ok(Selection::Closed) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "select failed, stopping acceptor");
                    report(
                        self.handler.as_ref(),
                        None,
                        NetworkError::io("waiting for incoming connections", e),
                    );
                    break;
                }
            }
            let listener_ready = self
                .events
                .iter()
                .any(|event| event.token() == LISTENER_TOKEN);
            if listener_ready {
                self.accept_pending();
            }
        }

        if let Err(e) = self.poll.deregister(&mut self.listener) {
            debug!(error = %e, "deregistering the listener failed");
        }
        debug!(address = %self.local_addr, "acceptor loop stopped");
    }

    /// Accepts until the listener would block.
    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, remote_addr)) => self.assign(stream, remote_addr),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if !self.accept_failed(e) {
                        break;
                    }
                }
            }
        }
    }

    /// Reports a failed `accept`. Returns whether the backlog should still be drained: only
    /// errors tied to the one aborted connection leave the listener usable.
    fn accept_failed(&self, e: io::Error) -> bool {
        let per_connection = matches!(
            e.kind(),
            io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
        );
        warn!(error = %e, "accept failed");
        report(self.handler.as_ref(), None, NetworkError::Accept(e));
        per_connection
    }

    fn assign(&mut self, stream: TcpStream, remote_addr: SocketAddr) {
        let id = ConnectionId::new(self.next_id);
        self.next_id += 1;
        let connection = PendingConnection {
            id,
            stream,
            remote_addr,
        };
        let Some(index) = self.strategy.pick(&self.workers, self.sequence) else {
            self.reject(vec![connection]);
            return;
        };
        self.sequence = self.sequence.wrapping_add(1);
        debug!(conn = id.as_u64(), peer = %remote_addr, worker = index, "connection accepted");
        if let Err(rejected) = self.workers[index].assign(connection) {
            self.reject(rejected);
        }
    }

    /// Drops connections no worker took, reporting each one.
    fn reject(&self, rejected: Vec<PendingConnection>) {
        for connection in rejected {
            warn!(
                conn = connection.id.as_u64(),
                peer = %connection.remote_addr,
                "no running worker for connection"
            );
            report(
                self.handler.as_ref(),
                None,
                NetworkError::io(
                    format!("handing over connection from {}", connection.remote_addr),
                    io::Error::new(io::ErrorKind::NotConnected, "worker stopped"),
                ),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::NoOpHandler;
    use std::io::Read;
    use std::sync::mpsc;

    struct Failures(Mutex<mpsc::Sender<(bool, String)>>);

    impl TcpHandler for Failures {
        fn channel_read(&self, ctx: &mut TcpContext) -> Result<()> {
            ctx.take_bytes();
            Ok(())
        }

        fn exception_caught(&self, ctx: Option<&mut TcpContext>, error: NetworkError) {
            let _ = self.0.lock().unwrap().send((ctx.is_some(), error.to_string()));
        }
    }

    fn acceptor(workers: Vec<Arc<WorkerShared>>) -> (Acceptor<PollHandle>, mpsc::Receiver<(bool, String)>) {
        let (tx, rx) = mpsc::channel();
        let listener = TcpListener::bind(loopback()).unwrap();
        let local_addr = listener.local_addr().unwrap();
        let acceptor = Acceptor::new(
            PollHandle::new().unwrap(),
            listener,
            local_addr,
            Arc::new(Failures(Mutex::new(tx))),
            workers,
            AssignStrategy::RoundRobin,
        );
        (acceptor, rx)
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_local_address_requires_start() {
        let server = TcpServer::builder()
            .handler(NoOpHandler)
            .bind(loopback())
            .build()
            .unwrap();
        assert!(matches!(
            server.local_address(),
            Err(NetworkError::NotStarted)
        ));
        assert_eq!(server.state(), ServerState::NotStarted);
        assert!(server.workers().is_empty());
    }

    #[test]
    fn test_bind_conflict_leaves_server_not_started() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = taken.local_addr().unwrap();
        let server = TcpServer::builder()
            .handler(NoOpHandler)
            .socket_option(crate::net::SocketOption::ReuseAddress(false))
            .bind(address)
            .build()
            .unwrap();

        let err = server.start().unwrap_err();
        assert!(matches!(err, NetworkError::Bind { .. }), "{err}");
        assert_eq!(server.state(), ServerState::NotStarted);

        drop(taken);
        // the caller may retry once the address is free
        let retried = server.start();
        if retried.is_ok() {
            assert!(server.is_started());
            server.close();
            server.await_termination();
        }
    }

    #[test]
    fn test_close_before_start_releases_waiters() {
        let server = TcpServer::builder().handler(NoOpHandler).build().unwrap();
        server.close();
        assert!(server.is_closed());
        server.await_termination();
        assert!(matches!(server.start(), Err(NetworkError::Closed)));
    }

    #[test]
    fn test_start_close_await() {
        let server = TcpServer::builder()
            .handler(NoOpHandler)
            .worker_threads(2)
            .bind(loopback())
            .start()
            .unwrap();
        let address = server.local_address().unwrap();
        assert_ne!(address.port(), 0);
        assert_eq!(server.workers().len(), 2);

        server.close();
        server.close();
        server.await_termination();
        assert!(server.is_closed());
        assert_eq!(server.local_address().unwrap(), address);
        for worker in server.workers() {
            assert_eq!(worker.connection_count(), 0);
        }
    }

    #[test]
    fn test_accept_failures_are_reported_without_context() {
        let (acceptor, rx) = acceptor(Vec::new());

        assert!(acceptor.accept_failed(io::ErrorKind::ConnectionAborted.into()));
        assert!(!acceptor.accept_failed(io::Error::new(io::ErrorKind::Other, "too many open files")));

        let (with_ctx, message) = rx.try_recv().unwrap();
        assert!(!with_ctx);
        assert!(message.starts_with("accept failed"), "{message}");
        let (with_ctx, message) = rx.try_recv().unwrap();
        assert!(!with_ctx);
        assert!(message.contains("too many open files"), "{message}");
    }

    #[test]
    fn test_connection_without_running_worker_is_reported_and_dropped() {
        let poll = PollHandle::new().unwrap();
        let worker = Arc::new(WorkerShared::new(0, poll.waker()));
        poll.close().unwrap();
        let (mut acceptor, rx) = acceptor(vec![worker.clone()]);

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        acceptor.assign(TcpStream::from_std(server), peer);

        let (with_ctx, message) = rx.try_recv().unwrap();
        assert!(!with_ctx);
        assert!(message.contains("worker stopped"), "{message}");
        assert_eq!(worker.connection_count(), 0);
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_close_drops_the_listener_before_returning() {
        let server = TcpServer::builder()
            .handler(NoOpHandler)
            .bind(loopback())
            .start()
            .unwrap();
        let address = server.local_address().unwrap();

        server.close();
        let refused =
            std::net::TcpStream::connect_timeout(&address, std::time::Duration::from_millis(200));
        assert!(refused.is_err());
        server.await_termination();
    }
}

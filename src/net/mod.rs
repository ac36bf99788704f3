//! Socket servers built on the reactor primitives of this crate.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          TcpServer                                │
//! │                                                                   │
//! │  ┌──────────────────┐  assign   ┌────────────────────────────┐    │
//! │  │ acceptor thread  │─────────▶│ worker 0: PollHandle        │    │
//! │  │  PollHandle      │  (round   │   connections {ctx, ctx..} │    │
//! │  │  TcpListener     │  robin)   ├────────────────────────────┤    │
//! │  └──────────────────┘─────────▶│ worker 1: PollHandle        │    │
//! │                                 │   connections {ctx, ...}   │    │
//! │                                 └────────────┬───────────────┘    │
//! └──────────────────────────────────────────────┼────────────────────┘
//!                                                │ channel_open / channel_read /
//!                                                ▼ channel_close / exception_caught
//!                                         ┌──────────────┐
//!                                         │  TcpHandler  │ (shared, Send + Sync)
//!                                         └──────────────┘
//! ```
//!
//! A [`UdpServer`](udp::UdpServer) has no workers: datagrams carry no connection, so its single
//! loop thread reads and dispatches every datagram itself.
//!
//! # Example
//!
//! ```rust,no_run
//! use mill_server::error::Result;
//! use mill_server::handler::TcpHandler;
//! use mill_server::net::tcp::{TcpContext, TcpServer};
//! use mill_server::net::NetServer;
//!
//! struct Echo;
//!
//! impl TcpHandler for Echo {
//!     fn channel_read(&self, ctx: &mut TcpContext) -> Result<()> {
//!         if let Some(bytes) = ctx.take_bytes() {
//!             ctx.write_bytes(&bytes)?;
//!         }
//!         Ok(())
//!     }
//! }
//!
//! # fn main() -> Result<()> {
//! let server = TcpServer::builder()
//!     .handler(Echo)
//!     .worker_threads(4)
//!     .bind("127.0.0.1:8080".parse().unwrap())
//!     .start()?;
//! println!("listening on {}", server.local_address()?);
//! server.await_termination();
//! # Ok(())
//! # }
//! ```

pub mod options;
pub mod tcp;
pub mod udp;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::Thread;

use crate::error::Result;
use crate::lifecycle::ServerState;
use tcp::worker::WorkerShared;

pub use options::{SocketOption, SocketOptions};

/// Operations shared by every server in the crate.
pub trait NetServer: Send + Sync {
    /// Binds the socket, applies socket options and spawns the loop threads.
    ///
    /// Fails with [`AlreadyStarted`](crate::error::NetworkError::AlreadyStarted) on a running
    /// server and [`Closed`](crate::error::NetworkError::Closed) on a closed one; in both cases
    /// nothing changes. Setup failures leave the server `NotStarted`.
    fn start(&self) -> Result<()>;

    /// Stops accepting and signals every loop to stop. Idempotent.
    ///
    /// A TCP server returns once its listening socket is closed; connection callbacks may still
    /// be running. Use [`await_termination`](Self::await_termination) to wait for them.
    fn close(&self);

    /// Blocks until the server's loop threads have terminated.
    ///
    /// Only returns after [`close`](Self::close) (or a fatal loop error); it is fine to call it
    /// before `start`.
    fn await_termination(&self);

    /// Address the server is bound to. Fails with `NotStarted` before a successful start.
    fn local_address(&self) -> Result<SocketAddr>;

    /// Live view of the worker pool; empty before start and for datagram servers.
    fn workers(&self) -> Vec<WorkerInfo>;

    fn state(&self) -> ServerState;

    fn is_started(&self) -> bool {
        self.state() == ServerState::Started
    }

    fn is_closed(&self) -> bool {
        self.state() == ServerState::Closed
    }
}

/// How the acceptor picks the worker for a new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssignStrategy {
    /// Worker `i % n` for the `i`-th accepted connection.
    #[default]
    RoundRobin,
    /// Worker with the fewest owned connections; lowest index wins ties.
    LeastConnections,
}

impl AssignStrategy {
    /// Index of the worker for the `sequence`-th accepted connection. Stopped workers are
    /// skipped; `None` when every worker has stopped.
    pub(crate) fn pick(&self, workers: &[Arc<WorkerShared>], sequence: usize) -> Option<usize> {
        let count = workers.len();
        match self {
            AssignStrategy::RoundRobin => (0..count)
                .map(|offset| sequence.wrapping_add(offset) % count)
                .find(|&index| !workers[index].is_stopped()),
            AssignStrategy::LeastConnections => workers
                .iter()
                .enumerate()
                .filter(|(_, w)| !w.is_stopped())
                .min_by_key(|(index, w)| (w.connection_count(), *index))
                .map(|(index, _)| index),
        }
    }
}

/// One worker of a server's pool.
#[derive(Clone)]
pub struct WorkerInfo {
    shared: Arc<WorkerShared>,
    thread: Thread,
}

impl WorkerInfo {
    pub(crate) fn new(shared: Arc<WorkerShared>, thread: Thread) -> Self {
        Self { shared, thread }
    }

    pub fn index(&self) -> usize {
        self.shared.index()
    }

    /// The thread running this worker's loop.
    pub fn thread(&self) -> &Thread {
        &self.thread
    }

    /// Connections currently owned by this worker.
    pub fn connection_count(&self) -> usize {
        self.shared.connection_count()
    }
}

impl fmt::Debug for WorkerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerInfo")
            .field("index", &self.index())
            .field("thread", &self.thread.name())
            .field("connection_count", &self.connection_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::{Multiplexer, PollHandle};

    fn pool(n: usize) -> Vec<Arc<WorkerShared>> {
        (0..n)
            .map(|i| Arc::new(WorkerShared::new(i, PollHandle::new().unwrap().waker())))
            .collect()
    }

    #[test]
    fn test_round_robin_cycles() {
        let workers = pool(3);
        let picks: Vec<_> = (0..7)
            .map(|i| AssignStrategy::RoundRobin.pick(&workers, i).unwrap())
            .collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_least_connections_prefers_lowest_index_on_tie() {
        let workers = pool(3);
        assert_eq!(AssignStrategy::LeastConnections.pick(&workers, 0), Some(0));
    }

    #[test]
    fn test_stopped_workers_are_skipped() {
        let workers = pool(3);
        let _ = workers[1].waker().close();

        let picks: Vec<_> = (0..4)
            .map(|i| AssignStrategy::RoundRobin.pick(&workers, i).unwrap())
            .collect();
        assert_eq!(picks, vec![0, 2, 2, 0]);

        let _ = workers[0].waker().close();
        assert_eq!(AssignStrategy::LeastConnections.pick(&workers, 0), Some(2));

        let _ = workers[2].waker().close();
        assert_eq!(AssignStrategy::RoundRobin.pick(&workers, 0), None);
        assert_eq!(AssignStrategy::LeastConnections.pick(&workers, 0), None);
    }
}

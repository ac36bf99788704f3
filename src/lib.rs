//! # Mill-Server
//! Reactor-style TCP and UDP socket servers built on top of [`mio`], without an async runtime.
//! A server owns one acceptor thread and a fixed pool of worker threads; every accepted connection
//! belongs to exactly one worker for its whole life, so all callbacks for a connection run on
//! one thread, in order.
//! ## Features
//! - **Runtime-agnostic**: plain OS threads blocking in `select`, no Tokio
//! - **Cross-platform**: mio's polling abstraction (epoll, kqueue, IOCP)
//! - **Ordered callbacks**: `channel_open` → `channel_read`* → `channel_close` on the owning worker
//! - **Fault isolation**: handler errors and panics are routed to `exception_caught`; a bad
//!   connection never stops a loop
//! - **Lock-free hand-off**: accepted connections reach their worker through a lock-free queue
//!   and a waker
//! - **Graceful shutdown**: `close()` stops accepting and signals every loop, `await_termination()`
//!   waits for them
//! ## Architecture Overview
//! ```text
//! ┌─────────────┐    ┌──────────────┐    ┌──────────────────┐
//! │  TcpServer  │───▶│   Acceptor   │───▶│ Worker 0..N      │
//! └─────────────┘    │  PollHandle  │    │  PollHandle      │
//!                    └──────────────┘    │  TcpContext set  │
//!                                        └────────┬─────────┘
//!                                                 ▼
//!                                        ┌──────────────────┐
//!                                        │    TcpHandler    │
//!                                        └──────────────────┘
//! ```
//! ## Quick Start
//!
//! ```rust,no_run
//! use mill_server::prelude::*;
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
//! fn main() -> Result<()> {
//!     let server = TcpServer::builder()
//!         .handler(Echo)
//!         .worker_threads(4)
//!         .bind("127.0.0.1:8080".parse().unwrap())
//!         .start()?;
//!
//!     println!("Server listening on {}", server.local_address()?);
//!     server.await_termination();
//!     Ok(())
//! }
//! ```
//!
//! - [`net::tcp::TcpServer`]: acceptor + worker pool for stream sockets
//! - [`net::udp::UdpServer`]: single-loop datagram server
//! - [`handler`]: callback contracts implemented by applications
//! - [`poll`]: the [`Multiplexer`](poll::Multiplexer) abstraction and its mio implementation
//! - [`thread_pool`]: thread factories for the loop threads
//! - [`lifecycle`]: server state machine and termination latch
//! - [`error`]: error types and result handling

pub mod error;
pub mod handler;
pub mod lifecycle;
pub mod net;
pub mod poll;
pub mod thread_pool;

pub use error::{NetworkError, Result};
pub use handler::{NoOpHandler, TcpHandler, UdpHandler};
pub use lifecycle::ServerState;
pub use net::tcp::{TcpClient, TcpContext, TcpServer};
pub use net::udp::{UdpContext, UdpSender, UdpServer};
pub use net::{AssignStrategy, NetServer, SocketOption, WorkerInfo};

/// Re-exports of the types needed to write a handler and run a server.
///
/// ```rust
/// use mill_server::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{NetworkError, Result};
    pub use crate::handler::{TcpHandler, UdpHandler};
    pub use crate::net::tcp::{ConnectionId, TcpClient, TcpContext, TcpServer};
    pub use crate::net::udp::{UdpContext, UdpSender, UdpServer};
    pub use crate::net::{AssignStrategy, NetServer, SocketOption};
    pub use crate::thread_pool::{NamedThreadFactory, ThreadFactory, ThreadKind};
}

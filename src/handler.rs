//! Callback contracts implemented by applications.
//!
//! A handler instance is shared by every loop thread of a server. Callbacks for different
//! connections may run at the same time on different workers, so implementations must be
//! `Send + Sync`. Callbacks for one connection always run one after another on the worker that
//! owns it:
//!
//! ```text
//! channel_open ──▶ channel_read* ──▶ channel_close      (same thread, in this order)
//! ```
//!
//! Returning `Err` (or panicking) from `channel_open`, `channel_read` or `channel_close` does not
//! stop the loop and does not close the connection: the error is passed to `exception_caught`
//! and the handler decides what to do, typically `ctx.close()`.

use crate::error::{NetworkError, Result};
use crate::net::tcp::context::TcpContext;
use crate::net::udp::UdpContext;
use std::net::SocketAddr;

pub trait TcpHandler: Send + Sync + 'static {
    /// Called once, on the owning worker's thread, before any read is delivered.
    fn channel_open(&self, ctx: &mut TcpContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Called once per non-empty read. The chunk is only valid for the duration of the call:
    /// the next read reuses the same buffer.
    fn channel_read(&self, ctx: &mut TcpContext) -> Result<()>;

    /// Called exactly once, after the socket has been closed, whichever side closed it.
    fn channel_close(&self, ctx: &mut TcpContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Receives every error tied to a connection (`Some`) or to the server itself (`None`).
    fn exception_caught(&self, ctx: Option<&mut TcpContext>, error: NetworkError) {
        let _ = (ctx, error);
    }
}

pub trait UdpHandler: Send + Sync + 'static {
    /// Called once per received datagram with its payload and sender.
    fn channel_read(&self, ctx: &UdpContext, data: &[u8], from: SocketAddr) -> Result<()>;

    fn exception_caught(&self, ctx: Option<&UdpContext>, error: NetworkError) {
        let _ = (ctx, error);
    }
}

/// Handler that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpHandler;

impl TcpHandler for NoOpHandler {
    fn channel_read(&self, ctx: &mut TcpContext) -> Result<()> {
        ctx.take_bytes();
        Ok(())
    }
}

impl UdpHandler for NoOpHandler {
    fn channel_read(&self, _ctx: &UdpContext, _data: &[u8], _from: SocketAddr) -> Result<()> {
        Ok(())
    }
}

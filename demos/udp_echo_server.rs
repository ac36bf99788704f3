use std::net::SocketAddr;

use anyhow::Context;
use mill_server::prelude::*;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Sends every datagram back to where it came from.
struct EchoHandler;

impl UdpHandler for EchoHandler {
    fn channel_read(&self, ctx: &UdpContext, data: &[u8], from: SocketAddr) -> Result<()> {
        info!(peer = %from, bytes = data.len(), "datagram received");
        ctx.send_to(data, from)
    }

    fn exception_caught(&self, _ctx: Option<&UdpContext>, error: NetworkError) {
        error!(%error, "udp server error");
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let address: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9090".to_string())
        .parse()
        .context("invalid listen address")?;

    let server = UdpServer::builder()
        .handler(EchoHandler)
        .bind(address)
        .start()
        .context("failed to start udp echo server")?;

    info!(address = %server.local_address()?, "udp echo server listening");

    // say hello to ourselves so there is something in the log
    let sender = UdpSender::new(false)?;
    sender.send_str("hello", server.local_address()?)?;

    server.await_termination();
    Ok(())
}

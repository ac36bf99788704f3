use std::net::SocketAddr;

use anyhow::Context;
use mill_server::prelude::*;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// a simple handler that echoes data back to the client.
struct EchoHandler;

impl TcpHandler for EchoHandler {
    fn channel_open(&self, ctx: &mut TcpContext) -> Result<()> {
        info!(
            conn = ctx.id().as_u64(),
            peer = %ctx.remote_address(),
            worker = ctx.worker_index(),
            "client connected"
        );
        Ok(())
    }

    fn channel_read(&self, ctx: &mut TcpContext) -> Result<()> {
        let Some(data) = ctx.take_bytes() else {
            return Ok(());
        };
        info!(
            conn = ctx.id().as_u64(),
            bytes = data.len(),
            message = %String::from_utf8_lossy(&data).trim_end(),
            "received"
        );

        // echo the received data back to the sender.
        ctx.write_bytes(&data)
    }

    fn channel_close(&self, ctx: &mut TcpContext) -> Result<()> {
        info!(conn = ctx.id().as_u64(), "client disconnected");
        Ok(())
    }

    fn exception_caught(&self, ctx: Option<&mut TcpContext>, error: NetworkError) {
        match ctx {
            Some(ctx) => {
                error!(conn = ctx.id().as_u64(), %error, "connection error");
                ctx.close();
            }
            None => error!(%error, "server error"),
        }
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
        .unwrap_or_else(|| "127.0.0.1:8080".to_string())
        .parse()
        .context("invalid listen address")?;

    let server = TcpServer::builder()
        .handler(EchoHandler)
        .worker_threads(4)
        .socket_option(SocketOption::NoDelay(true))
        .bind(address)
        .start()
        .context("failed to start echo server")?;

    info!(address = %server.local_address()?, "echo server listening");

    // blocks until the server is closed.
    server.await_termination();
    Ok(())
}

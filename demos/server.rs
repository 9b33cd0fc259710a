//! Minimal SOCKS server on the default port.
//!
//! Run with `cargo run --example server`, then point any SOCKS5 client
//! (or the client example) at 127.0.0.1:1080.

use anyhow::Result;
use sockstack::SocksServer;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let mut server = SocksServer::new("127.0.0.1:1080");
    server.run().await?;
    Ok(())
}

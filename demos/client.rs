//! Fetches a page through a local SOCKS proxy.
//!
//! Start the server example first, then run
//! `cargo run --example client`.

use anyhow::Result;
use sockstack::{SocksProxy, SocksStream};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let proxy = SocksProxy::socks5("127.0.0.1", 1080);
    let mut stream = SocksStream::connect(&proxy, "example.com", 80).await?;

    stream
        .write_all(b"GET / HTTP/1.0\r\nHost: example.com\r\n\r\n")
        .await?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;

    let text = String::from_utf8_lossy(&response);
    println!("{}", text.lines().next().unwrap_or("(empty response)"));
    Ok(())
}

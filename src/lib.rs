//! A SOCKS4 and SOCKS5 protocol engine: client, server, and the plumbing
//! between them
//!
//! ## SOCKS Implementation
//!
//! - Features:
//!     - CONNECT, BIND, and UDP ASSOCIATE on SOCKS5
//!     - CONNECT and BIND on SOCKS4
//!     - No Authentication and Username/Password (RFC 1929)
//!     - Pluggable authentication seams on both the client and the server
//!     - Proxy chaining and direct-connection bypass lists
//!     - High-level stream, listener, and datagram socket types
//!     - Idle-based relay and association teardown
//! - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928)
//! - [Username/Password Authentication (RFC 1929)](https://datatracker.ietf.org/doc/html/rfc1929)
//!
//! # Example
//! ```no_run
//! use sockstack::{SocksProxy, SocksStream};
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let proxy = SocksProxy::socks5("127.0.0.1", 1080);
//!     let mut stream = SocksStream::connect(&proxy, "example.com", 80).await?;
//!     stream.write_all(b"GET / HTTP/1.0\r\nHost: example.com\r\n\r\n").await?;
//!     let mut response = Vec::new();
//!     stream.read_to_end(&mut response).await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod authenticator;
pub mod client;
pub mod config;
pub mod error;
pub mod message;
pub mod protocol;
pub mod range;
pub mod relay;
pub mod server;
pub mod socket;
pub mod udp;
pub mod udp_relay;

// Re-export main types at crate root for convenience
pub use client::{SocksProxy, SocksSession};
pub use config::SocksConfig;
pub use error::{Result, SocksError};
pub use message::{Address, ProxyMessage};
pub use protocol::{AuthMethod, Command, ReplyCode, Version};
pub use range::AddressRange;
pub use server::SocksServer;
pub use socket::{SocksListener, SocksStream};
pub use udp::SocksUdpSocket;

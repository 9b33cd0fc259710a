use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;
use sockstack::SocksConfig;
use sockstack::SocksServer;
use sockstack::authenticator::{OpenAuthenticator, ServerAuthenticator, UserPassAuthenticator};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "A SOCKS4 and SOCKS5 proxy server", long_about = None)]
struct Args {
    /// Listener address
    #[arg(short, long, default_value = "127.0.0.1:1080")]
    listen: String,

    /// Username for username/password authentication
    #[arg(short, long)]
    username: Option<String>,

    /// Password for username/password authentication
    #[arg(short, long)]
    password: Option<String>,

    /// Relay idle timeout in seconds
    #[arg(long, default_value_t = 180)]
    idle_timeout: u64,

    /// Bind accept timeout in seconds
    #[arg(long, default_value_t = 180)]
    accept_timeout: u64,

    /// UDP association idle timeout in seconds
    #[arg(long, default_value_t = 180)]
    udp_timeout: u64,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse args
    let args = Args::parse();

    // Initialize tracing subscriber
    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    // Check for auth and grab it if present
    let authenticator: Arc<dyn ServerAuthenticator> = match (args.username, args.password) {
        (Some(u), Some(p)) => {
            info!("Authentication enabled");
            Arc::new(UserPassAuthenticator::new(u, p))
        }
        (None, None) => Arc::new(OpenAuthenticator),
        _ => bail!("must provide both username and password (or neither)"),
    };

    let config = SocksConfig::default()
        .with_idle_timeout(Duration::from_secs(args.idle_timeout))
        .with_accept_timeout(Duration::from_secs(args.accept_timeout))
        .with_udp_timeout(Duration::from_secs(args.udp_timeout));

    // Instantiate server
    let mut server = SocksServer::new(args.listen)
        .with_authenticator(authenticator)
        .with_config(config);

    // Run it
    info!("Starting SOCKS proxy: {}", server.listen_addr());
    server.run().await?;
    Ok(())
}

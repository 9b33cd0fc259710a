use std::time::Duration;

use crate::client::SocksProxy;

/// SocksConfig carries the process-wide tuning knobs for both the client
/// engine and the server daemon. Construct one, adjust fields, and pass it
/// into the respective constructors; the defaults below are the values the
/// engine ships with.
#[derive(Debug, Clone)]
pub struct SocksConfig {
    /// Maximum silence on a TCP relay pipe before teardown.
    pub idle_timeout: Duration,

    /// Maximum wait for the incoming connection of a BIND session.
    pub accept_timeout: Duration,

    /// Maximum silence on a UDP relay before teardown.
    pub udp_timeout: Duration,

    /// Receive buffer size for relayed datagrams.
    pub datagram_size: usize,

    /// Upstream proxy the server dials outbound connections through.
    /// `None` means connect directly.
    pub chain: Option<Box<SocksProxy>>,
}

impl Default for SocksConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(180),
            accept_timeout: Duration::from_secs(180),
            udp_timeout: Duration::from_secs(180),
            datagram_size: 0xFFFF,
            chain: None,
        }
    }
}

/// SocksConfig implementation block
impl SocksConfig {
    /// new returns the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// with_idle_timeout sets the TCP relay idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// with_accept_timeout sets the BIND accept timeout.
    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    /// with_udp_timeout sets the UDP relay idle timeout.
    pub fn with_udp_timeout(mut self, timeout: Duration) -> Self {
        self.udp_timeout = timeout;
        self
    }

    /// with_chain routes the server's outbound connections through an
    /// upstream proxy.
    pub fn with_chain(mut self, proxy: SocksProxy) -> Self {
        self.chain = Some(Box::new(proxy));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_shipped_values() {
        let config = SocksConfig::default();
        assert_eq!(config.idle_timeout, Duration::from_secs(180));
        assert_eq!(config.accept_timeout, Duration::from_secs(180));
        assert_eq!(config.udp_timeout, Duration::from_secs(180));
        assert_eq!(config.datagram_size, 0xFFFF);
        assert!(config.chain.is_none());
    }

    #[test]
    fn builders_override_defaults() {
        let config = SocksConfig::new()
            .with_idle_timeout(Duration::from_millis(200))
            .with_accept_timeout(Duration::from_secs(5));
        assert_eq!(config.idle_timeout, Duration::from_millis(200));
        assert_eq!(config.accept_timeout, Duration::from_secs(5));
    }
}

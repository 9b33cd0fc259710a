//! UDP association sockets.
//!
//! [`SocksUdpSocket`] is the client side of a SOCKS5 UDP association: it
//! keeps the control connection alive, prefixes the relay header on the way
//! out, strips it on the way in, and applies the datagram framing the
//! authentication scheme negotiated. Destinations covered by the proxy's
//! direct classifier are exchanged with raw, headerless datagrams.
//!
//! [`WhitelistedUdpSocket`] is the server side's client-facing socket: it
//! only accepts traffic from the one endpoint named at association time,
//! locking the port from the first matching packet when the client did not
//! commit to one.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout};
use tracing::debug;

use crate::auth::{IdentityEncapsulation, UdpEncapsulation};
use crate::client::{SocksProxy, SocksSession};
use crate::error::{Result, SocksError};
use crate::message::{Address, UdpHeader};
use crate::protocol::FRAG_NONE;
use crate::range::AddressRange;

/// SocksUdpSocket sends and receives datagrams through a SOCKS5 UDP
/// association.
pub struct SocksUdpSocket {
    socket: UdpSocket,
    relay: SocketAddr,
    control: SocksSession,
    encapsulation: Arc<dyn UdpEncapsulation>,
    directs: AddressRange,
    resolve_locally: bool,
    datagram_size: usize,
}

/// SocksUdpSocket implementation block
impl SocksUdpSocket {
    /// associate binds a local datagram socket and registers it with the
    /// proxy. The request carries 0.0.0.0 plus the local port, letting the
    /// server whitelist the address it actually sees the control connection
    /// from.
    pub async fn associate(proxy: &SocksProxy) -> Result<SocksUdpSocket> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        let local = socket.local_addr()?;

        let control = proxy
            .udp_associate(Address::Ip(Ipv4Addr::UNSPECIFIED), local.port())
            .await?;

        // An unspecified relay address means "same host as the proxy"
        let relay_ip = match control.bound_addr() {
            Address::Ip(ip) if !ip.is_unspecified() => *ip,
            _ => proxy.proxy_addr().resolve().await?,
        };
        let relay = SocketAddr::V4(SocketAddrV4::new(relay_ip, control.bound_port()));
        debug!("UDP association up, relay at {relay}");

        let encapsulation = control
            .encapsulation()
            .unwrap_or_else(|| Arc::new(IdentityEncapsulation));

        Ok(SocksUdpSocket {
            socket,
            relay,
            control,
            encapsulation,
            directs: proxy.direct_hosts().clone(),
            resolve_locally: proxy.resolves_locally(),
            datagram_size: proxy.config().datagram_size,
        })
    }

    /// local_addr returns the local datagram endpoint.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// relay_addr returns the proxy's relay endpoint for this association.
    pub fn relay_addr(&self) -> SocketAddr {
        self.relay
    }

    /// send_to sends one datagram to `host:port`. Direct destinations get
    /// the raw payload; everything else is headered, framed, and handed to
    /// the relay.
    pub async fn send_to(&self, payload: &[u8], host: &str, port: u16) -> Result<()> {
        if self.directs.contains(host) {
            self.socket.send_to(payload, (host, port)).await?;
            return Ok(());
        }

        let addr = if self.resolve_locally {
            Address::Ip(Address::from(host).resolve().await?)
        } else {
            Address::from(host)
        };

        let packet = UdpHeader::new(addr, port).encode(payload)?;
        let packet = self.encapsulation.wrap(&packet)?;
        self.socket.send_to(&packet, self.relay).await?;
        Ok(())
    }

    /// recv_from receives one datagram. Relay traffic is unframed and
    /// stripped of its header, and the header names the source; traffic
    /// from anyone else is direct and passes through as-is. Payloads
    /// longer than `buf` are truncated.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Address, u16)> {
        let mut scratch = vec![0u8; self.datagram_size];
        loop {
            let (n, src) = self.socket.recv_from(&mut scratch).await?;

            if src == self.relay {
                let plain = self.encapsulation.unwrap(&scratch[..n])?;
                let (header, offset) = UdpHeader::decode(&plain)?;
                if header.frag != FRAG_NONE {
                    debug!("dropping fragmented datagram from relay");
                    continue;
                }
                let payload = &plain[offset..];
                let len = payload.len().min(buf.len());
                buf[..len].copy_from_slice(&payload[..len]);
                return Ok((len, header.addr, header.port));
            }

            // Direct peers bypass the relay and send raw datagrams
            match src {
                SocketAddr::V4(sa) => {
                    let len = n.min(buf.len());
                    buf[..len].copy_from_slice(&scratch[..len]);
                    return Ok((len, Address::Ip(*sa.ip()), sa.port()));
                }
                SocketAddr::V6(_) => {
                    debug!("dropping IPv6 datagram from {src}");
                }
            }
        }
    }

    /// close tears the association down by closing its control connection.
    pub async fn close(self) {
        self.control.close().await;
    }
}

/// WhitelistedUdpSocket receives only from one expected endpoint.
pub struct WhitelistedUdpSocket {
    socket: UdpSocket,
    expected: SocketAddr,
    peer: Mutex<Option<SocketAddr>>,
}

/// WhitelistedUdpSocket implementation block
impl WhitelistedUdpSocket {
    /// bind opens an ephemeral socket that accepts traffic from `expected`.
    /// Port 0 means the client did not commit to a source port; the first
    /// packet from the expected IP locks it.
    pub async fn bind(expected: SocketAddr) -> Result<WhitelistedUdpSocket> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        let peer = (expected.port() != 0).then_some(expected);
        Ok(WhitelistedUdpSocket {
            socket,
            expected,
            peer: Mutex::new(peer),
        })
    }

    /// local_addr returns the bound endpoint, the one advertised to the
    /// client as its relay address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// peer returns the locked client endpoint, once there is one.
    pub fn peer(&self) -> Option<SocketAddr> {
        *self.peer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// recv_from waits for a whitelisted datagram. Foreign packets are
    /// dropped and the wait continues on the remaining budget.
    pub async fn recv_from(&self, buf: &mut [u8], budget: Duration) -> Result<(usize, SocketAddr)> {
        let deadline = Instant::now() + budget;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SocksError::Timeout(budget));
            }

            match timeout(remaining, self.socket.recv_from(buf)).await {
                Err(_) => return Err(SocksError::Timeout(budget)),
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok((n, src))) => {
                    if !self.allow(src) {
                        debug!("dropping datagram from unauthorized source {src}");
                        continue;
                    }
                    return Ok((n, src));
                }
            }
        }
    }

    /// send sends one datagram to the locked client endpoint.
    pub async fn send(&self, data: &[u8]) -> Result<usize> {
        let peer = self.peer().ok_or_else(|| {
            SocksError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no client endpoint locked yet",
            ))
        })?;
        Ok(self.socket.send_to(data, peer).await?)
    }

    fn allow(&self, src: SocketAddr) -> bool {
        if src.ip() != self.expected.ip() {
            return false;
        }
        let mut peer = self.peer.lock().unwrap_or_else(|e| e.into_inner());
        match *peer {
            Some(locked) => locked == src,
            None => {
                debug!("locking client endpoint {src}");
                *peer = Some(src);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Mock proxy granting one UDP ASSOCIATE with the given relay port,
    /// then holding the control connection open.
    async fn mock_associate_proxy(relay_port: u16) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _): (TcpStream, _) = listener.accept().await.unwrap();
            let mut hello = [0u8; 3];
            s.read_exact(&mut hello).await.unwrap();
            s.write_all(&[0x05, 0x00]).await.unwrap();

            let mut req = [0u8; 10];
            s.read_exact(&mut req).await.unwrap();
            assert_eq!(req[1], 0x03);

            let port = relay_port.to_be_bytes();
            s.write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, port[0], port[1]])
                .await
                .unwrap();

            // Keep the association's control connection alive
            let mut hold = [0u8; 1];
            let _ = s.read(&mut hold).await;
        });
        addr
    }

    #[tokio::test]
    async fn proxied_datagrams_carry_the_relay_header() {
        let fake_relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = fake_relay.local_addr().unwrap();
        let proxy_addr = mock_associate_proxy(relay_addr.port()).await;

        let proxy = SocksProxy::socks5("127.0.0.1", proxy_addr.port());
        let socket = SocksUdpSocket::associate(&proxy).await.unwrap();
        assert_eq!(socket.relay_addr(), relay_addr);

        socket.send_to(b"payload", "10.1.2.3", 9999).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, client_seen) = fake_relay.recv_from(&mut buf).await.unwrap();
        let mut expected = vec![0x00, 0x00, 0x00, 0x01, 10, 1, 2, 3, 0x27, 0x0F];
        expected.extend_from_slice(b"payload");
        assert_eq!(&buf[..n], &expected[..]);

        // Reply comes back headered from the relay and is stripped
        let reply = [
            0x00, 0x00, 0x00, 0x01, 10, 1, 2, 3, 0x27, 0x0F, b'o', b'k',
        ];
        fake_relay.send_to(&reply, client_seen).await.unwrap();

        let mut rbuf = [0u8; 64];
        let (n, from, port) = socket.recv_from(&mut rbuf).await.unwrap();
        assert_eq!(&rbuf[..n], b"ok");
        assert_eq!(from, Address::Ip("10.1.2.3".parse().unwrap()));
        assert_eq!(port, 9999);
    }

    #[tokio::test]
    async fn local_resolution_headers_datagrams_with_ip() {
        let fake_relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let relay_port = fake_relay.local_addr().unwrap().port();

        // Resolving side: the header names the resolved address
        let proxy_addr = mock_associate_proxy(relay_port).await;
        let proxy =
            SocksProxy::socks5("127.0.0.1", proxy_addr.port()).with_local_resolution(true);
        let socket = SocksUdpSocket::associate(&proxy).await.unwrap();

        socket.send_to(b"dns?", "localhost", 53).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = fake_relay.recv_from(&mut buf).await.unwrap();
        let mut expected = vec![0x00, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0, 53];
        expected.extend_from_slice(b"dns?");
        assert_eq!(&buf[..n], &expected[..]);

        // Default side: the name rides in the header, resolution is the
        // relay's job
        let proxy_addr = mock_associate_proxy(relay_port).await;
        let proxy = SocksProxy::socks5("127.0.0.1", proxy_addr.port());
        let socket = SocksUdpSocket::associate(&proxy).await.unwrap();

        socket.send_to(b"dns?", "localhost", 53).await.unwrap();

        let (n, _) = fake_relay.recv_from(&mut buf).await.unwrap();
        let mut expected = vec![0x00, 0x00, 0x00, 0x03, 9];
        expected.extend_from_slice(b"localhost");
        expected.extend_from_slice(&[0, 53]);
        expected.extend_from_slice(b"dns?");
        assert_eq!(&buf[..n], &expected[..]);
    }

    #[tokio::test]
    async fn direct_destinations_bypass_the_relay() {
        let fake_relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = mock_associate_proxy(fake_relay.local_addr().unwrap().port()).await;

        let directs = AddressRange::new();
        directs.add("127.0.0.1");
        let proxy = SocksProxy::socks5("127.0.0.1", proxy_addr.port()).with_direct(directs);
        let socket = SocksUdpSocket::associate(&proxy).await.unwrap();

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        // Outbound: raw payload, no header
        socket
            .send_to(b"plain", "127.0.0.1", peer_addr.port())
            .await
            .unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"plain");
        assert_eq!(from.port(), socket.local_addr().unwrap().port());

        // Inbound: raw datagram from an address that is not the relay
        peer.send_to(b"back", from).await.unwrap();
        let mut rbuf = [0u8; 16];
        let (n, src, src_port) = socket.recv_from(&mut rbuf).await.unwrap();
        assert_eq!(&rbuf[..n], b"back");
        assert_eq!(src, Address::Ip(Ipv4Addr::LOCALHOST));
        assert_eq!(src_port, peer_addr.port());
    }

    #[tokio::test]
    async fn whitelist_drops_foreign_sources() {
        let good = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bad = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let socket = WhitelistedUdpSocket::bind(good.local_addr().unwrap())
            .await
            .unwrap();
        // The socket binds 0.0.0.0; reach it over loopback
        let target = SocketAddr::from(([127, 0, 0, 1], socket.local_addr().unwrap().port()));

        bad.send_to(b"bad", target).await.unwrap();
        good.send_to(b"good", target).await.unwrap();

        let mut buf = [0u8; 16];
        let (n, src) = socket
            .recv_from(&mut buf, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(&buf[..n], b"good");
        assert_eq!(src, good.local_addr().unwrap());

        // Only the foreign sender this time: the budget runs out
        bad.send_to(b"bad again", target).await.unwrap();
        match socket.recv_from(&mut buf, Duration::from_millis(300)).await {
            Err(SocksError::Timeout(_)) => {}
            other => panic!("unexpected result: {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn port_zero_locks_on_first_matching_packet() {
        let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let socket =
            WhitelistedUdpSocket::bind("127.0.0.1:0".parse().unwrap())
                .await
                .unwrap();
        assert!(socket.peer().is_none());
        let target = SocketAddr::from(([127, 0, 0, 1], socket.local_addr().unwrap().port()));

        first.send_to(b"claim", target).await.unwrap();
        let mut buf = [0u8; 16];
        socket
            .recv_from(&mut buf, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(socket.peer(), Some(first.local_addr().unwrap()));

        // Same IP, different port: locked out now
        second.send_to(b"late", target).await.unwrap();
        match socket.recv_from(&mut buf, Duration::from_millis(300)).await {
            Err(SocksError::Timeout(_)) => {}
            other => panic!("unexpected result: {:?}", other.err()),
        }

        // send() goes to the locked endpoint
        socket.send(b"reply").await.unwrap();
        let (n, _) = first.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"reply");
    }
}

//! Socket-shaped adapters over the client engine.
//!
//! [`SocksStream`] and [`SocksListener`] look like plain TCP primitives but
//! route through a [`SocksProxy`]. Both consult the proxy's direct-host
//! classifier first: a destination it covers is dialed (or listened for)
//! directly, before any proxy traffic happens, and the adapter behaves
//! identically either way.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::debug;

use crate::auth::IoStream;
use crate::client::{SocksProxy, SocksSession};
use crate::error::{Result, SocksError};
use crate::message::Address;

/// SocksStream is a connected byte stream, proxied or direct.
pub struct SocksStream {
    inner: StreamKind,
}

enum StreamKind {
    Direct {
        stream: TcpStream,
    },
    Proxied {
        stream: Box<dyn IoStream>,
        bound: (Address, u16),
        local: Option<SocketAddr>,
    },
}

/// SocksStream implementation block
impl SocksStream {
    /// connect opens a stream to `host:port`. Destinations covered by the
    /// proxy's direct classifier are dialed straight, without touching the
    /// proxy; everything else runs a CONNECT session.
    pub async fn connect(proxy: &SocksProxy, host: &str, port: u16) -> Result<SocksStream> {
        if proxy.is_direct(host).await {
            debug!("direct connection to {host}:{port}");
            let stream = TcpStream::connect((host, port)).await?;
            return Ok(SocksStream {
                inner: StreamKind::Direct { stream },
            });
        }

        let session = proxy.connect(host, port).await?;
        Ok(SocksStream::from_session(session))
    }

    fn from_session(session: SocksSession) -> SocksStream {
        let bound = (session.bound_addr().clone(), session.bound_port());
        let local = session.local_addr();
        SocksStream {
            inner: StreamKind::Proxied {
                stream: session.into_stream(),
                bound,
                local,
            },
        }
    }

    /// is_direct reports whether this stream bypassed the proxy.
    pub fn is_direct(&self) -> bool {
        matches!(self.inner, StreamKind::Direct { .. })
    }

    /// local_addr returns the local endpoint of the underlying TCP
    /// connection, when known.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.inner {
            StreamKind::Direct { stream } => stream.local_addr().ok(),
            StreamKind::Proxied { local, .. } => *local,
        }
    }

    /// local_port returns the port of [`SocksStream::local_addr`].
    pub fn local_port(&self) -> Option<u16> {
        self.local_addr().map(|a| a.port())
    }

    /// proxy_bound returns the binding the proxy reported for this stream
    /// (its outbound address for CONNECT, the connected peer after a bind
    /// accept). Direct streams have none.
    pub fn proxy_bound(&self) -> Option<(&Address, u16)> {
        match &self.inner {
            StreamKind::Direct { .. } => None,
            StreamKind::Proxied { bound, .. } => Some((&bound.0, bound.1)),
        }
    }
}

impl AsyncRead for SocksStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.inner {
            StreamKind::Direct { stream } => Pin::new(stream).poll_read(cx, buf),
            StreamKind::Proxied { stream, .. } => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SocksStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.inner {
            StreamKind::Direct { stream } => Pin::new(stream).poll_write(cx, buf),
            StreamKind::Proxied { stream, .. } => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.inner {
            StreamKind::Direct { stream } => Pin::new(stream).poll_flush(cx),
            StreamKind::Proxied { stream, .. } => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.inner {
            StreamKind::Direct { stream } => Pin::new(stream).poll_shutdown(cx),
            StreamKind::Proxied { stream, .. } => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// SocksListener waits for one inbound connection, the way FTP active mode
/// needs it: `host` names the remote peer expected to dial in.
///
/// In proxied mode this is a BIND session, which carries exactly one
/// connection; a second [`SocksListener::accept`] fails. In direct mode a
/// real listener filters incoming connections down to the expected peer IP
/// and can accept repeatedly.
pub struct SocksListener {
    inner: ListenerKind,
    accept_timeout: Duration,
}

enum ListenerKind {
    Direct {
        listener: TcpListener,
        expected: IpAddr,
    },
    Proxied {
        session: Option<SocksSession>,
        bound: (Address, u16),
    },
}

/// SocksListener implementation block
impl SocksListener {
    /// bind prepares to receive a connection from `host:port`. For
    /// proxy-covered peers this runs a BIND handshake; direct peers get a
    /// local ephemeral listener instead.
    pub async fn bind(proxy: &SocksProxy, host: &str, port: u16) -> Result<SocksListener> {
        let accept_timeout = proxy.config().accept_timeout;

        if proxy.is_direct(host).await {
            // The filter needs a concrete address up front
            let expected = Address::from(host).resolve().await?;
            let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
            debug!(
                "direct bind listening on port {} for {expected}",
                listener.local_addr()?.port()
            );
            return Ok(SocksListener {
                inner: ListenerKind::Direct {
                    listener,
                    expected: IpAddr::V4(expected),
                },
                accept_timeout,
            });
        }

        let session = proxy.bind(host, port).await?;
        let bound = (session.bound_addr().clone(), session.bound_port());
        Ok(SocksListener {
            inner: ListenerKind::Proxied {
                session: Some(session),
                bound,
            },
            accept_timeout,
        })
    }

    /// bound_addr returns the address to advertise to the remote peer: the
    /// proxy's listener for a BIND session, the local listener otherwise.
    pub fn bound_addr(&self) -> Result<(Address, u16)> {
        match &self.inner {
            ListenerKind::Direct { listener, .. } => {
                let local = listener.local_addr()?;
                let ip = match local {
                    SocketAddr::V4(sa) => *sa.ip(),
                    SocketAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
                };
                Ok((Address::Ip(ip), local.port()))
            }
            ListenerKind::Proxied { bound, .. } => Ok((bound.0.clone(), bound.1)),
        }
    }

    /// accept waits for the inbound connection, bounded by the accept
    /// timeout.
    pub async fn accept(&mut self) -> Result<SocksStream> {
        let accept_timeout = self.accept_timeout;
        match &mut self.inner {
            ListenerKind::Direct { listener, expected } => {
                let expected = *expected;
                let wait = async {
                    loop {
                        let (stream, peer) = listener.accept().await?;
                        if peer.ip() == expected {
                            return Ok::<_, io::Error>((stream, peer));
                        }
                        debug!("refused bind connection from {peer}, expecting {expected}");
                    }
                };
                let (stream, peer) = timeout(accept_timeout, wait)
                    .await
                    .map_err(|_| SocksError::Timeout(accept_timeout))??;
                debug!("bind accepted {peer}");
                Ok(SocksStream {
                    inner: StreamKind::Direct { stream },
                })
            }
            ListenerKind::Proxied { session, .. } => {
                let mut session = session.take().ok_or(SocksError::AlreadyAccepted)?;
                session.accept().await?;
                Ok(SocksStream::from_session(session))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::AddressRange;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    fn dead_proxy_with_direct(entry: &str) -> SocksProxy {
        // TEST-NET address; any attempt to actually dial it would stall,
        // so passing tests prove the bypass happened first
        let directs = AddressRange::new();
        directs.add(entry);
        SocksProxy::socks5("203.0.113.1", 1).with_direct(directs)
    }

    #[tokio::test]
    async fn direct_destination_bypasses_proxy() {
        let echo = echo_server().await;
        let proxy = dead_proxy_with_direct("127.0.0.1");

        let mut stream = timeout(
            Duration::from_secs(2),
            SocksStream::connect(&proxy, "127.0.0.1", echo.port()),
        )
        .await
        .expect("direct bypass must not touch the proxy")
        .unwrap();

        assert!(stream.is_direct());
        assert!(stream.proxy_bound().is_none());

        stream.write_all(b"direct").await.unwrap();
        let mut got = [0u8; 6];
        stream.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"direct");
    }

    #[tokio::test]
    async fn proxied_stream_carries_data() {
        // Mock proxy: grant the request, then echo the data phase
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let mut hello = [0u8; 3];
            s.read_exact(&mut hello).await.unwrap();
            s.write_all(&[0x05, 0x00]).await.unwrap();
            let mut req = [0u8; 10];
            s.read_exact(&mut req).await.unwrap();
            s.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
            let mut buf = [0u8; 64];
            loop {
                let n = s.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                s.write_all(&buf[..n]).await.unwrap();
            }
        });

        let proxy = SocksProxy::socks5("127.0.0.1", addr.port());
        let mut stream = SocksStream::connect(&proxy, "10.1.2.3", 80).await.unwrap();
        assert!(!stream.is_direct());

        stream.write_all(b"tunneled").await.unwrap();
        let mut got = [0u8; 8];
        stream.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"tunneled");
    }

    #[tokio::test]
    async fn direct_listener_accepts_expected_peer() {
        let proxy = dead_proxy_with_direct("127.0.0.1");
        let mut listener = SocksListener::bind(&proxy, "127.0.0.1", 0).await.unwrap();
        let (_, port) = listener.bound_addr().unwrap();

        tokio::spawn(async move {
            let mut peer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            peer.write_all(b"hi").await.unwrap();
        });

        let mut stream = listener.accept().await.unwrap();
        let mut got = [0u8; 2];
        stream.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hi");
    }

    #[tokio::test]
    async fn proxied_listener_allows_exactly_one_accept() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let mut hello = [0u8; 3];
            s.read_exact(&mut hello).await.unwrap();
            s.write_all(&[0x05, 0x00]).await.unwrap();
            let mut req = [0u8; 10];
            s.read_exact(&mut req).await.unwrap();
            // Listener reply, then the peer-connected reply
            s.write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x15, 0xB3])
                .await
                .unwrap();
            s.write_all(&[0x05, 0x00, 0x00, 0x01, 10, 1, 2, 3, 0, 77])
                .await
                .unwrap();
            // Hold the socket open while the client tries again
            let mut buf = [0u8; 1];
            let _ = s.read(&mut buf).await;
        });

        let proxy = SocksProxy::socks5("127.0.0.1", addr.port());
        let mut listener = SocksListener::bind(&proxy, "10.1.2.3", 21).await.unwrap();

        let stream = listener.accept().await.unwrap();
        assert_eq!(
            stream.proxy_bound().map(|(a, p)| (a.clone(), p)),
            Some((Address::Ip("10.1.2.3".parse().unwrap()), 77))
        );

        match listener.accept().await {
            Err(SocksError::AlreadyAccepted) => {}
            other => panic!("unexpected result: {:?}", other.err().map(|e| e.to_string())),
        }
    }
}

//! Client-side authentication for SOCKS5 sessions.
//!
//! A proxy configuration carries a table of [`ClientAuth`] capabilities keyed
//! by SOCKS5 method id. Once the server picks a method, the matching
//! capability runs its credential exchange and hands back the stream the rest
//! of the session uses, which lets a scheme substitute the raw socket with a
//! wrapped one. Two schemes ship with the crate: "no authentication" and
//! RFC 1929 username/password. GSSAPI (method 0x01) is a recognized id with
//! no implementation; plugging one in means implementing this trait.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{Result, SocksError};
use crate::protocol::{AuthMethod, USERPASS_SUCCESS, USERPASS_VERSION};

/// IoStream is the byte stream a SOCKS session runs over. Plain TCP sockets
/// qualify, as does any wrapper an authentication scheme layers on top.
pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T> IoStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// UdpEncapsulation wraps and unwraps whole datagrams with
/// authentication-scheme-specific framing. The relay applies it outside the
/// SOCKS5 UDP header.
pub trait UdpEncapsulation: Send + Sync {
    /// wrap frames an outgoing datagram.
    fn wrap(&self, datagram: &[u8]) -> Result<Vec<u8>>;

    /// unwrap strips the framing from an incoming datagram.
    fn unwrap(&self, datagram: &[u8]) -> Result<Vec<u8>>;
}

/// IdentityEncapsulation passes datagrams through untouched. Every stock
/// scheme uses it.
pub struct IdentityEncapsulation;

impl UdpEncapsulation for IdentityEncapsulation {
    fn wrap(&self, datagram: &[u8]) -> Result<Vec<u8>> {
        Ok(datagram.to_vec())
    }

    fn unwrap(&self, datagram: &[u8]) -> Result<Vec<u8>> {
        Ok(datagram.to_vec())
    }
}

/// Negotiated is the product of a successful credential exchange: the stream
/// the session continues on, plus the datagram framing UDP associations must
/// apply under this scheme (`None` means identity).
pub struct Negotiated {
    pub stream: Box<dyn IoStream>,
    pub encapsulation: Option<Arc<dyn UdpEncapsulation>>,
}

/// ClientAuth is one entry of the SOCKS5 method table.
#[async_trait]
pub trait ClientAuth: Send + Sync {
    /// method returns the SOCKS5 method id this capability negotiates.
    fn method(&self) -> u8;

    /// authenticate runs the credential exchange for `method` on the session
    /// stream. Implementations own the stream and must close it before
    /// returning an error.
    async fn authenticate(&self, method: u8, stream: Box<dyn IoStream>) -> Result<Negotiated>;
}

/// AuthNone is method 0x00: no credential exchange, the raw stream passes
/// straight through.
pub struct AuthNone;

#[async_trait]
impl ClientAuth for AuthNone {
    fn method(&self) -> u8 {
        AuthMethod::NoAuth as u8
    }

    async fn authenticate(&self, _method: u8, stream: Box<dyn IoStream>) -> Result<Negotiated> {
        Ok(Negotiated {
            stream,
            encapsulation: None,
        })
    }
}

/// UserPass holds one username/password pair and implements the RFC 1929
/// client exchange (method 0x02).
#[derive(Clone)]
pub struct UserPass {
    pub username: String,
    pub password: String,
}

/// UserPass implementation block
impl UserPass {
    /// new is a constructor for the UserPass type
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    async fn exchange(&self, stream: &mut Box<dyn IoStream>) -> Result<()> {
        // Client Username/Password Request
        // +----+------+----------+------+----------+
        // |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
        // +----+------+----------+------+----------+
        // | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
        // +----+------+----------+------+----------+
        let user = self.username.as_bytes();
        let pass = self.password.as_bytes();
        if user.is_empty() || user.len() > 255 {
            return Err(SocksError::Malformed("username must be 1-255 bytes"));
        }
        if pass.is_empty() || pass.len() > 255 {
            return Err(SocksError::Malformed("password must be 1-255 bytes"));
        }

        // Build the request in one buffer and send it
        let mut req = Vec::with_capacity(3 + user.len() + pass.len());
        req.push(USERPASS_VERSION);
        req.push(user.len() as u8);
        req.extend_from_slice(user);
        req.push(pass.len() as u8);
        req.extend_from_slice(pass);
        stream.write_all(&req).await?;

        // Username/Password Server response
        // +----+--------+
        // |VER | STATUS |
        // +----+--------+
        // | 1  |   1    |
        // +----+--------+
        let mut resp = [0u8; 2];
        stream.read_exact(&mut resp).await?;

        // Check subnegotiation version number
        if resp[0] != USERPASS_VERSION {
            return Err(SocksError::Malformed(
                "bad username/password subnegotiation version",
            ));
        }

        // Any nonzero status is a rejection
        if resp[1] != USERPASS_SUCCESS {
            debug!(
                "username/password authentication rejected with status {:#04x}",
                resp[1]
            );
            return Err(SocksError::AuthFailed);
        }

        Ok(())
    }
}

#[async_trait]
impl ClientAuth for UserPass {
    fn method(&self) -> u8 {
        AuthMethod::UserPass as u8
    }

    async fn authenticate(&self, _method: u8, mut stream: Box<dyn IoStream>) -> Result<Negotiated> {
        match self.exchange(&mut stream).await {
            Ok(()) => Ok(Negotiated {
                stream,
                encapsulation: None,
            }),
            Err(e) => {
                let _ = stream.shutdown().await;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn userpass_exchange_succeeds() {
        let (client, mut server) = duplex(256);

        let peer = tokio::spawn(async move {
            // ULEN=5 UNAME="frodo" PLEN=3 PASSWD="bag" -> 11 bytes on the wire
            let mut req = [0u8; 11];
            server.read_exact(&mut req).await.unwrap();
            assert_eq!(
                req,
                [0x01, 5, b'f', b'r', b'o', b'd', b'o', 3, b'b', b'a', b'g']
            );
            server.write_all(&[0x01, 0x00]).await.unwrap();
        });

        let auth = UserPass::new("frodo", "bag");
        let negotiated = auth
            .authenticate(auth.method(), Box::new(client))
            .await
            .unwrap();
        assert!(negotiated.encapsulation.is_none());
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn userpass_rejection_is_auth_failed() {
        let (client, mut server) = duplex(256);

        tokio::spawn(async move {
            let mut req = [0u8; 11];
            server.read_exact(&mut req).await.unwrap();
            server.write_all(&[0x01, 0x01]).await.unwrap();
        });

        let auth = UserPass::new("frodo", "bag");
        match auth.authenticate(auth.method(), Box::new(client)).await {
            Err(SocksError::AuthFailed) => {}
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn oversized_credentials_never_touch_the_wire() {
        let (client, mut server) = duplex(1024);

        let auth = UserPass::new("x".repeat(256), "pw");
        match auth.authenticate(auth.method(), Box::new(client)).await {
            Err(SocksError::Malformed(_)) => {}
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }

        // The peer saw nothing before the stream closed
        let mut buf = [0u8; 1];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn auth_none_is_passthrough() {
        let (client, mut server) = duplex(64);

        let negotiated = AuthNone
            .authenticate(AuthNone.method(), Box::new(client))
            .await
            .unwrap();

        let mut stream = negotiated.stream;
        stream.write_all(b"raw").await.unwrap();
        let mut got = [0u8; 3];
        server.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"raw");
    }

    #[test]
    fn identity_encapsulation_round_trips() {
        let wrapped = IdentityEncapsulation.wrap(b"datagram").unwrap();
        assert_eq!(wrapped, b"datagram");
        assert_eq!(IdentityEncapsulation.unwrap(&wrapped).unwrap(), b"datagram");
    }
}

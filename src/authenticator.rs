//! Server-side authentication capability.
//!
//! The server engine hands every accepted connection to a
//! [`ServerAuthenticator`], which sniffs the protocol version from the first
//! byte, runs whatever credential exchange the deployment wants, and returns
//! the stream the rest of the connection uses together with a
//! [`SessionGuard`] consulted for each decoded request and each relayed
//! datagram. Deployments plug in their own policy by implementing the trait;
//! [`OpenAuthenticator`] and [`UserPassAuthenticator`] cover the stock cases.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::auth::{IdentityEncapsulation, IoStream, UdpEncapsulation};
use crate::error::{Result, SocksError};
use crate::message::ProxyMessage;
use crate::protocol::{AuthMethod, USERPASS_FAILURE, USERPASS_SUCCESS, USERPASS_VERSION, Version};

/// Direction tags a relayed datagram for authorization checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// From the SOCKS client toward the remote destination.
    ClientToRemote,
    /// From the remote destination back to the SOCKS client.
    RemoteToClient,
}

/// SessionGuard carries the per-session authorization hooks an authenticator
/// attaches to a connection it admitted.
pub trait SessionGuard: Send + Sync {
    /// check_request authorizes one decoded request. A refusal turns into an
    /// explicit failure reply to the client.
    fn check_request(&self, request: &ProxyMessage) -> bool;

    /// check_datagram authorizes one relayed datagram. Refused datagrams are
    /// dropped silently.
    fn check_datagram(&self, datagram: &[u8], direction: Direction) -> bool;

    /// encapsulation returns the datagram framing this session's scheme
    /// applies outside the SOCKS5 UDP header.
    fn encapsulation(&self) -> Arc<dyn UdpEncapsulation>;

    /// end_session runs once when the connection is torn down.
    fn end_session(&self);
}

/// AuthedSession is an admitted connection: the negotiated protocol version,
/// the stream the request phase continues on, and the session's guard.
pub struct AuthedSession {
    pub version: Version,
    pub stream: Box<dyn IoStream>,
    pub guard: Arc<dyn SessionGuard>,
}

/// ServerAuthenticator admits or refuses fresh connections.
#[async_trait]
pub trait ServerAuthenticator: Send + Sync {
    /// start_session consumes a just-accepted connection, identifies the
    /// protocol version, and runs the credential exchange. A refused client
    /// gets its socket closed before the error propagates.
    async fn start_session(&self, stream: Box<dyn IoStream>) -> Result<AuthedSession>;
}

/// PermissiveGuard authorizes everything and uses identity datagram framing.
pub struct PermissiveGuard;

impl SessionGuard for PermissiveGuard {
    fn check_request(&self, _request: &ProxyMessage) -> bool {
        true
    }

    fn check_datagram(&self, _datagram: &[u8], _direction: Direction) -> bool {
        true
    }

    fn encapsulation(&self) -> Arc<dyn UdpEncapsulation> {
        Arc::new(IdentityEncapsulation)
    }

    fn end_session(&self) {}
}

/// read_version sniffs the protocol generation from the first byte of a
/// fresh connection.
async fn read_version(stream: &mut Box<dyn IoStream>) -> Result<Version> {
    let mut ver = [0u8; 1];
    stream.read_exact(&mut ver).await?;
    Version::from_byte(ver[0]).ok_or(SocksError::Malformed("not a SOCKS request"))
}

/// negotiate_method reads the client's SOCKS5 method offer and answers with
/// the server's pick, scanning `preferred` in order. When nothing overlaps
/// the client is told 0xFF and the exchange fails.
async fn negotiate_method(stream: &mut Box<dyn IoStream>, preferred: &[AuthMethod]) -> Result<u8> {
    // ClientHello format (version byte already consumed)
    // +----+----------+----------+
    // |VER | NMETHODS | METHODS  |
    // +----+----------+----------+
    // | 1  |    1     | 1 to 255 |
    // +----+----------+----------+
    let mut n_methods = [0u8; 1];
    stream.read_exact(&mut n_methods).await?;

    let mut methods = vec![0u8; n_methods[0] as usize];
    stream.read_exact(&mut methods).await?;

    // Iterate through preferences in order. If there's a match, answer
    // with it
    for &preferred in preferred {
        if methods.contains(&(preferred as u8)) {
            stream
                .write_all(&[Version::Socks5 as u8, preferred as u8])
                .await?;
            return Ok(preferred as u8);
        }
    }

    stream
        .write_all(&[Version::Socks5 as u8, AuthMethod::NoAcceptable as u8])
        .await?;
    Err(SocksError::NoAcceptableMethods)
}

/// OpenAuthenticator admits every client: no SOCKS5 credential exchange,
/// any SOCKS4 user id.
pub struct OpenAuthenticator;

#[async_trait]
impl ServerAuthenticator for OpenAuthenticator {
    async fn start_session(&self, mut stream: Box<dyn IoStream>) -> Result<AuthedSession> {
        let version = read_version(&mut stream).await?;

        if version == Version::Socks5 {
            if let Err(e) = negotiate_method(&mut stream, &[AuthMethod::NoAuth]).await {
                let _ = stream.shutdown().await;
                return Err(e);
            }
        }

        Ok(AuthedSession {
            version,
            stream,
            guard: Arc::new(PermissiveGuard),
        })
    }
}

/// UserPassAuthenticator enforces one RFC 1929 credential pair. SOCKS4 has
/// no password exchange, so v4 clients are refused outright.
pub struct UserPassAuthenticator {
    username: String,
    password: String,
}

/// UserPassAuthenticator implementation block
impl UserPassAuthenticator {
    /// new is a constructor for the UserPassAuthenticator type
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// verify runs the server half of the RFC 1929 subnegotiation
    async fn verify(&self, stream: &mut Box<dyn IoStream>) -> Result<()> {
        // Client Username/Password Request
        // +----+------+----------+------+----------+
        // |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
        // +----+------+----------+------+----------+
        // | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
        // +----+------+----------+------+----------+
        let mut ver = [0u8; 1];
        stream.read_exact(&mut ver).await?;
        if ver[0] != USERPASS_VERSION {
            return Err(SocksError::Malformed(
                "bad username/password subnegotiation version",
            ));
        }

        let username = read_credential(stream).await?;
        let password = read_credential(stream).await?;

        // Validate credentials and answer with the status
        if username == self.username && password == self.password {
            stream
                .write_all(&[USERPASS_VERSION, USERPASS_SUCCESS])
                .await?;
            Ok(())
        } else {
            stream
                .write_all(&[USERPASS_VERSION, USERPASS_FAILURE])
                .await?;
            debug!("rejected credentials for user {username:?}");
            Err(SocksError::AuthFailed)
        }
    }
}

/// read_credential reads one length-prefixed field of the RFC 1929 request.
async fn read_credential(stream: &mut Box<dyn IoStream>) -> Result<String> {
    let mut len = [0u8; 1];
    stream.read_exact(&mut len).await?;

    let mut value = vec![0u8; len[0] as usize];
    stream.read_exact(&mut value).await?;

    String::from_utf8(value).map_err(|_| SocksError::Malformed("credential is not valid UTF-8"))
}

#[async_trait]
impl ServerAuthenticator for UserPassAuthenticator {
    async fn start_session(&self, mut stream: Box<dyn IoStream>) -> Result<AuthedSession> {
        let version = read_version(&mut stream).await?;

        match version {
            Version::Socks4 => {
                // v4 cannot carry a password; refuse rather than downgrade
                debug!("refusing SOCKS4 client, credentials required");
                let _ = stream.shutdown().await;
                Err(SocksError::AuthFailed)
            }
            Version::Socks5 => {
                let result = async {
                    negotiate_method(&mut stream, &[AuthMethod::UserPass]).await?;
                    self.verify(&mut stream).await
                }
                .await;

                match result {
                    Ok(()) => Ok(AuthedSession {
                        version,
                        stream,
                        guard: Arc::new(PermissiveGuard),
                    }),
                    Err(e) => {
                        let _ = stream.shutdown().await;
                        Err(e)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn open_authenticator_negotiates_no_auth() {
        let (server_side, mut client) = duplex(256);

        let task = tokio::spawn(async move {
            OpenAuthenticator
                .start_session(Box::new(server_side))
                .await
        });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [0x05, 0x00]);

        let session = task.await.unwrap().unwrap();
        assert_eq!(session.version, Version::Socks5);
    }

    #[tokio::test]
    async fn open_authenticator_passes_socks4_through() {
        let (server_side, mut client) = duplex(256);

        let task = tokio::spawn(async move {
            OpenAuthenticator
                .start_session(Box::new(server_side))
                .await
        });

        // Version byte plus the start of a v4 request; the sniff must leave
        // everything after the version untouched
        client.write_all(&[0x04, 0x01]).await.unwrap();

        let mut session = task.await.unwrap().unwrap();
        assert_eq!(session.version, Version::Socks4);

        let mut next = [0u8; 1];
        session.stream.read_exact(&mut next).await.unwrap();
        assert_eq!(next[0], 0x01);
    }

    #[tokio::test]
    async fn unknown_method_offer_is_refused_with_ff() {
        let (server_side, mut client) = duplex(256);

        let task = tokio::spawn(async move {
            OpenAuthenticator
                .start_session(Box::new(server_side))
                .await
        });

        // Client only offers username/password, which the open server
        // does not speak
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [0x05, 0xFF]);

        match task.await.unwrap() {
            Err(SocksError::NoAcceptableMethods) => {}
            other => panic!("unexpected result: {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn userpass_authenticator_accepts_good_credentials() {
        let (server_side, mut client) = duplex(256);
        let authenticator = UserPassAuthenticator::new("frodo", "bag");

        let task =
            tokio::spawn(async move { authenticator.start_session(Box::new(server_side)).await });

        client.write_all(&[0x05, 0x02, 0x00, 0x02]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [0x05, 0x02]);

        client
            .write_all(&[0x01, 5, b'f', b'r', b'o', b'd', b'o', 3, b'b', b'a', b'g'])
            .await
            .unwrap();
        let mut status = [0u8; 2];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status, [0x01, 0x00]);

        let session = task.await.unwrap().unwrap();
        assert_eq!(session.version, Version::Socks5);
    }

    #[tokio::test]
    async fn userpass_authenticator_rejects_bad_credentials() {
        let (server_side, mut client) = duplex(256);
        let authenticator = UserPassAuthenticator::new("frodo", "bag");

        let task =
            tokio::spawn(async move { authenticator.start_session(Box::new(server_side)).await });

        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [0x05, 0x02]);

        client
            .write_all(&[0x01, 5, b'f', b'r', b'o', b'd', b'o', 3, b'b', b'a', b'd'])
            .await
            .unwrap();
        let mut status = [0u8; 2];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status, [0x01, 0x01]);

        match task.await.unwrap() {
            Err(SocksError::AuthFailed) => {}
            other => panic!("unexpected result: {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn userpass_authenticator_refuses_socks4() {
        let (server_side, mut client) = duplex(256);
        let authenticator = UserPassAuthenticator::new("frodo", "bag");

        let task =
            tokio::spawn(async move { authenticator.start_session(Box::new(server_side)).await });

        client.write_all(&[0x04]).await.unwrap();

        match task.await.unwrap() {
            Err(SocksError::AuthFailed) => {}
            other => panic!("unexpected result: {:?}", other.err()),
        }

        // The connection was closed without a reply
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }
}

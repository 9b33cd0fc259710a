//! Client-side SOCKS engine.
//!
//! [`SocksProxy`] is a reusable description of one proxy: where it listens,
//! which protocol generation it speaks, how to authenticate against it, and
//! which destinations bypass it entirely. Each operation on it runs a fresh
//! handshake on a fresh connection and returns a [`SocksSession`] already in
//! its granted state; configurations share no mutable state with the
//! sessions they spawn, so one `SocksProxy` can serve any number of
//! concurrent tasks.
//!
//! Proxies chain: a proxy configured with [`SocksProxy::with_chain`] is
//! reached by asking the chained proxy to CONNECT to it first, nesting to
//! any depth.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::auth::{AuthNone, ClientAuth, IoStream, Negotiated, UdpEncapsulation, UserPass};
use crate::config::SocksConfig;
use crate::error::{Result, SocksError};
use crate::message::{self, Address, ProxyMessage};
use crate::protocol::{AuthMethod, Command, Version};
use crate::range::AddressRange;

/// SessionState tracks how far a session's handshake has progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No connection made yet.
    Idle,
    /// TCP connection to the proxy is up.
    Started,
    /// SOCKS5 method negotiation and credential exchange are done.
    Authenticated,
    /// The request went out, the reply is pending.
    RequestSent,
    /// The request was granted; the session stream carries data now.
    Success,
    /// The handshake failed and the socket was closed.
    Failed,
}

/// SocksProxy describes one proxy server and how to talk to it.
#[derive(Clone)]
pub struct SocksProxy {
    addr: Address,
    port: u16,
    version: Version,
    auth: Vec<Arc<dyn ClientAuth>>,
    user: Option<String>,
    directs: AddressRange,
    chain: Option<Box<SocksProxy>>,
    config: SocksConfig,
    resolve_locally: bool,
}

/// SocksProxy implementation block
impl SocksProxy {
    /// socks5 describes a SOCKS5 proxy with the no-authentication method
    /// enabled. Add further methods with [`SocksProxy::with_credentials`]
    /// or [`SocksProxy::with_auth`].
    pub fn socks5(host: impl Into<Address>, port: u16) -> Self {
        Self {
            addr: host.into(),
            port,
            version: Version::Socks5,
            auth: vec![Arc::new(AuthNone)],
            user: None,
            directs: AddressRange::new(),
            chain: None,
            config: SocksConfig::default(),
            resolve_locally: false,
        }
    }

    /// socks4 describes a SOCKS4 proxy. The user id goes out with every
    /// request; empty is legal.
    pub fn socks4(host: impl Into<Address>, port: u16, user: impl Into<String>) -> Self {
        Self {
            addr: host.into(),
            port,
            version: Version::Socks4,
            auth: Vec::new(),
            user: Some(user.into()),
            directs: AddressRange::new(),
            chain: None,
            config: SocksConfig::default(),
            resolve_locally: false,
        }
    }

    /// with_credentials enables RFC 1929 username/password authentication
    /// alongside the methods already offered.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.auth.push(Arc::new(UserPass::new(username, password)));
        self
    }

    /// with_auth offers a custom authentication capability, for schemes the
    /// crate does not ship (GSSAPI, private methods).
    pub fn with_auth(mut self, capability: Arc<dyn ClientAuth>) -> Self {
        self.auth.push(capability);
        self
    }

    /// with_chain routes every session through another proxy first.
    pub fn with_chain(mut self, upstream: SocksProxy) -> Self {
        self.chain = Some(Box::new(upstream));
        self
    }

    /// with_direct installs the classifier for destinations that bypass
    /// the proxy.
    pub fn with_direct(mut self, directs: AddressRange) -> Self {
        self.directs = directs;
        self
    }

    /// with_config replaces the timeout configuration.
    pub fn with_config(mut self, config: SocksConfig) -> Self {
        self.config = config;
        self
    }

    /// with_local_resolution controls whether SOCKS5 requests resolve
    /// hostnames on this side (ATYP=IPV4 goes out) instead of passing the
    /// name to the proxy. SOCKS4 always resolves locally, the wire format
    /// has no room for a name.
    pub fn with_local_resolution(mut self, resolve_locally: bool) -> Self {
        self.resolve_locally = resolve_locally;
        self
    }

    /// version returns the protocol generation this proxy speaks.
    pub fn version(&self) -> Version {
        self.version
    }

    /// proxy_addr returns the proxy's address.
    pub fn proxy_addr(&self) -> &Address {
        &self.addr
    }

    /// proxy_port returns the proxy's port.
    pub fn proxy_port(&self) -> u16 {
        self.port
    }

    /// direct_hosts returns the bypass classifier.
    pub fn direct_hosts(&self) -> &AddressRange {
        &self.directs
    }

    /// config returns the timeout configuration sessions inherit.
    pub fn config(&self) -> &SocksConfig {
        &self.config
    }

    /// resolves_locally reports the hostname resolution policy.
    pub fn resolves_locally(&self) -> bool {
        self.resolve_locally
    }

    /// is_direct reports whether `host` should bypass this proxy,
    /// resolving it on demand when only numeric entries could match.
    pub async fn is_direct(&self, host: &str) -> bool {
        self.directs.contains_resolve(host).await
    }

    /// connect runs a CONNECT handshake. The returned session's stream is
    /// the data pipe to the destination.
    pub async fn connect(&self, addr: impl Into<Address>, port: u16) -> Result<SocksSession> {
        self.establish(Command::Connect, addr.into(), port).await
    }

    /// bind runs a BIND handshake. The reply names the address the proxy
    /// listens on; [`SocksSession::accept`] waits for the incoming
    /// connection.
    pub async fn bind(&self, addr: impl Into<Address>, port: u16) -> Result<SocksSession> {
        self.establish(Command::Bind, addr.into(), port).await
    }

    /// udp_associate runs a UDP ASSOCIATE handshake. The reply names the
    /// relay endpoint datagrams go to; the session's control connection
    /// keeps the association alive. SOCKS4 refuses this before any network
    /// traffic happens.
    pub async fn udp_associate(&self, addr: impl Into<Address>, port: u16) -> Result<SocksSession> {
        self.establish(Command::UdpAssociate, addr.into(), port)
            .await
    }

    /// dial opens the transport to the proxy itself: a plain TCP connection,
    /// or a CONNECT session through the chained proxy. Boxed so the chain
    /// can recurse.
    fn dial(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<(Box<dyn IoStream>, Option<SocketAddr>)>> + Send + '_>>
    {
        Box::pin(async move {
            match &self.chain {
                Some(upstream) => {
                    let session = upstream.connect(self.addr.clone(), self.port).await?;
                    let local = session.local_addr();
                    Ok((session.into_stream(), local))
                }
                None => {
                    let stream = match &self.addr {
                        Address::Ip(ip) => TcpStream::connect((*ip, self.port)).await?,
                        Address::Domain(name) => {
                            TcpStream::connect((name.as_str(), self.port)).await?
                        }
                    };
                    let local = stream.local_addr().ok();
                    Ok((Box::new(stream) as Box<dyn IoStream>, local))
                }
            }
        })
    }

    /// establish drives the handshake state machine for one operation.
    async fn establish(&self, command: Command, addr: Address, port: u16) -> Result<SocksSession> {
        // SOCKS4 has no UDP mode; refuse before any network I/O happens
        if self.version == Version::Socks4 && command == Command::UdpAssociate {
            return Err(SocksError::UdpNotSupported);
        }

        let mut state = SessionState::Idle;
        let (stream, local_addr) = match self.dial().await {
            Ok(dialed) => dialed,
            Err(e) => {
                debug!("session failed in state {state:?}: {e}");
                return Err(e);
            }
        };
        debug!(
            "{} session started: {:?} {}:{} via {}:{}",
            self.version, command, addr, port, self.addr, self.port
        );

        state = SessionState::Started;

        // SOCKS5 negotiates a method and runs its exchange, which may hand
        // back a wrapped stream; SOCKS4 goes straight to the request
        let (mut stream, encapsulation) = if self.version == Version::Socks5 {
            let negotiated = self.negotiate_auth(stream).await?;
            state = SessionState::Authenticated;
            (negotiated.stream, negotiated.encapsulation)
        } else {
            (stream, None)
        };

        match self.request(&mut stream, command, addr, port, &mut state).await {
            Ok(reply) => {
                debug!("request granted, proxy bound {}:{}", reply.addr, reply.port);
                Ok(SocksSession {
                    version: self.version,
                    stream,
                    encapsulation,
                    reply,
                    state: SessionState::Success,
                    local_addr,
                    accept_timeout: self.config.accept_timeout,
                })
            }
            Err(e) => {
                // A failed handshake never leaves its socket open
                debug!("session failed in state {state:?}: {e}");
                let _ = stream.shutdown().await;
                Err(e)
            }
        }
    }

    /// negotiate_auth offers the method table and runs the capability the
    /// server picked. Errors close the stream before propagating.
    async fn negotiate_auth(&self, mut stream: Box<dyn IoStream>) -> Result<Negotiated> {
        let chosen = match self.exchange_methods(&mut stream).await {
            Ok(id) => id,
            Err(e) => {
                let _ = stream.shutdown().await;
                return Err(e);
            }
        };

        match self.auth.iter().find(|a| a.method() == chosen) {
            Some(capability) => capability.authenticate(chosen, stream).await,
            None => {
                let _ = stream.shutdown().await;
                Err(SocksError::MethodNotSupported(chosen))
            }
        }
    }

    async fn exchange_methods(&self, stream: &mut Box<dyn IoStream>) -> Result<u8> {
        // ClientHello format
        // +----+----------+----------+
        // |VER | NMETHODS | METHODS  |
        // +----+----------+----------+
        // | 1  |    1     | 1 to 255 |
        // +----+----------+----------+
        let methods: Vec<u8> = self.auth.iter().map(|a| a.method()).collect();
        let mut hello = Vec::with_capacity(2 + methods.len());
        hello.push(Version::Socks5 as u8);
        hello.push(methods.len() as u8);
        hello.extend_from_slice(&methods);
        stream.write_all(&hello).await?;

        // Server choice: VER METHOD
        let mut choice = [0u8; 2];
        stream.read_exact(&mut choice).await?;

        if choice[0] != Version::Socks5 as u8 {
            return Err(SocksError::VersionMismatch {
                expected: Version::Socks5,
                got: choice[0],
            });
        }

        // 0xFF means the server takes none of our methods; the session dies
        // here, before any request goes out
        if choice[1] == AuthMethod::NoAcceptable as u8 {
            return Err(SocksError::NoAcceptableMethods);
        }

        Ok(choice[1])
    }

    /// request sends the operation and validates the first reply.
    async fn request(
        &self,
        stream: &mut Box<dyn IoStream>,
        command: Command,
        addr: Address,
        port: u16,
        state: &mut SessionState,
    ) -> Result<ProxyMessage> {
        // The v4 codec resolves at write time; v5 resolves here only under
        // the local-resolution policy
        let addr = match &addr {
            Address::Domain(_) if self.version == Version::Socks5 && self.resolve_locally => {
                Address::Ip(addr.resolve().await?)
            }
            _ => addr,
        };

        let mut msg = ProxyMessage::request(self.version, command, addr, port);
        if let Some(user) = &self.user {
            msg = msg.with_user(user.clone());
        }

        message::write_request(stream, &msg).await?;
        *state = SessionState::RequestSent;

        let reply = message::read_reply(stream, self.version).await?;
        reply.check_granted()?;
        Ok(reply)
    }
}

impl fmt::Debug for SocksProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocksProxy")
            .field("addr", &self.addr)
            .field("port", &self.port)
            .field("version", &self.version)
            .field(
                "methods",
                &self.auth.iter().map(|a| a.method()).collect::<Vec<_>>(),
            )
            .field("chain", &self.chain)
            .finish_non_exhaustive()
    }
}

/// SocksSession is one granted operation: the negotiated stream, the last
/// reply from the proxy, and the datagram framing UDP associations must use.
pub struct SocksSession {
    version: Version,
    stream: Box<dyn IoStream>,
    encapsulation: Option<Arc<dyn UdpEncapsulation>>,
    reply: ProxyMessage,
    state: SessionState,
    local_addr: Option<SocketAddr>,
    accept_timeout: Duration,
}

/// SocksSession implementation block
impl SocksSession {
    /// state returns the session's handshake state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// version returns the protocol generation of this session.
    pub fn version(&self) -> Version {
        self.version
    }

    /// reply returns the last reply received from the proxy.
    pub fn reply(&self) -> &ProxyMessage {
        &self.reply
    }

    /// bound_addr returns the address the proxy reported in its last reply:
    /// the outbound binding for CONNECT, the listener for BIND, the relay
    /// endpoint for UDP ASSOCIATE.
    pub fn bound_addr(&self) -> &Address {
        &self.reply.addr
    }

    /// bound_port returns the port of [`SocksSession::bound_addr`].
    pub fn bound_port(&self) -> u16 {
        self.reply.port
    }

    /// local_addr returns the local endpoint of the first-hop TCP
    /// connection, when known.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// encapsulation returns the datagram framing negotiated for this
    /// session, if the scheme installed one.
    pub fn encapsulation(&self) -> Option<Arc<dyn UdpEncapsulation>> {
        self.encapsulation.clone()
    }

    /// accept waits for a BIND session's incoming connection. On success
    /// the second reply names the connected peer and the session stream
    /// becomes the data pipe to it.
    pub async fn accept(&mut self) -> Result<(Address, u16)> {
        let reply = match timeout(
            self.accept_timeout,
            message::read_reply(&mut self.stream, self.version),
        )
        .await
        {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => return self.fail(e).await,
            Err(_) => return self.fail(SocksError::Timeout(self.accept_timeout)).await,
        };

        if let Err(e) = reply.check_granted() {
            return self.fail(e).await;
        }

        debug!(
            "bind accepted incoming connection from {}:{}",
            reply.addr, reply.port
        );
        let peer = (reply.addr.clone(), reply.port);
        self.reply = reply;
        Ok(peer)
    }

    /// into_stream releases the session stream to the caller.
    pub fn into_stream(self) -> Box<dyn IoStream> {
        self.stream
    }

    /// close shuts the session stream down.
    pub async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }

    async fn fail<T>(&mut self, e: SocksError) -> Result<T> {
        self.state = SessionState::Failed;
        let _ = self.stream.shutdown().await;
        Err(e)
    }
}

impl fmt::Debug for SocksSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocksSession")
            .field("version", &self.version)
            .field("state", &self.state)
            .field("reply", &self.reply)
            .finish_non_exhaustive()
    }
}

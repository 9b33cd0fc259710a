//! SOCKS server: accept loop, request routing, and the per-command data
//! paths. One task per client; the authenticator decides who gets in and
//! its guard stays on the session for the rest of its life.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::auth::IoStream;
use crate::authenticator::{AuthedSession, OpenAuthenticator, ServerAuthenticator, SessionGuard};
use crate::config::SocksConfig;
use crate::error::{Result, SocksError};
use crate::message::{self, Address, ProxyMessage};
use crate::protocol::{Command, ReplyCode, Version, socks4};
use crate::relay;
use crate::udp_relay::UdpRelay;

/// SocksServer serves SOCKS4 and SOCKS5 clients and houses related
/// configuration data
pub struct SocksServer {
    listen_addr: String,
    authenticator: Arc<dyn ServerAuthenticator>,
    config: Arc<SocksConfig>,
    listener: Option<TcpListener>,
}

/// SocksServer implementation block
impl SocksServer {
    /// new is a constructor for the SocksServer type; the server starts
    /// out open, accepting both protocol versions without credentials.
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            authenticator: Arc::new(OpenAuthenticator),
            config: Arc::new(SocksConfig::default()),
            listener: None,
        }
    }

    /// with_authenticator applies the desired authentication scheme
    pub fn with_authenticator(mut self, authenticator: Arc<dyn ServerAuthenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    /// with_config applies timeout and chaining configuration
    pub fn with_config(mut self, config: SocksConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    /// listen_addr returns the configured listen address.
    pub fn listen_addr(&self) -> &str {
        &self.listen_addr
    }

    /// bind to the listen address, panics when called twice
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        if self.listener.is_some() {
            panic!("bind can only be called once");
        }

        let listener = TcpListener::bind(&self.listen_addr).await?;
        let addr = listener.local_addr()?;
        info!("SOCKS server listening on {addr}");

        self.listener = Some(listener);
        Ok(addr)
    }

    /// run handles server spinup and listens for incoming connections
    pub async fn run(&mut self) -> Result<()> {
        if self.listener.is_none() {
            self.bind().await?;
        }
        let listener = self.listener.take().unwrap();

        loop {
            let (inbound, peer_addr) = listener.accept().await?;

            let authenticator = Arc::clone(&self.authenticator);
            let config = Arc::clone(&self.config);

            tokio::spawn(async move {
                info!("new client: {peer_addr}");
                if let Err(e) = handle_connection(inbound, authenticator, config).await {
                    error!("connection from {peer_addr} failed: {e}");
                }
            });
        }
    }
}

/// handle_connection runs one client from handshake to teardown.
async fn handle_connection(
    stream: TcpStream,
    authenticator: Arc<dyn ServerAuthenticator>,
    config: Arc<SocksConfig>,
) -> Result<()> {
    // The boxed session stream cannot answer these later
    let peer = stream.peer_addr()?;
    let control_local = stream.local_addr()?;

    let session = authenticator.start_session(Box::new(stream)).await?;
    serve_request(session, peer, control_local, &config).await
}

/// serve_request reads the request off an authenticated session and routes
/// it; the guard's end-of-session hook runs on every exit path.
async fn serve_request(
    session: AuthedSession,
    peer: SocketAddr,
    control_local: SocketAddr,
    config: &SocksConfig,
) -> Result<()> {
    let AuthedSession {
        version,
        mut stream,
        guard,
    } = session;

    let result = route_request(&mut stream, version, &guard, peer, control_local, config).await;
    guard.end_session();
    result
}

/// route_request checks the request against the session guard and routes
/// the stream to the appropriate command handler.
async fn route_request(
    stream: &mut Box<dyn IoStream>,
    version: Version,
    guard: &Arc<dyn SessionGuard>,
    peer: SocketAddr,
    control_local: SocketAddr,
    config: &SocksConfig,
) -> Result<()> {
    // The codec leaves the stream positioned past what it could consume of
    // a bad request, so a failure reply still goes out best-effort
    let request = match message::read_request(stream, version).await {
        Ok(request) => request,
        Err(e) => {
            let _ = send_error_reply(stream, version, reply_code_for(&e)).await;
            return Err(e);
        }
    };

    let command = match Command::from_byte(request.command) {
        Some(command) => command,
        None => {
            send_error_reply(stream, version, ReplyCode::CommandNotSupported).await?;
            return Err(SocksError::Malformed("unrecognized command"));
        }
    };

    if !guard.check_request(&request) {
        send_error_reply(stream, version, ReplyCode::ConnectionNotAllowed).await?;
        return Err(SocksError::NotAuthorized);
    }

    debug!(
        "{peer} requested {command:?} to {}:{}",
        request.addr, request.port
    );

    match command {
        Command::Connect => handle_connect(stream, &request, config).await,
        Command::Bind => handle_bind(stream, &request, control_local, config).await,
        Command::UdpAssociate => {
            handle_udp_associate(stream, &request, Arc::clone(guard), peer, control_local, config)
                .await
        }
    }
}

// ================
// CONNECT COMMAND
// ================

/// handle_connect opens the outbound leg, reports its local endpoint to
/// the client, and relays until either side finishes or the pipe idles
/// out.
async fn handle_connect(
    stream: &mut Box<dyn IoStream>,
    request: &ProxyMessage,
    config: &SocksConfig,
) -> Result<()> {
    let (outbound, local) = match dial_remote(&request.addr, request.port, config).await {
        Ok(dialed) => dialed,
        Err(e) => {
            send_error_reply(stream, request.version, reply_code_for(&e)).await?;
            return Err(e);
        }
    };

    send_reply(stream, request.version, ReplyCode::Succeeded, local).await?;

    let stats = relay::pipe(stream, outbound, config.idle_timeout).await?;
    info!(
        "connection closed: {} bytes from client, {} bytes from remote",
        stats.from_client, stats.from_remote
    );
    Ok(())
}

/// dial_remote opens the outbound connection, either directly or through
/// the configured upstream proxy, and reports the remote-facing endpoint.
async fn dial_remote(
    addr: &Address,
    port: u16,
    config: &SocksConfig,
) -> Result<(Box<dyn IoStream>, SocketAddr)> {
    match &config.chain {
        Some(proxy) => {
            let session = proxy.connect(addr.clone(), port).await?;
            let bound = match session.bound_addr() {
                Address::Ip(ip) => SocketAddr::V4(SocketAddrV4::new(*ip, session.bound_port())),
                Address::Domain(_) => session
                    .local_addr()
                    .unwrap_or_else(|| SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))),
            };
            Ok((session.into_stream(), bound))
        }
        None => {
            let ip = addr.resolve().await?;
            let outbound = TcpStream::connect((ip, port)).await?;
            let local = outbound.local_addr()?;
            Ok((Box::new(outbound) as Box<dyn IoStream>, local))
        }
    }
}

// =============
// BIND COMMAND
// =============

/// handle_bind opens a listener for exactly one inbound connection and
/// reports it in two replies: first the listening endpoint, then the
/// connected peer. The request names the host the connection is expected
/// from; connections from anyone else are refused without consuming the
/// session.
async fn handle_bind(
    stream: &mut Box<dyn IoStream>,
    request: &ProxyMessage,
    control_local: SocketAddr,
    config: &SocksConfig,
) -> Result<()> {
    let listener = match TcpListener::bind("0.0.0.0:0").await {
        Ok(listener) => listener,
        Err(e) => {
            let e = SocksError::from(e);
            send_error_reply(stream, request.version, reply_code_for(&e)).await?;
            return Err(e);
        }
    };
    let bound = listener.local_addr()?;

    // An all-zeros listening address is useless to the peer; advertise the
    // address the client already reaches us at
    let advertised = if bound.ip().is_unspecified() {
        SocketAddr::new(control_local.ip(), bound.port())
    } else {
        bound
    };
    send_reply(stream, request.version, ReplyCode::Succeeded, advertised).await?;

    // An unspecified or unresolvable expectation accepts from anywhere
    let expected = match &request.addr {
        Address::Ip(ip) if !ip.is_unspecified() => Some(IpAddr::V4(*ip)),
        Address::Ip(_) => None,
        Address::Domain(_) => request.addr.resolve().await.ok().map(IpAddr::V4),
    };

    let accepted = tokio::select! {
        accepted = timeout(config.accept_timeout, accept_from(&listener, expected)) => accepted,
        closed = drain_until_eof(stream) => {
            debug!("client dropped the control connection before a bind peer arrived");
            return closed.map_err(SocksError::from);
        }
    };

    let (inbound, peer) = match accepted {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => {
            let e = SocksError::from(e);
            send_error_reply(stream, request.version, reply_code_for(&e)).await?;
            return Err(e);
        }
        Err(_) => {
            send_error_reply(stream, request.version, ReplyCode::TtlExpired).await?;
            return Err(SocksError::Timeout(config.accept_timeout));
        }
    };

    send_reply(stream, request.version, ReplyCode::Succeeded, peer).await?;

    let stats = relay::pipe(stream, inbound, config.idle_timeout).await?;
    info!(
        "bind connection closed: {} bytes from client, {} bytes from peer",
        stats.from_client, stats.from_remote
    );
    Ok(())
}

/// accept_from accepts the first connection from the expected address,
/// dropping connections from anyone else.
async fn accept_from(
    listener: &TcpListener,
    expected: Option<IpAddr>,
) -> io::Result<(TcpStream, SocketAddr)> {
    loop {
        let (inbound, peer) = listener.accept().await?;
        match expected {
            Some(ip) if peer.ip() != ip => {
                debug!("refusing bind connection from unexpected peer {peer}");
                drop(inbound);
            }
            _ => return Ok((inbound, peer)),
        }
    }
}

// ==============
// UDP ASSOCIATE
// ==============

/// handle_udp_associate brings up a datagram relay and parks on the
/// control connection; the association lives until the client drops that
/// connection or the relay goes idle. SOCKS4 has no datagram support.
async fn handle_udp_associate(
    stream: &mut Box<dyn IoStream>,
    request: &ProxyMessage,
    guard: Arc<dyn SessionGuard>,
    peer: SocketAddr,
    control_local: SocketAddr,
    config: &SocksConfig,
) -> Result<()> {
    if request.version == Version::Socks4 {
        send_error_reply(stream, Version::Socks4, ReplyCode::CommandNotSupported).await?;
        return Err(SocksError::UdpNotSupported);
    }

    // The request names the endpoint datagrams will come from; an
    // unspecified address means the host the control connection came from
    let client_ip = match &request.addr {
        Address::Ip(ip) if !ip.is_unspecified() => IpAddr::V4(*ip),
        _ => peer.ip(),
    };
    let client = SocketAddr::new(client_ip, request.port);

    let relay = match UdpRelay::start(client, guard, config).await {
        Ok(relay) => relay,
        Err(e) => {
            send_error_reply(stream, Version::Socks5, reply_code_for(&e)).await?;
            return Err(e);
        }
    };

    let advertised = SocketAddr::new(control_local.ip(), relay.relay_addr().port());
    if let Err(e) = send_reply(stream, Version::Socks5, ReplyCode::Succeeded, advertised).await {
        relay.shutdown();
        return Err(e);
    }

    // The association lives exactly as long as the control connection
    tokio::select! {
        closed = drain_until_eof(stream) => {
            debug!("control connection closed, ending UDP association");
            relay.shutdown();
            closed?;
        }
        _ = relay.closed() => {
            debug!("UDP relay ended, dropping control connection");
            relay.shutdown();
        }
    }
    Ok(())
}

// =========
// HELPERS
// =========

/// drain_until_eof consumes and discards control-stream bytes until the
/// client closes it.
async fn drain_until_eof(stream: &mut Box<dyn IoStream>) -> io::Result<()> {
    let mut sink = [0u8; 64];
    loop {
        if stream.read(&mut sink).await? == 0 {
            return Ok(());
        }
    }
}

/// reply_code_for maps a connection failure onto the closest SOCKS reply.
fn reply_code_for(err: &SocksError) -> ReplyCode {
    match err {
        SocksError::Io(e) => match e.kind() {
            io::ErrorKind::ConnectionRefused => ReplyCode::ConnectionRefused,
            io::ErrorKind::HostUnreachable => ReplyCode::HostUnreachable,
            io::ErrorKind::NetworkUnreachable => ReplyCode::NetworkUnreachable,
            io::ErrorKind::TimedOut => ReplyCode::TtlExpired,
            io::ErrorKind::PermissionDenied => ReplyCode::ConnectionNotAllowed,
            _ => ReplyCode::ServerFailure,
        },
        SocksError::UnresolvedHost(_) => ReplyCode::HostUnreachable,
        SocksError::Timeout(_) => ReplyCode::TtlExpired,
        SocksError::NotAuthorized => ReplyCode::ConnectionNotAllowed,
        SocksError::AddressTypeUnsupported(_) => ReplyCode::AddrTypeUnsupported,
        _ => ReplyCode::ServerFailure,
    }
}

/// send_reply reports a result in the session's protocol version. SOCKS4
/// has a single failure code, so every SOCKS5 error collapses onto
/// "request rejected or failed" there.
async fn send_reply(
    stream: &mut Box<dyn IoStream>,
    version: Version,
    code: ReplyCode,
    bound: SocketAddr,
) -> Result<()> {
    let status = match version {
        Version::Socks5 => code as u8,
        Version::Socks4 if code == ReplyCode::Succeeded => socks4::REQUEST_GRANTED,
        Version::Socks4 => socks4::REQUEST_REJECTED,
    };
    let (ip, port) = match bound {
        SocketAddr::V4(v4) => (*v4.ip(), v4.port()),
        // Replies carry IPv4; a V6 endpoint is advertised as unspecified
        SocketAddr::V6(v6) => (Ipv4Addr::UNSPECIFIED, v6.port()),
    };
    let reply = ProxyMessage::reply(version, status, Address::Ip(ip), port);
    message::write_reply(stream, &reply).await
}

/// send_error_reply reports a failure with an all-zeros bound address.
async fn send_error_reply(
    stream: &mut Box<dyn IoStream>,
    version: Version,
    code: ReplyCode,
) -> Result<()> {
    let zero = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
    send_reply(stream, version, code, zero).await
}

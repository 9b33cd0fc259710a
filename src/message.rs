//! Codec for SOCKS requests, replies, and UDP relay headers.
//!
//! Both protocol generations share one in-memory message shape,
//! [`ProxyMessage`]; the four entry points (`write_request`, `read_request`,
//! `write_reply`, `read_reply`) dispatch on its version tag. Stream parsing
//! is async over any `AsyncRead`; datagram headers are parsed from the
//! packet slice directly.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::lookup_host;

use crate::error::{ReplyError, Result, SocksError};
use crate::protocol::{
    AddressType, Command, FRAG_NONE, ReplyCode, RSV, SOCKS4_REPLY_VERSION, Version, socks4,
};

/// Address represents a destination a SOCKS message can carry: a raw
/// IPv4 address, or a domain name left for the proxy to resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Ip(Ipv4Addr),
    Domain(String),
}

/// Address implementation block
impl Address {
    /// resolve returns the IPv4 address for this destination, consulting
    /// the local resolver for domain names. Used where the wire format
    /// cannot carry a hostname (all of SOCKS4) or where the caller asked
    /// for client-side resolution.
    pub async fn resolve(&self) -> Result<Ipv4Addr> {
        match self {
            Address::Ip(ip) => Ok(*ip),
            Address::Domain(name) => {
                let addrs = lookup_host((name.as_str(), 0))
                    .await
                    .map_err(|_| SocksError::UnresolvedHost(name.clone()))?;
                for addr in addrs {
                    if let SocketAddr::V4(v4) = addr {
                        return Ok(*v4.ip());
                    }
                }
                Err(SocksError::UnresolvedHost(name.clone()))
            }
        }
    }
}

impl From<Ipv4Addr> for Address {
    fn from(ip: Ipv4Addr) -> Self {
        Address::Ip(ip)
    }
}

// A literal IPv4 string becomes an Ip so it travels as ATYP 0x01;
// anything else is treated as a name for the proxy to resolve.
impl From<&str> for Address {
    fn from(host: &str) -> Self {
        match host.parse::<Ipv4Addr>() {
            Ok(ip) => Address::Ip(ip),
            Err(_) => Address::Domain(host.to_string()),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(ip) => write!(f, "{ip}"),
            Address::Domain(name) => write!(f, "{name}"),
        }
    }
}

/// ProxyMessage is the single in-memory shape for SOCKS requests and
/// replies. `command` carries the command byte on requests and the status
/// byte on replies; `user` is the SOCKS4 user id field and is ignored by
/// the SOCKS5 codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyMessage {
    pub version: Version,
    pub command: u8,
    pub addr: Address,
    pub port: u16,
    pub user: Option<String>,
}

/// ProxyMessage implementation block
impl ProxyMessage {
    /// request builds a client request message.
    pub fn request(version: Version, command: Command, addr: Address, port: u16) -> Self {
        Self {
            version,
            command: command as u8,
            addr,
            port,
            user: None,
        }
    }

    /// reply builds a server reply message carrying the given status byte.
    pub fn reply(version: Version, status: u8, addr: Address, port: u16) -> Self {
        Self {
            version,
            command: status,
            addr,
            port,
            user: None,
        }
    }

    /// with_user attaches a SOCKS4 user id to the message.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// check_granted returns Ok only if this reply carries the success
    /// status for its protocol version; any other status maps to the
    /// matching [`ReplyError`].
    pub fn check_granted(&self) -> Result<()> {
        match self.version {
            Version::Socks5 if self.command == ReplyCode::Succeeded as u8 => Ok(()),
            Version::Socks4 if self.command == socks4::REQUEST_GRANTED => Ok(()),
            Version::Socks5 => Err(ReplyError::from_socks5(self.command).into()),
            Version::Socks4 => Err(ReplyError::from_socks4(self.command).into()),
        }
    }
}

/// write_request serializes a client request for the message's version.
/// SOCKS4 cannot carry a hostname, so domain destinations are resolved
/// locally before anything touches the wire.
pub async fn write_request<W>(stream: &mut W, msg: &ProxyMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    match msg.version {
        Version::Socks4 => write_socks4(stream, Version::Socks4 as u8, msg).await,
        Version::Socks5 => write_socks5(stream, msg).await,
    }
}

/// write_reply serializes a server reply. SOCKS4 replies carry version
/// byte 0, not 4.
pub async fn write_reply<W>(stream: &mut W, msg: &ProxyMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    match msg.version {
        Version::Socks4 => write_socks4(stream, SOCKS4_REPLY_VERSION, msg).await,
        Version::Socks5 => write_socks5(stream, msg).await,
    }
}

/// read_request parses a client request off the session stream. For SOCKS4
/// the caller has already consumed the version byte while sniffing the
/// protocol; a SOCKS5 request starts a fresh message after authentication,
/// so its version byte is read and checked here.
pub async fn read_request<R>(stream: &mut R, version: Version) -> Result<ProxyMessage>
where
    R: AsyncRead + Unpin,
{
    match version {
        Version::Socks4 => read_request_v4(stream).await,
        Version::Socks5 => {
            let mut ver = [0u8; 1];
            stream.read_exact(&mut ver).await?;
            if ver[0] != Version::Socks5 as u8 {
                return Err(SocksError::VersionMismatch {
                    expected: Version::Socks5,
                    got: ver[0],
                });
            }
            read_tail_v5(stream, version).await
        }
    }
}

/// read_reply parses a server reply, version byte included.
/// Use [`ProxyMessage::check_granted`] to turn a non-success status into
/// its error.
pub async fn read_reply<R>(stream: &mut R, version: Version) -> Result<ProxyMessage>
where
    R: AsyncRead + Unpin,
{
    match version {
        Version::Socks4 => {
            let mut raw = [0u8; 8];
            stream.read_exact(&mut raw).await?;
            if raw[0] != SOCKS4_REPLY_VERSION {
                return Err(SocksError::VersionMismatch {
                    expected: Version::Socks4,
                    got: raw[0],
                });
            }
            Ok(ProxyMessage {
                version: Version::Socks4,
                command: raw[1],
                addr: Address::Ip(Ipv4Addr::new(raw[4], raw[5], raw[6], raw[7])),
                port: u16::from_be_bytes([raw[2], raw[3]]),
                user: None,
            })
        }
        Version::Socks5 => {
            let mut ver = [0u8; 1];
            stream.read_exact(&mut ver).await?;
            if ver[0] != Version::Socks5 as u8 {
                return Err(SocksError::VersionMismatch {
                    expected: Version::Socks5,
                    got: ver[0],
                });
            }
            read_tail_v5(stream, version).await
        }
    }
}

// SOCKS4 request and reply share one layout; only the leading version
// byte differs (0x04 on requests, 0x00 on replies).
async fn write_socks4<W>(stream: &mut W, version_byte: u8, msg: &ProxyMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let ip = msg.addr.resolve().await?;

    let user = msg.user.as_deref().unwrap_or("");
    if user.as_bytes().contains(&0x00) {
        return Err(SocksError::Malformed("SOCKS4 user id must not contain NUL"));
    }

    let mut buf = Vec::with_capacity(9 + user.len());
    buf.push(version_byte);
    buf.push(msg.command);
    buf.extend_from_slice(&msg.port.to_be_bytes());
    buf.extend_from_slice(&ip.octets());
    buf.extend_from_slice(user.as_bytes());
    buf.push(0x00);

    stream.write_all(&buf).await?;
    Ok(())
}

// SOCKS5 request and reply are byte-identical in structure:
// VER CMD/REP RSV ATYP ADDR PORT.
async fn write_socks5<W>(stream: &mut W, msg: &ProxyMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(10);
    buf.push(Version::Socks5 as u8);
    buf.push(msg.command);
    buf.push(RSV);
    push_address(&mut buf, &msg.addr, msg.port)?;

    stream.write_all(&buf).await?;
    Ok(())
}

async fn read_request_v4<R>(stream: &mut R) -> Result<ProxyMessage>
where
    R: AsyncRead + Unpin,
{
    // CD + DSTPORT + DSTIP
    let mut head = [0u8; 7];
    stream.read_exact(&mut head).await?;

    let port = u16::from_be_bytes([head[1], head[2]]);
    let ip = Ipv4Addr::new(head[3], head[4], head[5], head[6]);

    // USERID runs until the NUL terminator
    let mut user = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).await?;
        if byte[0] == 0x00 {
            break;
        }
        if user.len() == 255 {
            return Err(SocksError::Malformed("SOCKS4 user id too long"));
        }
        user.push(byte[0]);
    }
    let user =
        String::from_utf8(user).map_err(|_| SocksError::Malformed("SOCKS4 user id is not UTF-8"))?;

    Ok(ProxyMessage {
        version: Version::Socks4,
        command: head[0],
        addr: Address::Ip(ip),
        port,
        user: Some(user),
    })
}

// Everything after the version byte of a SOCKS5 request or reply.
async fn read_tail_v5<R>(stream: &mut R, version: Version) -> Result<ProxyMessage>
where
    R: AsyncRead + Unpin,
{
    // CMD/REP + RSV; the reserved byte is tolerated whatever its value
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;

    let (addr, port) = read_address(stream).await?;

    Ok(ProxyMessage {
        version,
        command: head[0],
        addr,
        port,
        user: None,
    })
}

/// read_address parses the ATYP, ADDR, and PORT fields of a SOCKS5
/// message. IPv6 addresses are consumed in full so the stream stays in
/// sync, then refused.
async fn read_address<R>(stream: &mut R) -> Result<(Address, u16)>
where
    R: AsyncRead + Unpin,
{
    let mut atyp = [0u8; 1];
    stream.read_exact(&mut atyp).await?;

    let addr = match AddressType::from_byte(atyp[0]) {
        Some(AddressType::IPv4) => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Address::Ip(Ipv4Addr::from(octets))
        }
        Some(AddressType::DomainName) => {
            // First octet carries the number of octets to follow
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            if len[0] == 0 {
                return Err(SocksError::Malformed("domain length cannot be 0"));
            }
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            let name = String::from_utf8(name)
                .map_err(|_| SocksError::Malformed("domain name is not valid UTF-8"))?;
            Address::Domain(name)
        }
        Some(AddressType::IPv6) => {
            let mut skip = [0u8; 18];
            stream.read_exact(&mut skip).await?;
            return Err(SocksError::AddressTypeUnsupported(AddressType::IPv6 as u8));
        }
        None => return Err(SocksError::AddressTypeUnsupported(atyp[0])),
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;

    Ok((addr, u16::from_be_bytes(port)))
}

/// push_address appends the ATYP, ADDR, and PORT fields to an outgoing
/// message buffer.
fn push_address(buf: &mut Vec<u8>, addr: &Address, port: u16) -> Result<()> {
    match addr {
        Address::Ip(ip) => {
            buf.push(AddressType::IPv4 as u8);
            buf.extend_from_slice(&ip.octets());
        }
        Address::Domain(name) => {
            if name.is_empty() || name.len() > 255 {
                return Err(SocksError::Malformed("domain name must be 1-255 bytes"));
            }
            buf.push(AddressType::DomainName as u8);
            buf.push(name.len() as u8);
            buf.extend_from_slice(name.as_bytes());
        }
    }
    buf.extend_from_slice(&port.to_be_bytes());
    Ok(())
}

/// UdpHeader is the encapsulation header prefixed to every datagram
/// relayed through a SOCKS5 UDP association:
///
/// ```text
/// +----+------+------+----------+----------+----------+
/// |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
/// +----+------+------+----------+----------+----------+
/// | 2  |  1   |  1   | Variable |    2     | Variable |
/// +----+------+------+----------+----------+----------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpHeader {
    pub frag: u8,
    pub addr: Address,
    pub port: u16,
}

/// UdpHeader implementation block
impl UdpHeader {
    /// new builds an unfragmented header addressed at the given destination.
    pub fn new(addr: Address, port: u16) -> Self {
        Self {
            frag: FRAG_NONE,
            addr,
            port,
        }
    }

    /// encode prepends this header to a payload and returns the packet.
    pub fn encode(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(10 + payload.len());
        buf.extend_from_slice(&[RSV, RSV, self.frag]);
        push_address(&mut buf, &self.addr, self.port)?;
        buf.extend_from_slice(payload);
        Ok(buf)
    }

    /// decode splits a received packet into its header and the offset at
    /// which the payload starts. Fragmented packets parse fine; deciding
    /// to drop them is the caller's job.
    pub fn decode(packet: &[u8]) -> Result<(UdpHeader, usize)> {
        if packet.len() < 4 {
            return Err(SocksError::Malformed("datagram too short for relay header"));
        }
        let frag = packet[2];
        let mut offset = 4usize;

        let (addr, port) = match AddressType::from_byte(packet[3]) {
            Some(AddressType::IPv4) => {
                if packet.len() < offset + 6 {
                    return Err(SocksError::Malformed("datagram truncates IPv4 address"));
                }
                let ip = Ipv4Addr::new(
                    packet[offset],
                    packet[offset + 1],
                    packet[offset + 2],
                    packet[offset + 3],
                );
                offset += 4;
                let port = u16::from_be_bytes([packet[offset], packet[offset + 1]]);
                offset += 2;
                (Address::Ip(ip), port)
            }
            Some(AddressType::DomainName) => {
                if packet.len() < offset + 1 {
                    return Err(SocksError::Malformed("datagram truncates domain length"));
                }
                let len = packet[offset] as usize;
                offset += 1;
                if len == 0 {
                    return Err(SocksError::Malformed("domain length cannot be 0"));
                }
                if packet.len() < offset + len + 2 {
                    return Err(SocksError::Malformed("datagram truncates domain and port"));
                }
                let name = String::from_utf8(packet[offset..offset + len].to_vec())
                    .map_err(|_| SocksError::Malformed("domain name is not valid UTF-8"))?;
                offset += len;
                let port = u16::from_be_bytes([packet[offset], packet[offset + 1]]);
                offset += 2;
                (Address::Domain(name), port)
            }
            Some(AddressType::IPv6) => {
                return Err(SocksError::AddressTypeUnsupported(AddressType::IPv6 as u8));
            }
            None => return Err(SocksError::AddressTypeUnsupported(packet[3])),
        };

        Ok((UdpHeader { frag, addr, port }, offset))
    }
}

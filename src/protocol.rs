//! Wire-level constants shared by the SOCKS4 and SOCKS5 codecs.
//!
//! SOCKS5 request/reply format (RFC 1928):
//!
//! ```text
//! +----+-----+-------+------+----------+----------+
//! |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
//! +----+-----+-------+------+----------+----------+
//! | 1  |  1  | X'00' |  1   | Variable |    2     |
//! +----+-----+-------+------+----------+----------+
//! ```
//!
//! SOCKS4 request format:
//!
//! ```text
//! +----+-----+----------+--------+----------+------+
//! |VER | CMD | DST.PORT | DST.IP |  USERID  | NULL |
//! +----+-----+----------+--------+----------+------+
//! | 1  |  1  |    2     |   4    | Variable |  1   |
//! +----+-----+----------+--------+----------+------+
//! ```

/// RSV: fields marked RESERVED (RSV) must be set to X'00'.
pub const RSV: u8 = 0x00;

/// FRAG: SOCKS5 UDP fragmentation is not implemented, always 0.
pub const FRAG_NONE: u8 = 0x00;

/// Sub-negotiation version for RFC 1929 username/password exchanges.
pub const USERPASS_VERSION: u8 = 0x01;

/// RFC 1929 status byte for a successful authentication.
pub const USERPASS_SUCCESS: u8 = 0x00;

/// RFC 1929 status byte for a failed authentication (any nonzero works,
/// this is the conventional value).
pub const USERPASS_FAILURE: u8 = 0x01;

/// Version byte carried by SOCKS4 server replies (the protocol quirkily
/// echoes 0, not 4).
pub const SOCKS4_REPLY_VERSION: u8 = 0x00;

/// Version represents the two supported SOCKS protocol generations.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Socks4 = 0x04,
    Socks5 = 0x05,
}

/// Version implementation block
impl Version {
    /// from_byte converts a wire version byte to its protocol generation
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x04 => Some(Version::Socks4),
            0x05 => Some(Version::Socks5),
            _ => None,
        }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Version::Socks4 => write!(f, "SOCKS4"),
            Version::Socks5 => write!(f, "SOCKS5"),
        }
    }
}

/// Command represents the three SOCKS commands, shared verbatim by both
/// protocol generations (SOCKS4 only honors the first two).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

/// Command implementation block
impl Command {
    /// from_byte converts a byte to its related SOCKS command
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Command::Connect),
            0x02 => Some(Command::Bind),
            0x03 => Some(Command::UdpAssociate),
            _ => None,
        }
    }
}

/// AddressType represents the SOCKS5 ATYP field values:
/// IPv4, Domain Name, IPv6
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    IPv4 = 0x01,
    DomainName = 0x03,
    IPv6 = 0x04,
}

/// AddressType implementation block
impl AddressType {
    /// from_byte converts a byte to its related network address type
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(AddressType::IPv4),
            0x03 => Some(AddressType::DomainName),
            0x04 => Some(AddressType::IPv6),
            _ => None,
        }
    }
}

/// AuthMethod represents the SOCKS5 authentication method ids this crate
/// knows about. GSSAPI is recognized but has no implementation.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    NoAuth = 0x00,
    Gssapi = 0x01,
    UserPass = 0x02,
    // 0x03 - 0x7F: IANA reserved
    // 0x80 - 0xFE: private methods
    NoAcceptable = 0xFF,
}

/// ReplyCode represents the SOCKS5 reply field values (RFC 1928 §6).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    Succeeded = 0x00,
    ServerFailure = 0x01,
    ConnectionNotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddrTypeUnsupported = 0x08,
    // 0x09 - 0xFF: unassigned
}

/// SOCKS4 reply status bytes. The v4 protocol has no auth negotiation and a
/// much coarser failure vocabulary.
pub mod socks4 {
    /// Request granted.
    pub const REQUEST_GRANTED: u8 = 90;
    /// Request rejected or failed.
    pub const REQUEST_REJECTED: u8 = 91;
    /// Request rejected: could not reach the client's identd.
    pub const IDENTD_UNREACHABLE: u8 = 92;
    /// Request rejected: identd reported a different user id.
    pub const IDENTD_MISMATCH: u8 = 93;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_round_trips_through_bytes() {
        assert_eq!(Version::from_byte(0x04), Some(Version::Socks4));
        assert_eq!(Version::from_byte(0x05), Some(Version::Socks5));
        assert_eq!(Version::from_byte(0x06), None);
        assert_eq!(Version::Socks5 as u8, 0x05);
    }

    #[test]
    fn command_rejects_unknown_bytes() {
        assert_eq!(Command::from_byte(0x01), Some(Command::Connect));
        assert_eq!(Command::from_byte(0x03), Some(Command::UdpAssociate));
        assert_eq!(Command::from_byte(0x00), None);
        assert_eq!(Command::from_byte(0x04), None);
    }

    #[test]
    fn address_type_covers_rfc_values() {
        assert_eq!(AddressType::from_byte(0x01), Some(AddressType::IPv4));
        assert_eq!(AddressType::from_byte(0x03), Some(AddressType::DomainName));
        assert_eq!(AddressType::from_byte(0x04), Some(AddressType::IPv6));
        assert_eq!(AddressType::from_byte(0x02), None);
    }
}

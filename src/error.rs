use std::io;

use thiserror::Error;

use crate::protocol::{Version, socks4};

/// Result type alias used throughout the library.
pub type Result<T> = std::result::Result<T, SocksError>;

/// Numeric codes at or above this value denote errors raised locally;
/// everything below echoes a reply code received from a SOCKS server.
pub const LOCAL_ERROR_BASE: u32 = 0x1_0000;

/// ReplyError enumerates every non-success reply a SOCKS server can send,
/// one distinct variant per wire code so callers can match on the exact
/// failure. SOCKS5 defines codes 1-8 plus the unassigned range; SOCKS4 has
/// its own three rejection statuses.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyError {
    // SOCKS5 (RFC 1928 §6)
    #[error("general SOCKS server failure")]
    ServerFailure,
    #[error("connection not allowed by ruleset")]
    ConnectionNotAllowed,
    #[error("network unreachable")]
    NetworkUnreachable,
    #[error("host unreachable")]
    HostUnreachable,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("TTL expired")]
    TtlExpired,
    #[error("command not supported")]
    CommandNotSupported,
    #[error("address type not supported")]
    AddrTypeUnsupported,
    #[error("unassigned SOCKS5 reply code {0:#04x}")]
    Unassigned(u8),

    // SOCKS4
    #[error("request rejected or failed")]
    RequestRejected,
    #[error("request rejected: identd unreachable")]
    IdentdUnreachable,
    #[error("request rejected: identd user mismatch")]
    IdentdMismatch,
    #[error("unknown SOCKS4 reply code {0:#04x}")]
    UnknownSocks4(u8),
}

/// ReplyError implementation block
impl ReplyError {
    /// from_socks5 maps a non-success SOCKS5 reply byte to its error.
    /// Callers must not pass 0 (success).
    pub fn from_socks5(code: u8) -> Self {
        match code {
            0x01 => ReplyError::ServerFailure,
            0x02 => ReplyError::ConnectionNotAllowed,
            0x03 => ReplyError::NetworkUnreachable,
            0x04 => ReplyError::HostUnreachable,
            0x05 => ReplyError::ConnectionRefused,
            0x06 => ReplyError::TtlExpired,
            0x07 => ReplyError::CommandNotSupported,
            0x08 => ReplyError::AddrTypeUnsupported,
            other => ReplyError::Unassigned(other),
        }
    }

    /// from_socks4 maps a non-success SOCKS4 status byte to its error.
    /// Callers must not pass 90 (granted).
    pub fn from_socks4(code: u8) -> Self {
        match code {
            socks4::REQUEST_REJECTED => ReplyError::RequestRejected,
            socks4::IDENTD_UNREACHABLE => ReplyError::IdentdUnreachable,
            socks4::IDENTD_MISMATCH => ReplyError::IdentdMismatch,
            other => ReplyError::UnknownSocks4(other),
        }
    }

    /// wire_code returns the byte the server sent for this reply.
    pub fn wire_code(&self) -> u8 {
        match self {
            ReplyError::ServerFailure => 0x01,
            ReplyError::ConnectionNotAllowed => 0x02,
            ReplyError::NetworkUnreachable => 0x03,
            ReplyError::HostUnreachable => 0x04,
            ReplyError::ConnectionRefused => 0x05,
            ReplyError::TtlExpired => 0x06,
            ReplyError::CommandNotSupported => 0x07,
            ReplyError::AddrTypeUnsupported => 0x08,
            ReplyError::Unassigned(c) => *c,
            ReplyError::RequestRejected => socks4::REQUEST_REJECTED,
            ReplyError::IdentdUnreachable => socks4::IDENTD_UNREACHABLE,
            ReplyError::IdentdMismatch => socks4::IDENTD_MISMATCH,
            ReplyError::UnknownSocks4(c) => *c,
        }
    }
}

/// SocksError is the single error type surfaced by the library. Remote
/// failures carry the exact server reply; local failures carry a code in the
/// reserved high range (see [`LOCAL_ERROR_BASE`]).
#[derive(Error, Debug)]
pub enum SocksError {
    /// The proxy answered the request with a non-success reply.
    #[error("SOCKS server replied: {0}")]
    Reply(#[from] ReplyError),

    /// I/O failure on the session socket.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer spoke a different protocol version than negotiated.
    #[error("expected {expected} message, got version byte {got:#04x}")]
    VersionMismatch { expected: Version, got: u8 },

    /// A structurally invalid message.
    #[error("malformed message: {0}")]
    Malformed(&'static str),

    /// The server accepted none of the offered authentication methods.
    #[error("no acceptable authentication method")]
    NoAcceptableMethods,

    /// Credential exchange ran and was rejected.
    #[error("authentication failed")]
    AuthFailed,

    /// The peer selected a method this session cannot execute.
    #[error("authentication method {0:#04x} not supported")]
    MethodNotSupported(u8),

    /// UDP association requested on a SOCKS4 proxy.
    #[error("UDP associate is not supported by SOCKS4, use SOCKS5")]
    UdpNotSupported,

    /// An address type the engine does not handle (IPv6 on the wire).
    #[error("address type {0:#04x} not supported")]
    AddressTypeUnsupported(u8),

    /// Hostname did not resolve to any IPv4 address.
    #[error("could not resolve host {0:?}")]
    UnresolvedHost(String),

    /// A blocking wait ran out of time budget.
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The server authenticator denied the request.
    #[error("request not authorized")]
    NotAuthorized,

    /// A second accept on a consumed bind session. SOCKS4 makes this a
    /// protocol rule; a proxied SOCKS5 listener runs out the same way.
    #[error("bind session allows exactly one accept")]
    AlreadyAccepted,
}

/// SocksError implementation block
impl SocksError {
    /// code returns the numeric error code: the raw wire reply code for
    /// remote failures, or `LOCAL_ERROR_BASE + n` for locally raised ones.
    pub fn code(&self) -> u32 {
        match self {
            SocksError::Reply(r) => r.wire_code() as u32,
            SocksError::Io(_) => LOCAL_ERROR_BASE + 1,
            SocksError::VersionMismatch { .. } => LOCAL_ERROR_BASE + 2,
            SocksError::Malformed(_) => LOCAL_ERROR_BASE + 3,
            SocksError::NoAcceptableMethods => LOCAL_ERROR_BASE + 4,
            SocksError::AuthFailed => LOCAL_ERROR_BASE + 5,
            SocksError::MethodNotSupported(_) => LOCAL_ERROR_BASE + 6,
            SocksError::UdpNotSupported => LOCAL_ERROR_BASE + 7,
            SocksError::AddressTypeUnsupported(_) => LOCAL_ERROR_BASE + 8,
            SocksError::UnresolvedHost(_) => LOCAL_ERROR_BASE + 9,
            SocksError::Timeout(_) => LOCAL_ERROR_BASE + 10,
            SocksError::NotAuthorized => LOCAL_ERROR_BASE + 11,
            SocksError::AlreadyAccepted => LOCAL_ERROR_BASE + 12,
        }
    }

    /// is_local reports whether this error was raised on this side of the
    /// proxy rather than received from it.
    pub fn is_local(&self) -> bool {
        self.code() >= LOCAL_ERROR_BASE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_codes_round_trip() {
        for code in 1u8..=8 {
            assert_eq!(ReplyError::from_socks5(code).wire_code(), code);
        }
        assert_eq!(ReplyError::from_socks5(0x0B).wire_code(), 0x0B);
        for code in 91u8..=93 {
            assert_eq!(ReplyError::from_socks4(code).wire_code(), code);
        }
        assert_eq!(
            ReplyError::from_socks4(socks4::IDENTD_UNREACHABLE),
            ReplyError::IdentdUnreachable
        );
        assert_eq!(
            ReplyError::from_socks4(socks4::IDENTD_MISMATCH),
            ReplyError::IdentdMismatch
        );
    }

    #[test]
    fn remote_errors_sit_below_local_base() {
        let remote = SocksError::Reply(ReplyError::HostUnreachable);
        assert!(remote.code() < LOCAL_ERROR_BASE);
        assert!(!remote.is_local());

        let local = SocksError::UdpNotSupported;
        assert!(local.code() >= LOCAL_ERROR_BASE);
        assert!(local.is_local());
    }

    #[test]
    fn local_codes_are_distinct() {
        let errs = [
            SocksError::NoAcceptableMethods,
            SocksError::AuthFailed,
            SocksError::UdpNotSupported,
            SocksError::NotAuthorized,
            SocksError::AlreadyAccepted,
        ];
        let mut codes: Vec<u32> = errs.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errs.len());
    }

    #[test]
    fn display_names_the_failure() {
        let err = SocksError::Reply(ReplyError::ConnectionRefused);
        assert!(format!("{err}").contains("connection refused"));

        let err = SocksError::UdpNotSupported;
        assert!(format!("{err}").contains("use SOCKS5"));
    }
}

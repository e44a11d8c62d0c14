//! Client-facing protocol kinds and their acknowledgment bytes.
//!
//! Both front-ends report the tunnel result to the client only after the
//! relay handshake has finished, so the acknowledgments live here rather
//! than in the front-end modules.

use std::fmt;
use std::str::FromStr;

/// SOCKS5 success reply with a fixed 127.0.0.1:0 bound address.
pub const SOCKS5_SUCCESS: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 0x7f, 0x00, 0x00, 0x01, 0x00, 0x00];

/// SOCKS5 general failure reply.
pub const SOCKS5_GENERAL_FAILURE: [u8; 10] =
    [0x05, 0x05, 0x00, 0x01, 0x7f, 0x00, 0x00, 0x01, 0x00, 0x00];

/// SOCKS5 command-not-supported reply.
pub const SOCKS5_COMMAND_NOT_SUPPORTED: [u8; 10] =
    [0x05, 0x07, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

/// HTTP tunnel established.
pub const HTTP_SUCCESS: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

/// HTTP tunnel failed.
pub const HTTP_FAILURE: &[u8] = b"HTTP/1.1 500 Internal Server Error\r\n\r\n";

/// Protocol spoken by clients on a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyKind {
    /// Minimal HTTP tunnel (Host header sniffing).
    Http,
    /// SOCKS5 with no authentication, CONNECT only.
    Socks5,
}

impl ProxyKind {
    /// Default listen port for this kind.
    pub fn default_port(self) -> u16 {
        match self {
            ProxyKind::Http => 8080,
            ProxyKind::Socks5 => 1080,
        }
    }

    /// Bytes sent to the client once the relay handshake completes.
    pub fn success_ack(self) -> &'static [u8] {
        match self {
            ProxyKind::Http => HTTP_SUCCESS,
            ProxyKind::Socks5 => &SOCKS5_SUCCESS,
        }
    }

    /// Bytes sent to the client when the relay rejected the upgrade.
    pub fn failure_ack(self) -> &'static [u8] {
        match self {
            ProxyKind::Http => HTTP_FAILURE,
            ProxyKind::Socks5 => &SOCKS5_GENERAL_FAILURE,
        }
    }
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyKind::Http => f.write_str("HTTP"),
            ProxyKind::Socks5 => f.write_str("SOCKS5"),
        }
    }
}

impl FromStr for ProxyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "HTTP" => Ok(ProxyKind::Http),
            "SOCKS" | "SOCKS5" | "SOCKS 5" => Ok(ProxyKind::Socks5),
            other => Err(format!("unknown proxy type: {other}")),
        }
    }
}

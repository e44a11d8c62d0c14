//! SOCKS5 front-end.
//!
//! Only the subset needed for tunneling is supported:
//! - method negotiation with "no authentication" (0x00)
//! - CONNECT requests for IPv4, domain and IPv6 targets
//!
//! The handshake is an explicit state machine. Each state reads exactly one
//! client message, so a fatal validation failure stops consuming bytes at
//! that point; the caller closes the connection.
//!
//! The success reply is *not* sent here. It is sent by the tunnel session
//! once the relay handshake completes (see [`super::protocol`]).

use std::net::{Ipv4Addr, Ipv6Addr};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::protocol::SOCKS5_COMMAND_NOT_SUPPORTED;

/// Protocol version byte.
pub const SOCKS_VERSION: u8 = 0x05;

/// "No authentication required" method.
pub const METHOD_NO_AUTH: u8 = 0x00;

/// Method selection reply for "no authentication".
pub const METHOD_SELECTED: [u8; 2] = [SOCKS_VERSION, METHOD_NO_AUTH];

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Fatal SOCKS5 handshake errors.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported SOCKS version {0:#04x}")]
    VersionMismatch(u8),

    #[error("client does not offer the no-authentication method")]
    NoAcceptableMethod,

    #[error("non-zero reserved byte {0:#04x}")]
    ReservedByte(u8),

    #[error("unsupported command {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("unknown address type {0:#04x}")]
    UnknownAddressType(u8),

    #[error("domain name is not valid text")]
    InvalidDomain,

    #[error("request truncated")]
    Truncated,
}

impl HandshakeError {
    /// Reply to write before closing, if the failure has one.
    ///
    /// Everything except an unsupported command is closed silently.
    pub fn reply(&self) -> Option<&'static [u8]> {
        match self {
            HandshakeError::UnsupportedCommand(_) => Some(&SOCKS5_COMMAND_NOT_SUPPORTED),
            _ => None,
        }
    }
}

/// Handshake progress for one client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Socks5State {
    /// Waiting for the version/methods greeting.
    AwaitingGreeting,
    /// Method selected, waiting for the CONNECT request.
    AwaitingRequest,
    /// Target resolved; the connection is handed to a tunnel session.
    Relaying { target: String },
}

impl Socks5State {
    /// Consume the next client message and move to the following state.
    pub async fn advance<S>(self, stream: &mut S) -> Result<Socks5State, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self {
            Socks5State::AwaitingGreeting => {
                read_greeting(stream).await?;
                stream.write_all(&METHOD_SELECTED).await?;
                Ok(Socks5State::AwaitingRequest)
            }
            Socks5State::AwaitingRequest => match read_request(stream).await {
                Ok(target) => Ok(Socks5State::Relaying { target }),
                Err(e) => {
                    if let Some(reply) = e.reply() {
                        // Best effort: the connection is closed either way.
                        let _ = stream.write_all(reply).await;
                    }
                    Err(e)
                }
            },
            relaying @ Socks5State::Relaying { .. } => Ok(relaying),
        }
    }
}

/// Run the handshake to completion and return the requested target.
pub async fn negotiate<S>(stream: &mut S) -> Result<String, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut state = Socks5State::AwaitingGreeting;
    loop {
        state = match state.advance(stream).await? {
            Socks5State::Relaying { target } => {
                debug!(proxy_target = %target, "SOCKS5 request parsed");
                return Ok(target);
            }
            next => next,
        };
    }
}

/// Read the greeting and check it offers "no authentication".
async fn read_greeting<S: AsyncRead + Unpin>(stream: &mut S) -> Result<(), HandshakeError> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;

    // Bail before trusting the method count of a non-SOCKS5 client.
    if header[0] != SOCKS_VERSION {
        return Err(HandshakeError::VersionMismatch(header[0]));
    }

    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&METHOD_NO_AUTH) {
        return Err(HandshakeError::NoAcceptableMethod);
    }

    Ok(())
}

/// Read a request and return its rendered `host:port` target.
async fn read_request<S: AsyncRead + Unpin>(stream: &mut S) -> Result<String, HandshakeError> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let [version, command, reserved, atyp] = header;

    if version != SOCKS_VERSION {
        return Err(HandshakeError::VersionMismatch(version));
    }
    if reserved != 0x00 {
        return Err(HandshakeError::ReservedByte(reserved));
    }
    if command != CMD_CONNECT {
        return Err(HandshakeError::UnsupportedCommand(command));
    }

    let addr_len = match atyp {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            1 + len[0] as usize
        }
        other => return Err(HandshakeError::UnknownAddressType(other)),
    };

    // atyp, address, port
    let mut body = vec![0u8; 1 + addr_len + 2];
    body[0] = atyp;
    if atyp == ATYP_DOMAIN {
        body[1] = (addr_len - 1) as u8;
        stream.read_exact(&mut body[2..]).await?;
    } else {
        stream.read_exact(&mut body[1..]).await?;
    }

    resolve_target(&body)
}

/// Render the address portion of a request as `host:port`.
///
/// `bytes` starts at the address type byte and ends with the two port
/// bytes (big-endian). IPv6 hosts are compressed and bracketed.
pub fn resolve_target(bytes: &[u8]) -> Result<String, HandshakeError> {
    let (&atyp, rest) = bytes.split_first().ok_or(HandshakeError::Truncated)?;

    let (host, port_bytes) = match atyp {
        ATYP_IPV4 => {
            let octets: [u8; 4] = take(rest, 4)?;
            (Ipv4Addr::from(octets).to_string(), &rest[4..])
        }
        ATYP_DOMAIN => {
            let (&len, rest) = rest.split_first().ok_or(HandshakeError::Truncated)?;
            let len = len as usize;
            if rest.len() < len {
                return Err(HandshakeError::Truncated);
            }
            let domain = std::str::from_utf8(&rest[..len])
                .map_err(|_| HandshakeError::InvalidDomain)?;
            (domain.to_string(), &rest[len..])
        }
        ATYP_IPV6 => {
            let octets: [u8; 16] = take(rest, 16)?;
            (format!("[{}]", Ipv6Addr::from(octets)), &rest[16..])
        }
        other => return Err(HandshakeError::UnknownAddressType(other)),
    };

    let port: [u8; 2] = take(port_bytes, 2)?;
    Ok(format!("{}:{}", host, u16::from_be_bytes(port)))
}

fn take<const N: usize>(bytes: &[u8], n: usize) -> Result<[u8; N], HandshakeError> {
    bytes
        .get(..n)
        .and_then(|s| s.try_into().ok())
        .ok_or(HandshakeError::Truncated)
}

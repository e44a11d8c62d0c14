//! Tunneling proxy implementation.
//!
//! This module provides:
//! - SOCKS5 and HTTP client front-ends
//! - Relay endpoint selection
//! - Retry with exponential backoff before a tunnel is established
//! - WebSocket relay links and the byte relay between client and relay
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Front-end (SOCKS5 | HTTP) -> TunnelSession -> Relay
//!                                                        |
//!                                          LoadBalancer + RetryPolicy
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{Listener, ListenerConfig, ProxyKind, TunnelConfig, WebSocketConnector};
//!
//! let tunnel = Arc::new(TunnelConfig::new(ProxyKind::Socks5, endpoints));
//! let connector = Arc::new(WebSocketConnector::new(Some(auth)));
//!
//! let config = ListenerConfig::new("0.0.0.0:1080".parse()?);
//! let listener = Arc::new(Listener::bind(config, tunnel, connector).await?);
//! listener.run().await?;
//! ```

pub mod balancer;
pub mod http;
mod listener;
pub mod protocol;
pub mod relay;
pub mod retry;
mod session;
pub mod socks5;

pub use balancer::{BalancerError, LoadBalancer, RelayEndpoint, RoundRobinCursor, Strategy};
pub use listener::{Listener, ListenerConfig, ListenerStats};
pub use protocol::ProxyKind;
pub use relay::{RelayConnector, RelayError, RelayLink, WebSocketConnector};
pub use retry::RetryPolicy;
pub use session::{SessionOutcome, TunnelConfig, TunnelSession};
pub use socks5::HandshakeError;

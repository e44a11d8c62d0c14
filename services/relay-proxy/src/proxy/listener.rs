//! TCP listener and connection handling.
//!
//! Accepts client connections, runs the protocol front-end for the
//! configured [`ProxyKind`] and hands each resolved target to a
//! [`TunnelSession`]. Every connection runs in its own task; a failing
//! session is logged and never affects the accept loop.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, Instrument};

use super::http;
use super::protocol::ProxyKind;
use super::relay::RelayConnector;
use super::session::{SessionOutcome, TunnelConfig, TunnelSession};
use super::socks5;

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
}

impl ListenerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self { bind_addr }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently being served.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Clients dropped during the protocol handshake.
    pub handshake_failures: AtomicU64,
    /// Sessions that established a relay tunnel.
    pub tunnels_opened: AtomicU64,
    /// Sessions that ended without a tunnel.
    pub tunnels_failed: AtomicU64,
    /// Bytes forwarded to relays.
    pub bytes_to_relay: AtomicU64,
    /// Bytes forwarded from relays.
    pub bytes_from_relay: AtomicU64,
}

impl ListenerStats {
    fn record(&self, outcome: &SessionOutcome) {
        match outcome {
            SessionOutcome::Closed {
                to_relay,
                from_relay,
                ..
            } => {
                self.tunnels_opened.fetch_add(1, Ordering::Relaxed);
                self.bytes_to_relay.fetch_add(*to_relay, Ordering::Relaxed);
                self.bytes_from_relay
                    .fetch_add(*from_relay, Ordering::Relaxed);
            }
            SessionOutcome::NoEndpoints
            | SessionOutcome::ClientClosed { .. }
            | SessionOutcome::Failed { .. } => {
                self.tunnels_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// A TCP listener serving one proxy protocol.
pub struct Listener {
    /// The TCP listener.
    listener: TcpListener,
    /// Settings shared by every session.
    tunnel: Arc<TunnelConfig>,
    /// Opens relay links for sessions.
    connector: Arc<dyn RelayConnector>,
    /// Statistics.
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind a new listener.
    pub async fn bind(
        config: ListenerConfig,
        tunnel: Arc<TunnelConfig>,
        connector: Arc<dyn RelayConnector>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            kind = %tunnel.kind,
            endpoints = tunnel.endpoints.len(),
            strategy = %tunnel.strategy,
            "Listener bound"
        );

        Ok(Self {
            listener,
            tunnel,
            connector,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Protocol served by this listener.
    pub fn kind(&self) -> ProxyKind {
        self.tunnel.kind
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Run the listener, accepting and handling connections.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let listener = Arc::clone(&self);
                    let stats = Arc::clone(&self.stats);
                    let span = tracing::info_span!(
                        "connection",
                        peer = %peer_addr,
                        kind = %self.tunnel.kind
                    );

                    tokio::spawn(
                        async move {
                            debug!("Connection accepted");
                            if let Err(e) = listener.handle_connection(stream).await {
                                debug!(error = %e, "Connection error");
                            }

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                        }
                        .instrument(span),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Handle a single connection.
    async fn handle_connection(&self, mut client: TcpStream) -> io::Result<()> {
        let target = match self.tunnel.kind {
            ProxyKind::Socks5 => match socks5::negotiate(&mut client).await {
                Ok(target) => target,
                Err(e) => {
                    self.stats.handshake_failures.fetch_add(1, Ordering::Relaxed);
                    debug!(error = %e, "SOCKS5 handshake failed");
                    let _ = client.shutdown().await;
                    return Ok(());
                }
            },
            ProxyKind::Http => match http::sniff(&mut client).await? {
                Some(target) => target,
                None => {
                    debug!("Client closed before sending a request");
                    return Ok(());
                }
            },
        };

        let session = TunnelSession::new(
            client,
            target,
            Arc::clone(&self.tunnel),
            Arc::clone(&self.connector),
        );
        let outcome = session.run().await;

        self.stats.record(&outcome);
        debug!(?outcome, "Session finished");

        Ok(())
    }
}

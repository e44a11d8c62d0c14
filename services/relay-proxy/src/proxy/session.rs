//! Tunnel sessions.
//!
//! One session per client connection. A session:
//! 1. picks a relay endpoint and opens a relay link, retrying with backoff
//!    while no link has been established yet
//! 2. acknowledges the tunnel to the client in its own protocol
//! 3. copies bytes in both directions until either side closes
//!
//! A link that fails after it was established is never retried. Client
//! bytes received while connecting are held and forwarded, in order, once
//! the tunnel is up. A client that goes away while connecting ends the
//! session immediately.

use std::future::Future;
use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, warn};

use super::balancer::{LoadBalancer, RelayEndpoint, RoundRobinCursor, Strategy};
use super::protocol::ProxyKind;
use super::relay::{RelayConnector, RelayError, RelayLink};
use super::retry::RetryPolicy;

/// Read buffer size for the relay loop.
pub const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Client bytes held while the relay link is being established.
pub const MAX_PENDING_BYTES: usize = 64 * 1024;

/// Settings shared by every session of a listener.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Client protocol, selects the acknowledgment bytes.
    pub kind: ProxyKind,
    /// Relay endpoints, fixed at startup.
    pub endpoints: Arc<[RelayEndpoint]>,
    /// Endpoint selection strategy.
    pub strategy: Strategy,
    /// Round-robin position shared by all sessions.
    pub cursor: Arc<RoundRobinCursor>,
    /// Retry policy for relay connection attempts.
    pub retry: RetryPolicy,
}

impl TunnelConfig {
    pub fn new(kind: ProxyKind, endpoints: Vec<RelayEndpoint>) -> Self {
        Self {
            kind,
            endpoints: endpoints.into(),
            strategy: Strategy::default(),
            cursor: Arc::new(RoundRobinCursor::new()),
            retry: RetryPolicy::default(),
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// No relay endpoints configured; no attempt was made.
    NoEndpoints,
    /// The client went away before a tunnel was established.
    ClientClosed { attempts: u32 },
    /// Every relay attempt failed.
    Failed {
        attempts: u32,
        /// Whether a failure acknowledgment reached the client.
        acknowledged: bool,
    },
    /// A tunnel was established and has now closed.
    Closed {
        attempts: u32,
        to_relay: u64,
        from_relay: u64,
        /// Whether a failure acknowledgment was sent on close.
        acknowledged_failure: bool,
    },
}

impl SessionOutcome {
    /// True if a relay link was established.
    pub fn opened(&self) -> bool {
        matches!(self, SessionOutcome::Closed { .. })
    }
}

/// Something that happened on one side of an open tunnel.
enum TunnelEvent {
    Client(io::Result<usize>),
    Relay(Option<Result<Bytes, RelayError>>),
}

/// One client connection and its relay tunnel.
pub struct TunnelSession<S> {
    client: S,
    target: String,
    config: Arc<TunnelConfig>,
    connector: Arc<dyn RelayConnector>,
    attempts: u32,
    pending: BytesMut,
}

impl<S> TunnelSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        client: S,
        target: String,
        config: Arc<TunnelConfig>,
        connector: Arc<dyn RelayConnector>,
    ) -> Self {
        Self {
            client,
            target,
            config,
            connector,
            attempts: 0,
            pending: BytesMut::new(),
        }
    }

    /// Target requested by the client.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Drive the session to completion.
    pub async fn run(mut self) -> SessionOutcome {
        let balancer = match LoadBalancer::new(
            Arc::clone(&self.config.endpoints),
            self.config.strategy,
            Arc::clone(&self.config.cursor),
        ) {
            Ok(balancer) => balancer,
            Err(e) => {
                error!(error = %e, "Cannot connect");
                self.shutdown_client().await;
                return SessionOutcome::NoEndpoints;
            }
        };

        match self.establish(&balancer).await {
            Ok(link) => self.relay(link).await,
            Err(outcome) => outcome,
        }
    }

    /// Open a relay link, retrying per policy.
    async fn establish(&mut self, balancer: &LoadBalancer) -> Result<RelayLink, SessionOutcome> {
        loop {
            self.attempts += 1;
            let attempt = self.attempts;
            let endpoint = balancer.select_endpoint();

            info!(
                proxy_target = %self.target,
                endpoint = %endpoint,
                attempt,
                "Proxying connection"
            );

            let connector = Arc::clone(&self.connector);
            let target = self.target.clone();
            let connect = async move { connector.connect(&endpoint, &target).await };

            let err = match watch_client(&mut self.client, &mut self.pending, connect).await {
                Some(Ok(link)) => return Ok(link),
                Some(Err(e)) => e,
                None => {
                    debug!(attempt, "Client closed while connecting to relay");
                    return Err(SessionOutcome::ClientClosed { attempts: attempt });
                }
            };

            warn!(attempt, error = %err, "Relay connection attempt failed");

            match self.config.retry.next_delay(attempt) {
                Some(delay) => {
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying relay connection"
                    );
                    let wait = tokio::time::sleep(delay);
                    if watch_client(&mut self.client, &mut self.pending, wait)
                        .await
                        .is_none()
                    {
                        debug!(attempt, "Client closed during backoff");
                        return Err(SessionOutcome::ClientClosed { attempts: attempt });
                    }
                }
                None => {
                    if self.config.retry.enabled {
                        error!(
                            retries = attempt - 1,
                            error = %err,
                            "Relay connection failed after retries"
                        );
                    }

                    let acknowledged = if err.is_upgrade_failure() {
                        self.acknowledge_failure().await
                    } else {
                        false
                    };
                    self.shutdown_client().await;

                    return Err(SessionOutcome::Failed {
                        attempts: attempt,
                        acknowledged,
                    });
                }
            }
        }
    }

    /// Relay bytes between the client and an established link.
    async fn relay(mut self, mut link: RelayLink) -> SessionOutcome {
        let attempts = self.attempts;
        let mut to_relay = 0u64;
        let mut from_relay = 0u64;
        let mut acknowledged_failure = false;

        debug!(proxy_target = %self.target, "Relay tunnel opened");

        if let Err(e) = self.client.write_all(self.config.kind.success_ack()).await {
            debug!(error = %e, "Client gone before acknowledgment");
            link.close().await;
            return SessionOutcome::Closed {
                attempts,
                to_relay,
                from_relay,
                acknowledged_failure,
            };
        }

        if !self.pending.is_empty() {
            let early = self.pending.split().freeze();
            let len = early.len() as u64;
            if let Err(e) = link.send(early).await {
                debug!(error = %e, "Relay send failed");
                self.shutdown_client().await;
                return SessionOutcome::Closed {
                    attempts,
                    to_relay,
                    from_relay,
                    acknowledged_failure,
                };
            }
            to_relay += len;
        }

        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

        loop {
            let event = tokio::select! {
                read = self.client.read(&mut buf) => TunnelEvent::Client(read),
                frame = link.recv() => TunnelEvent::Relay(frame),
            };

            match event {
                TunnelEvent::Client(Ok(0)) => {
                    debug!("Client closed");
                    link.close().await;
                    break;
                }
                TunnelEvent::Client(Ok(n)) => {
                    if let Err(e) = link.send(Bytes::copy_from_slice(&buf[..n])).await {
                        debug!(error = %e, "Relay send failed");
                        self.shutdown_client().await;
                        break;
                    }
                    to_relay += n as u64;
                }
                TunnelEvent::Client(Err(e)) => {
                    debug!(error = %e, "Client read failed");
                    link.close().await;
                    break;
                }
                TunnelEvent::Relay(Some(Ok(data))) => {
                    if data.is_empty() {
                        continue;
                    }
                    if let Err(e) = self.client.write_all(&data).await {
                        debug!(error = %e, "Client write failed");
                        link.close().await;
                        break;
                    }
                    from_relay += data.len() as u64;
                }
                TunnelEvent::Relay(Some(Err(e))) => {
                    warn!(error = %e, "Relay tunnel failed");
                    if e.is_upgrade_failure() {
                        acknowledged_failure = self.acknowledge_failure().await;
                    }
                    self.shutdown_client().await;
                    break;
                }
                TunnelEvent::Relay(None) => {
                    debug!("Relay closed");
                    self.shutdown_client().await;
                    break;
                }
            }
        }

        debug!(to_relay, from_relay, "Tunnel closed");

        SessionOutcome::Closed {
            attempts,
            to_relay,
            from_relay,
            acknowledged_failure,
        }
    }

    /// Send the protocol's failure acknowledgment. Returns whether it was written.
    async fn acknowledge_failure(&mut self) -> bool {
        error!(proxy_target = %self.target, "Relay connection failed");
        match self.client.write_all(self.config.kind.failure_ack()).await {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "Could not deliver failure acknowledgment");
                false
            }
        }
    }

    async fn shutdown_client(&mut self) {
        let _ = self.client.shutdown().await;
    }
}

/// Wait for `fut` while watching the client for EOF.
///
/// Client bytes that arrive meanwhile go into `pending`. Returns `None` if
/// the client closed or failed first; `fut` is dropped in that case.
async fn watch_client<S, F>(client: &mut S, pending: &mut BytesMut, fut: F) -> Option<F::Output>
where
    S: AsyncRead + Unpin,
    F: Future,
{
    tokio::pin!(fut);
    let mut buf = [0u8; 4096];

    loop {
        let read = tokio::select! {
            biased;
            out = &mut fut => return Some(out),
            read = client.read(&mut buf), if pending.len() < MAX_PENDING_BYTES => read,
        };

        match read {
            Ok(0) | Err(_) => return None,
            Ok(n) => pending.extend_from_slice(&buf[..n]),
        }
    }
}

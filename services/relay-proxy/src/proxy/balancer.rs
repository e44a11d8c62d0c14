//! Relay endpoint selection.
//!
//! The endpoint list is fixed at startup. Sessions select independently and
//! no health state is remembered across sessions. The only state shared
//! between sessions is the round-robin cursor, which lives in its own
//! [`RoundRobinCursor`] so it can be handed to every session.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;
use thiserror::Error;

/// Name of a remote relay (a hostname, optionally with a ws/wss scheme).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelayEndpoint(Arc<str>);

impl RelayEndpoint {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// WebSocket URL for this endpoint. Bare hostnames use `wss://`.
    pub fn url(&self) -> String {
        if self.0.starts_with("ws://") || self.0.starts_with("wss://") {
            self.0.to_string()
        } else {
            format!("wss://{}", self.0)
        }
    }
}

impl fmt::Display for RelayEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RelayEndpoint {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Endpoint selection strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Strategy {
    /// Uniform random pick on every selection.
    #[default]
    Random,
    /// Process-wide rotation through the endpoint list.
    RoundRobin,
}

impl Strategy {
    /// Parse a configured strategy name. Unknown names fall back to random.
    pub fn from_name(name: &str) -> Self {
        name.parse().unwrap_or_default()
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "random" => Ok(Strategy::Random),
            "round-robin" | "round_robin" | "roundrobin" => Ok(Strategy::RoundRobin),
            other => Err(format!("unknown load balancing strategy: {other}")),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Random => f.write_str("random"),
            Strategy::RoundRobin => f.write_str("round-robin"),
        }
    }
}

/// Load balancer errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BalancerError {
    /// The endpoint list is empty.
    #[error("no relay endpoints configured")]
    NoEndpoints,
}

/// Shared round-robin position.
///
/// The cursor always stays in `0..len`; every selection reads and advances it
/// in one atomic step, so concurrent sessions never observe the same index
/// before an increment.
#[derive(Debug, Default)]
pub struct RoundRobinCursor {
    next: AtomicUsize,
}

impl RoundRobinCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current position.
    pub fn position(&self) -> usize {
        self.next.load(Ordering::Acquire)
    }

    /// Return the current index and advance modulo `len`.
    fn advance(&self, len: usize) -> usize {
        // The closure always returns Some, so both arms carry the old value.
        match self
            .next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |i| Some((i % len + 1) % len))
        {
            Ok(prev) | Err(prev) => prev % len,
        }
    }
}

/// Endpoint selector over a non-empty endpoint list.
#[derive(Debug, Clone)]
pub struct LoadBalancer {
    endpoints: Arc<[RelayEndpoint]>,
    strategy: Strategy,
    cursor: Arc<RoundRobinCursor>,
}

impl LoadBalancer {
    /// Create a balancer. Fails if `endpoints` is empty.
    pub fn new(
        endpoints: Arc<[RelayEndpoint]>,
        strategy: Strategy,
        cursor: Arc<RoundRobinCursor>,
    ) -> Result<Self, BalancerError> {
        if endpoints.is_empty() {
            return Err(BalancerError::NoEndpoints);
        }

        Ok(Self {
            endpoints,
            strategy,
            cursor,
        })
    }

    /// Number of endpoints.
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Always false; construction rejects an empty list.
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Pick the endpoint for the next relay attempt.
    pub fn select_endpoint(&self) -> RelayEndpoint {
        let n = self.endpoints.len();
        let idx = match self.strategy {
            Strategy::RoundRobin => self.cursor.advance(n),
            Strategy::Random => rand::rng().random_range(0..n),
        };
        self.endpoints[idx].clone()
    }
}

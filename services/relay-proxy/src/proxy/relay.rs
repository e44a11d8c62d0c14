//! Relay transport.
//!
//! A relay is reached over a WebSocket. The target address and credential
//! travel as upgrade request headers; after the upgrade the socket carries
//! raw tunnel bytes in binary messages.
//!
//! [`RelayConnector`] is the seam between the session logic and the wire:
//! sessions only see a [`RelayLink`], a byte sink plus a byte stream.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderName, HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::debug;

use super::balancer::RelayEndpoint;

/// Header carrying the requested target to the relay.
pub const TARGET_HEADER: &str = "x-proxy-target";

/// Close reason that marks a rejected upgrade.
pub const UPGRADE_FAILURE_REASON: &str = "Expected 101 status code";

/// Relay transport errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    /// The relay answered the upgrade with something other than 101.
    #[error("relay rejected upgrade: {0}")]
    UpgradeRejected(String),

    /// The upgrade request could not be built (bad URL or header value).
    #[error("invalid relay request: {0}")]
    Request(String),

    /// Network, TLS or protocol failure before the upgrade completed.
    #[error("relay connect failed: {0}")]
    Connect(String),

    /// Failure on an established relay transport.
    #[error("relay transport error: {0}")]
    Transport(String),
}

impl RelayError {
    /// True when the failure is a rejected upgrade handshake.
    pub fn is_upgrade_failure(&self) -> bool {
        matches!(self, RelayError::UpgradeRejected(_))
    }

    /// Map a close frame reason; only the upgrade marker is an error.
    pub fn from_close_reason(reason: &str) -> Option<Self> {
        (reason == UPGRADE_FAILURE_REASON)
            .then(|| RelayError::UpgradeRejected(reason.to_string()))
    }

    fn from_handshake(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(response) => {
                RelayError::UpgradeRejected(format!("{}", response.status()))
            }
            tungstenite::Error::Url(e) => RelayError::Request(e.to_string()),
            other => RelayError::Connect(other.to_string()),
        }
    }
}

type ByteSink = Pin<Box<dyn Sink<Bytes, Error = RelayError> + Send>>;
type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, RelayError>> + Send>>;

/// An open relay transport.
///
/// The stream ends (`None`) when the relay closes normally.
pub struct RelayLink {
    sink: ByteSink,
    stream: ByteStream,
}

impl RelayLink {
    /// Build a link from any byte sink and stream.
    pub fn new<Si, St>(sink: Si, stream: St) -> Self
    where
        Si: Sink<Bytes, Error = RelayError> + Send + 'static,
        St: Stream<Item = Result<Bytes, RelayError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }

    /// Wrap an upgraded WebSocket.
    pub fn from_websocket<S>(ws: tokio_tungstenite::WebSocketStream<S>) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (write, read) = ws.split();

        let sink = write
            .sink_map_err(|e| RelayError::Transport(e.to_string()))
            .with(|data: Bytes| future::ready(Ok::<_, RelayError>(Message::Binary(data))));

        let stream = read.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Binary(data)) => Some(Ok(data)),
                Ok(Message::Text(text)) => Some(Ok(Bytes::copy_from_slice(text.as_bytes()))),
                Ok(Message::Close(frame)) => close_error(frame.as_ref()).map(Err),
                // Control frames are answered by tungstenite itself.
                Ok(_) => None,
                Err(e) => Some(Err(RelayError::Transport(e.to_string()))),
            })
        });

        Self::new(sink, stream)
    }

    /// Forward one chunk to the relay.
    pub async fn send(&mut self, data: Bytes) -> Result<(), RelayError> {
        self.sink.send(data).await
    }

    /// Next chunk from the relay; `None` once the relay has closed.
    pub async fn recv(&mut self) -> Option<Result<Bytes, RelayError>> {
        self.stream.next().await
    }

    /// Close the relay side. Errors are ignored; the link is done either way.
    pub async fn close(&mut self) {
        let _ = self.sink.close().await;
    }
}

fn close_error(frame: Option<&CloseFrame>) -> Option<RelayError> {
    let frame = frame?;
    debug!(code = ?frame.code, reason = %frame.reason, "Relay sent close frame");
    RelayError::from_close_reason(&frame.reason)
}

/// Opens relay transports for tunnel sessions.
#[async_trait]
pub trait RelayConnector: Send + Sync + 'static {
    /// Open a transport to `endpoint` that will tunnel to `target`.
    ///
    /// Resolves once the relay handshake has completed.
    async fn connect(&self, endpoint: &RelayEndpoint, target: &str)
        -> Result<RelayLink, RelayError>;
}

/// Connects to relays over `wss://` (or `ws://` when the endpoint says so).
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector {
    authorization: Option<String>,
}

impl WebSocketConnector {
    pub fn new(authorization: Option<String>) -> Self {
        Self { authorization }
    }
}

#[async_trait]
impl RelayConnector for WebSocketConnector {
    async fn connect(
        &self,
        endpoint: &RelayEndpoint,
        target: &str,
    ) -> Result<RelayLink, RelayError> {
        let mut request = endpoint
            .url()
            .into_client_request()
            .map_err(RelayError::from_handshake)?;

        let headers = request.headers_mut();
        if let Some(auth) = &self.authorization {
            let value =
                HeaderValue::from_str(auth).map_err(|e| RelayError::Request(e.to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }
        let value = HeaderValue::from_str(target).map_err(|e| RelayError::Request(e.to_string()))?;
        headers.insert(HeaderName::from_static(TARGET_HEADER), value);

        let (ws, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(RelayError::from_handshake)?;

        debug!(endpoint = %endpoint, status = %response.status(), "Relay upgrade complete");
        Ok(RelayLink::from_websocket(ws))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upgrade_failure_classification() {
        assert!(RelayError::UpgradeRejected("401 Unauthorized".into()).is_upgrade_failure());
        assert!(!RelayError::Connect("connection refused".into()).is_upgrade_failure());
        assert!(!RelayError::Transport("reset".into()).is_upgrade_failure());
    }

    #[test]
    fn test_close_reason_mapping() {
        assert_eq!(
            RelayError::from_close_reason("Expected 101 status code"),
            Some(RelayError::UpgradeRejected(
                "Expected 101 status code".to_string()
            ))
        );
        assert_eq!(RelayError::from_close_reason("going away"), None);
        assert_eq!(RelayError::from_close_reason(""), None);
    }

    #[tokio::test]
    async fn test_invalid_target_header_is_request_error() {
        let connector = WebSocketConnector::new(None);
        let err = connector
            .connect(&RelayEndpoint::from("ws://127.0.0.1:9"), "bad\r\nvalue")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RelayError::Request(_)));
    }
}


use std::sync::Arc;
use std::time::Duration;

use harness::{make_tunnel, ScriptedConnector, Step};
use relay_proxy::proxy::protocol::{
    HTTP_FAILURE, HTTP_SUCCESS, SOCKS5_GENERAL_FAILURE, SOCKS5_SUCCESS,
};
use relay_proxy::proxy::{ProxyKind, RelayError, RetryPolicy, SessionOutcome, Strategy, TunnelSession};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

const TARGET: &str = "example.com:443";

fn upgrade_rejected() -> RelayError {
    RelayError::UpgradeRejected("401 Unauthorized".into())
}

fn refused() -> RelayError {
    RelayError::Connect("connection refused".into())
}

fn spawn_session(
    kind: ProxyKind,
    endpoints: &[&str],
    strategy: Strategy,
    retry: RetryPolicy,
    connector: Arc<ScriptedConnector>,
) -> (DuplexStream, JoinHandle<SessionOutcome>) {
    let (client, proxy_side) = tokio::io::duplex(64 * 1024);
    let tunnel = Arc::new(make_tunnel(kind, endpoints, strategy, retry));
    let session = TunnelSession::new(proxy_side, TARGET.to_string(), tunnel, connector);
    (client, tokio::spawn(session.run()))
}

async fn read_all(client: &mut DuplexStream) -> Vec<u8> {
    let mut data = Vec::new();
    client.read_to_end(&mut data).await.unwrap();
    data
}

#[tokio::test(start_paused = true)]
async fn retries_with_exponential_backoff_until_open() {
    let (connector, mut peers) =
        ScriptedConnector::new([Step::Fail(refused()), Step::Fail(refused()), Step::Open]);
    let (mut client, session) = spawn_session(
        ProxyKind::Socks5,
        &["relay.example"],
        Strategy::Random,
        RetryPolicy::default(),
        Arc::clone(&connector),
    );

    let peer = peers.recv().await.unwrap();
    assert_eq!(peer.target, TARGET);

    let mut ack = [0u8; 10];
    client.read_exact(&mut ack).await.unwrap();
    assert_eq!(ack, SOCKS5_SUCCESS);

    drop(client);
    let outcome = session.await.unwrap();

    assert!(matches!(outcome, SessionOutcome::Closed { attempts: 3, .. }));
    assert_eq!(connector.gaps_ms(), vec![1000, 2000]);
}

#[tokio::test(start_paused = true)]
async fn exhausted_upgrade_failures_send_one_failure_ack() {
    let (connector, _peers) =
        ScriptedConnector::new(std::iter::repeat_n(Step::Fail(upgrade_rejected()), 10));
    let (mut client, session) = spawn_session(
        ProxyKind::Socks5,
        &["relay.example"],
        Strategy::Random,
        RetryPolicy::default(),
        Arc::clone(&connector),
    );

    assert_eq!(read_all(&mut client).await, SOCKS5_GENERAL_FAILURE);

    let outcome = session.await.unwrap();
    assert_eq!(
        outcome,
        SessionOutcome::Failed {
            attempts: 6,
            acknowledged: true
        }
    );
    assert_eq!(connector.attempt_count(), 6);
    assert_eq!(connector.gaps_ms(), vec![1000, 2000, 4000, 8000, 16000]);
}

#[tokio::test(start_paused = true)]
async fn exhausted_http_upgrade_failures_send_500() {
    let retry = RetryPolicy {
        max_retries: 1,
        ..RetryPolicy::default()
    };
    let (connector, _peers) = ScriptedConnector::new([
        Step::Fail(upgrade_rejected()),
        Step::Fail(upgrade_rejected()),
    ]);
    let (mut client, session) = spawn_session(
        ProxyKind::Http,
        &["relay.example"],
        Strategy::Random,
        retry,
        Arc::clone(&connector),
    );

    assert_eq!(read_all(&mut client).await, HTTP_FAILURE);
    assert!(matches!(
        session.await.unwrap(),
        SessionOutcome::Failed { attempts: 2, .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn exhausted_connect_failures_close_silently() {
    let retry = RetryPolicy {
        max_retries: 2,
        ..RetryPolicy::default()
    };
    let (connector, _peers) = ScriptedConnector::new(Vec::new());
    let (mut client, session) = spawn_session(
        ProxyKind::Http,
        &["relay.example"],
        Strategy::Random,
        retry,
        Arc::clone(&connector),
    );

    assert!(read_all(&mut client).await.is_empty());
    assert_eq!(
        session.await.unwrap(),
        SessionOutcome::Failed {
            attempts: 3,
            acknowledged: false
        }
    );
}

#[tokio::test(start_paused = true)]
async fn disabled_retry_makes_exactly_one_attempt() {
    let retry = RetryPolicy {
        max_retries: 100,
        ..RetryPolicy::disabled()
    };
    let (connector, _peers) = ScriptedConnector::new([Step::Fail(upgrade_rejected()), Step::Open]);
    let (mut client, session) = spawn_session(
        ProxyKind::Socks5,
        &["relay.example"],
        Strategy::Random,
        retry,
        Arc::clone(&connector),
    );

    assert_eq!(read_all(&mut client).await, SOCKS5_GENERAL_FAILURE);
    assert_eq!(
        session.await.unwrap(),
        SessionOutcome::Failed {
            attempts: 1,
            acknowledged: true
        }
    );
    assert_eq!(connector.attempt_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn empty_endpoint_list_closes_without_attempts() {
    let (connector, _peers) = ScriptedConnector::new([Step::Open]);
    let (mut client, session) = spawn_session(
        ProxyKind::Socks5,
        &[],
        Strategy::RoundRobin,
        RetryPolicy::default(),
        Arc::clone(&connector),
    );

    assert!(read_all(&mut client).await.is_empty());
    assert_eq!(session.await.unwrap(), SessionOutcome::NoEndpoints);
    assert_eq!(connector.attempt_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn open_tunnel_is_never_retried() {
    let (connector, mut peers) = ScriptedConnector::new([Step::Open, Step::Open]);
    let (mut client, session) = spawn_session(
        ProxyKind::Http,
        &["relay.example"],
        Strategy::Random,
        RetryPolicy::default(),
        Arc::clone(&connector),
    );

    let peer = peers.recv().await.unwrap();
    peer.fail(RelayError::Transport("connection reset".into())).await;

    assert_eq!(read_all(&mut client).await, HTTP_SUCCESS);
    assert!(matches!(
        session.await.unwrap(),
        SessionOutcome::Closed {
            attempts: 1,
            acknowledged_failure: false,
            ..
        }
    ));
    assert_eq!(connector.attempt_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn relay_close_after_open_ends_session() {
    let (connector, mut peers) = ScriptedConnector::new([Step::Open]);
    let (mut client, session) = spawn_session(
        ProxyKind::Socks5,
        &["relay.example"],
        Strategy::Random,
        RetryPolicy::default(),
        Arc::clone(&connector),
    );

    let peer = peers.recv().await.unwrap();
    peer.send(b"bye").await;
    drop(peer);

    let mut expected = SOCKS5_SUCCESS.to_vec();
    expected.extend_from_slice(b"bye");
    assert_eq!(read_all(&mut client).await, expected);

    assert_eq!(
        session.await.unwrap(),
        SessionOutcome::Closed {
            attempts: 1,
            to_relay: 0,
            from_relay: 3,
            acknowledged_failure: false
        }
    );
}

#[tokio::test(start_paused = true)]
async fn upgrade_failure_after_open_sends_failure_ack() {
    let (connector, mut peers) = ScriptedConnector::new([Step::Open]);
    let (mut client, session) = spawn_session(
        ProxyKind::Http,
        &["relay.example"],
        Strategy::Random,
        RetryPolicy::default(),
        Arc::clone(&connector),
    );

    let peer = peers.recv().await.unwrap();
    peer.fail(RelayError::UpgradeRejected("Expected 101 status code".into()))
        .await;

    let mut expected = HTTP_SUCCESS.to_vec();
    expected.extend_from_slice(HTTP_FAILURE);
    assert_eq!(read_all(&mut client).await, expected);

    assert!(matches!(
        session.await.unwrap(),
        SessionOutcome::Closed {
            attempts: 1,
            acknowledged_failure: true,
            ..
        }
    ));
    assert_eq!(connector.attempt_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn bytes_relay_unmodified_in_both_directions() {
    let (connector, mut peers) = ScriptedConnector::new([Step::Open]);
    let (mut client, session) = spawn_session(
        ProxyKind::Http,
        &["relay.example"],
        Strategy::Random,
        RetryPolicy::default(),
        Arc::clone(&connector),
    );

    let mut peer = peers.recv().await.unwrap();
    let mut ack = vec![0u8; HTTP_SUCCESS.len()];
    client.read_exact(&mut ack).await.unwrap();
    assert_eq!(ack, HTTP_SUCCESS);

    // Client to relay: a small chunk, then a full relay buffer.
    let large: Vec<u8> = (0..16 * 1024).map(|i| (i % 251) as u8).collect();
    client.write_all(b"\x00\x01ping").await.unwrap();
    assert_eq!(peer.recv_exact(6).await, b"\x00\x01ping");
    client.write_all(&large).await.unwrap();
    assert_eq!(peer.recv_exact(large.len()).await, large);

    // Relay to client, including an empty frame.
    peer.send(b"").await;
    peer.send(&large).await;
    peer.send(b"pong").await;

    let mut back = vec![0u8; large.len() + 4];
    client.read_exact(&mut back).await.unwrap();
    assert_eq!(&back[..large.len()], &large[..]);
    assert_eq!(&back[large.len()..], b"pong");

    drop(client);
    assert!(peer.recv().await.is_none());

    assert_eq!(
        session.await.unwrap(),
        SessionOutcome::Closed {
            attempts: 1,
            to_relay: 6 + large.len() as u64,
            from_relay: 4 + large.len() as u64,
            acknowledged_failure: false
        }
    );
}

#[tokio::test(start_paused = true)]
async fn early_client_bytes_are_forwarded_after_open() {
    let (connector, mut peers) = ScriptedConnector::new([Step::Fail(refused()), Step::Open]);
    let (mut client, session) = spawn_session(
        ProxyKind::Http,
        &["relay.example"],
        Strategy::Random,
        RetryPolicy::default(),
        Arc::clone(&connector),
    );

    // Lands while the session waits out the first backoff.
    client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

    let mut peer = peers.recv().await.unwrap();
    assert_eq!(peer.recv_exact(18).await, b"GET / HTTP/1.1\r\n\r\n");

    let mut ack = vec![0u8; HTTP_SUCCESS.len()];
    client.read_exact(&mut ack).await.unwrap();
    assert_eq!(ack, HTTP_SUCCESS);

    drop(client);
    assert!(matches!(
        session.await.unwrap(),
        SessionOutcome::Closed {
            attempts: 2,
            to_relay: 18,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn client_closing_during_backoff_stops_retries() {
    let (connector, _peers) = ScriptedConnector::new([Step::Fail(refused()), Step::Open]);
    let (client, session) = spawn_session(
        ProxyKind::Socks5,
        &["relay.example"],
        Strategy::Random,
        RetryPolicy::default(),
        Arc::clone(&connector),
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(client);

    assert_eq!(
        session.await.unwrap(),
        SessionOutcome::ClientClosed { attempts: 1 }
    );
    assert_eq!(connector.attempt_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn round_robin_advances_on_every_attempt() {
    let (connector, mut peers) = ScriptedConnector::new([
        Step::Fail(refused()),
        Step::Fail(refused()),
        Step::Fail(refused()),
        Step::Open,
    ]);
    let (client, session) = spawn_session(
        ProxyKind::Socks5,
        &["a.example", "b.example", "c.example"],
        Strategy::RoundRobin,
        RetryPolicy::default(),
        Arc::clone(&connector),
    );

    let _peer = peers.recv().await.unwrap();
    drop(client);
    session.await.unwrap();

    let endpoints: Vec<String> = connector
        .attempts()
        .into_iter()
        .map(|a| a.endpoint)
        .collect();
    assert_eq!(endpoints, vec!["a.example", "b.example", "c.example", "a.example"]);
    assert!(connector.attempts().iter().all(|a| a.target == TARGET));
}

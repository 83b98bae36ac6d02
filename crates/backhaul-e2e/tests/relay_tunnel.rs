//! Relay end-to-end tests: public port -> session -> local service

use std::time::Duration;

use backhaul_e2e::{wait_until, ServiceBehavior, TestLocalService, TestRelayHost, TestTunnel};
use backhaul_relay::{RelayOptions, ServeOptions, SessionError, SessionLifecycle, SessionState, TransportError};
use futures_util::future::join_all;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const WAIT: Duration = Duration::from_secs(5);

fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("backhaul_relay=debug,backhaul_e2e=debug")
        .with_test_writer()
        .try_init();
}

/// Port with nothing listening on it
async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Expect the peer to close: EOF or a reset both count
async fn expect_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(WAIT, stream.read(&mut buf))
        .await
        .expect("Stream was not closed in time");
    if let Ok(n) = read {
        assert_eq!(n, 0, "Unexpected data: {:?}", &buf[..n]);
    }
}

/// Send `payload` with a concurrent writer and collect everything echoed back
async fn echo_round_trip(host: &TestRelayHost, payload: Vec<u8>) -> Vec<u8> {
    let stream = TcpStream::connect(host.public_addr()).await.unwrap();
    let (mut reader, mut writer) = stream.into_split();

    let write = tokio::spawn(async move {
        writer.write_all(&payload).await.unwrap();
        writer.shutdown().await.unwrap();
    });

    let mut echoed = Vec::new();
    tokio::time::timeout(WAIT, reader.read_to_end(&mut echoed))
        .await
        .expect("Echo timed out")
        .unwrap();
    write.await.unwrap();
    echoed
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i * 31) as u8).wrapping_add(seed))
        .collect()
}

#[tokio::test]
async fn test_ping_pong() {
    init_test();

    let service = TestLocalService::start_with(ServiceBehavior::Reply(b"PONG".to_vec())).await;
    let host = TestRelayHost::start().await;
    let tunnel = TestTunnel::start(&host, service.port(), ServeOptions::default()).await;
    assert_eq!(tunnel.state(), SessionState::Serving);

    let mut client = TcpStream::connect(host.public_addr()).await.unwrap();
    client.write_all(b"PING").await.unwrap();

    let mut buf = [0u8; 4];
    tokio::time::timeout(WAIT, client.read_exact(&mut buf))
        .await
        .expect("No reply")
        .unwrap();
    assert_eq!(&buf, b"PONG");

    // Service closes after replying; the close reaches the client
    expect_closed(&mut client).await;
    drop(client);

    assert!(wait_until(WAIT, || tunnel.metrics.active_pairs() == 0).await);
    let served = service.served();
    assert_eq!(served.len(), 1);
    assert_eq!(served[0].received, b"PING");
}

#[tokio::test]
async fn test_local_service_down_closes_remote() {
    init_test();

    let host = TestRelayHost::start().await;
    let tunnel = TestTunnel::start(&host, unused_port().await, ServeOptions::default()).await;

    for _ in 0..2 {
        let mut client = TcpStream::connect(host.public_addr()).await.unwrap();
        expect_closed(&mut client).await;
    }

    assert!(wait_until(WAIT, || tunnel.metrics.snapshot().dial_failures == 2).await);
    assert!(wait_until(WAIT, || tunnel.metrics.active_pairs() == 0).await);
    assert_eq!(tunnel.state(), SessionState::Serving);
}

#[tokio::test]
async fn test_transport_termination_leaves_pairs_draining() {
    init_test();

    let service = TestLocalService::start().await;
    let host = TestRelayHost::start().await;
    let tunnel = TestTunnel::start(&host, service.port(), ServeOptions::default()).await;
    let mut states = tunnel.states.clone();

    let mut client = TcpStream::connect(host.public_addr()).await.unwrap();
    client.write_all(b"before").await.unwrap();
    let mut buf = [0u8; 6];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"before");

    host.terminate().await;

    let result = tokio::time::timeout(WAIT, tunnel.join())
        .await
        .expect("Session did not end");
    assert!(matches!(result, Err(SessionError::ListenerClosed(_))));
    states
        .wait_for(|s| *s == SessionState::Terminated)
        .await
        .unwrap();

    // The pair accepted before termination is independent of the session
    client.write_all(b"after!").await.unwrap();
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"after!");
}

#[tokio::test]
async fn test_byte_fidelity_large_payload() {
    init_test();

    let service = TestLocalService::start().await;
    let host = TestRelayHost::start().await;
    let tunnel = TestTunnel::start(&host, service.port(), ServeOptions::default()).await;

    let payload = pattern(256 * 1024, 7);
    let echoed = echo_round_trip(&host, payload.clone()).await;
    assert_eq!(echoed.len(), payload.len());
    assert_eq!(echoed, payload);

    assert!(wait_until(WAIT, || tunnel.metrics.active_pairs() == 0).await);
    let snapshot = tunnel.metrics.snapshot();
    assert_eq!(snapshot.bytes_remote_to_local, payload.len() as u64);
    assert_eq!(snapshot.bytes_local_to_remote, payload.len() as u64);
}

#[tokio::test]
async fn test_concurrent_connections_do_not_cross_talk() {
    init_test();

    let service = TestLocalService::start().await;
    let host = TestRelayHost::start().await;
    let tunnel = TestTunnel::start(&host, service.port(), ServeOptions::default()).await;

    let payloads: Vec<Vec<u8>> = (0..8u8)
        .map(|i| {
            let mut data = format!("client-{}:", i).into_bytes();
            data.extend(pattern(16 * 1024, i));
            data
        })
        .collect();

    let results = join_all(
        payloads
            .iter()
            .cloned()
            .map(|payload| echo_round_trip(&host, payload)),
    )
    .await;

    for (sent, echoed) in payloads.iter().zip(results) {
        assert_eq!(&echoed, sent);
    }

    assert!(wait_until(WAIT, || tunnel.metrics.active_pairs() == 0).await);
    assert_eq!(tunnel.metrics.snapshot().accepted, 8);
}

#[tokio::test]
async fn test_no_pairs_leak_after_many_connections() {
    init_test();

    let service = TestLocalService::start().await;
    let host = TestRelayHost::start().await;
    let tunnel = TestTunnel::start(&host, service.port(), ServeOptions::default()).await;

    for i in 0..20u8 {
        let echoed = echo_round_trip(&host, vec![i; 64]).await;
        assert_eq!(echoed, vec![i; 64]);
    }

    assert!(wait_until(WAIT, || tunnel.metrics.active_pairs() == 0).await);
    let snapshot = tunnel.metrics.snapshot();
    assert_eq!(snapshot.accepted, 20);
    assert_eq!(snapshot.completed_pairs, 20);
    assert!(wait_until(WAIT, || service.served_count() == 20).await);
}

#[tokio::test]
async fn test_half_close_delivers_trailing_data() {
    init_test();

    let service = TestLocalService::start_with(ServiceBehavior::DelayedTrailer {
        delay: Duration::from_millis(200),
        reply: b"trailer".to_vec(),
    })
    .await;
    let host = TestRelayHost::start().await;
    let _tunnel = TestTunnel::start(&host, service.port(), ServeOptions::default()).await;

    let mut client = TcpStream::connect(host.public_addr()).await.unwrap();
    client.write_all(b"request").await.unwrap();
    client.shutdown().await.unwrap();

    let mut reply = Vec::new();
    tokio::time::timeout(WAIT, client.read_to_end(&mut reply))
        .await
        .expect("Trailer never arrived")
        .unwrap();
    assert_eq!(reply, b"trailer");

    assert!(wait_until(WAIT, || service.served_count() == 1).await);
    assert_eq!(service.served()[0].received, b"request");
}

#[tokio::test]
async fn test_local_close_ends_pair_while_client_stays_open() {
    init_test();

    let service = TestLocalService::start_with(ServiceBehavior::Greet(b"bye".to_vec())).await;
    let host = TestRelayHost::start().await;
    let tunnel = TestTunnel::start(&host, service.port(), ServeOptions::default()).await;

    let mut client = TcpStream::connect(host.public_addr()).await.unwrap();
    let mut greeting = Vec::new();
    tokio::time::timeout(WAIT, client.read_to_end(&mut greeting))
        .await
        .expect("Greeting never arrived")
        .unwrap();
    assert_eq!(greeting, b"bye");

    // The client never closes its side; the pair must still be released
    assert!(wait_until(Duration::from_secs(2), || tunnel.metrics.active_pairs() == 0).await);
    assert_eq!(tunnel.metrics.snapshot().completed_pairs, 1);
    drop(client);
}

#[tokio::test]
async fn test_transient_accept_error_keeps_serving() {
    init_test();

    let service = TestLocalService::start().await;
    let host = TestRelayHost::start().await;
    let tunnel = TestTunnel::start(&host, service.port(), ServeOptions::default()).await;

    host.inject_accept_error("connection reset before accept").await;

    let echoed = echo_round_trip(&host, b"still here".to_vec()).await;
    assert_eq!(echoed, b"still here");

    assert!(wait_until(WAIT, || tunnel.metrics.snapshot().accept_errors == 1).await);
    assert_eq!(tunnel.state(), SessionState::Serving);
}

#[tokio::test]
async fn test_idle_pair_is_closed() {
    init_test();

    let service = TestLocalService::start_with(ServiceBehavior::Drain).await;
    let host = TestRelayHost::start().await;
    let options = ServeOptions {
        relay: RelayOptions {
            idle_timeout: Some(Duration::from_millis(200)),
            ..RelayOptions::default()
        },
        ..ServeOptions::default()
    };
    let tunnel = TestTunnel::start(&host, service.port(), options).await;

    let mut client = TcpStream::connect(host.public_addr()).await.unwrap();
    expect_closed(&mut client).await;

    assert!(wait_until(WAIT, || tunnel.metrics.snapshot().idle_timeouts == 1).await);
}

#[tokio::test]
async fn test_max_connections_applies_backpressure() {
    init_test();

    let service = TestLocalService::start().await;
    let host = TestRelayHost::start().await;
    let options = ServeOptions {
        max_connections: Some(1),
        ..ServeOptions::default()
    };
    let tunnel = TestTunnel::start(&host, service.port(), options).await;

    let mut first = TcpStream::connect(host.public_addr()).await.unwrap();
    first.write_all(b"one").await.unwrap();
    let mut buf = [0u8; 3];
    first.read_exact(&mut buf).await.unwrap();

    // Waits for a free slot instead of being rejected
    let mut second = TcpStream::connect(host.public_addr()).await.unwrap();
    second.write_all(b"two").await.unwrap();
    let early = tokio::time::timeout(Duration::from_millis(300), second.read_exact(&mut buf)).await;
    assert!(early.is_err(), "Second connection was served while the first was active");
    assert_eq!(tunnel.metrics.active_pairs(), 1);

    drop(first);

    tokio::time::timeout(WAIT, second.read_exact(&mut buf))
        .await
        .expect("Second connection never served")
        .unwrap();
    assert_eq!(&buf, b"two");
}

#[tokio::test]
async fn test_shutdown_terminates_session() {
    init_test();

    let service = TestLocalService::start().await;
    let host = TestRelayHost::start().await;
    let tunnel = TestTunnel::start(&host, service.port(), ServeOptions::default()).await;
    let mut states = tunnel.states.clone();

    tunnel.shutdown.cancel();
    let result = tokio::time::timeout(WAIT, tunnel.join())
        .await
        .expect("Session did not stop");
    assert!(result.is_ok());
    states
        .wait_for(|s| *s == SessionState::Terminated)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_refused_listen_terminates_session() {
    init_test();

    let host = TestRelayHost::refusing().await;
    let mut session = SessionLifecycle::new(host.transport());

    let err = session
        .establish("0.0.0.0", host.public_port())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::Transport(TransportError::ListenRefused { .. })
    ));
    assert_eq!(session.state(), SessionState::Terminated);
}

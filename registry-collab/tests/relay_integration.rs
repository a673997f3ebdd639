//! Integration tests for the WebSocket relay.
//!
//! These tests start a real relay and connect real clients, checking both the
//! raw frame fan-out and full editing sessions on top of [`WsTransport`].

use futures_util::{SinkExt, StreamExt};
use registry_collab::{
    document_channel, CollabMessage, CollabSession, ConnectionState, CursorColor, LocalEdit,
    MemoryStore, RelayConfig, RelayFrame, RelayServer, SessionConfig, Transport, WsTransport,
};
use std::sync::Arc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a relay on a free port, return the port.
async fn start_test_relay() -> u16 {
    let port = free_port().await;
    let server = RelayServer::new(RelayConfig::for_testing(port));
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give the relay time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

async fn open_session(site: &str, text: &str, url: &str, store: &MemoryStore) -> CollabSession {
    let transport = WsTransport::connect(url).await.unwrap();
    CollabSession::open_with_text(
        site,
        "relay-doc",
        text,
        Arc::new(transport),
        Arc::new(store.clone()),
        SessionConfig::for_testing(),
    )
    .await
    .unwrap()
}

/// Process incoming messages until `text` shows up or time runs out.
async fn wait_for_text(session: &mut CollabSession, text: &str) {
    let deadline = Duration::from_secs(2);
    let result = timeout(deadline, async {
        while session.text() != text {
            if !session.process_next().await.unwrap() {
                break;
            }
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {text:?}, have {:?}", session.text());
    assert_eq!(session.text(), text);
}

#[tokio::test]
async fn test_relay_accepts_connections() {
    let port = start_test_relay().await;
    let transport = WsTransport::connect(format!("ws://127.0.0.1:{port}")).await.unwrap();
    assert_eq!(transport.connection_state().await, ConnectionState::Connected);
}

#[tokio::test]
async fn test_raw_publish_reaches_subscriber() {
    let port = start_test_relay().await;
    let url = format!("ws://127.0.0.1:{port}");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    let subscribe = RelayFrame::Subscribe {
        channel: "collab:raw".into(),
    };
    ws.send(Message::Binary(subscribe.encode().unwrap().into())).await.unwrap();

    let publish = RelayFrame::Publish {
        channel: "collab:raw".into(),
        payload: vec![1, 2, 3],
    };
    ws.send(Message::Binary(publish.encode().unwrap().into())).await.unwrap();

    let received = timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("relay should echo publish to its subscriber");
    match received {
        Some(Ok(Message::Binary(data))) => {
            let bytes: Vec<u8> = data.into();
            assert_eq!(RelayFrame::decode(&bytes).unwrap(), publish);
        }
        other => panic!("Expected binary frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_channels_are_isolated() {
    let port = start_test_relay().await;
    let url = format!("ws://127.0.0.1:{port}");
    let one = WsTransport::connect(&url).await.unwrap();
    let two = WsTransport::connect(&url).await.unwrap();

    let mut doc_a = two.subscribe(&document_channel("a")).await.unwrap();
    let mut doc_b = two.subscribe(&document_channel("b")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let msg = CollabMessage::CursorUpdate {
        document_id: "b".into(),
        site_id: "one".into(),
        position: 7,
        color: CursorColor::default(),
    };
    one.publish(&document_channel("b"), &msg).await.unwrap();

    let got = timeout(Duration::from_secs(2), doc_b.recv()).await.unwrap();
    assert_eq!(got, Some(msg));
    assert!(doc_a.try_recv().is_none());
}

#[tokio::test]
async fn test_sessions_converge_over_relay() {
    let port = start_test_relay().await;
    let url = format!("ws://127.0.0.1:{port}");
    let store = MemoryStore::new();

    let mut one = open_session("1", "abc", &url, &store).await;
    let mut two = open_session("2", "abc", &url, &store).await;
    // Let both subscriptions reach the relay
    tokio::time::sleep(Duration::from_millis(100)).await;

    one.apply_local(LocalEdit::insert(0, "X")).await.unwrap();
    two.apply_local(LocalEdit::insert(0, "Y")).await.unwrap();

    wait_for_text(&mut one, "XYabc").await;
    wait_for_text(&mut two, "XYabc").await;
}

#[tokio::test]
async fn test_locks_over_relay() {
    let port = start_test_relay().await;
    let url = format!("ws://127.0.0.1:{port}");
    let store = MemoryStore::new();

    let mut alice = open_session("site-alice", "", &url, &store).await;
    let mut bob = open_session("site-bob", "", &url, &store).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(alice.lock_section(0, 10, "alice").await.unwrap());
    assert!(!bob.lock_section(0, 10, "bob").await.unwrap());

    timeout(Duration::from_secs(2), async {
        while bob.section_locks().is_empty() {
            bob.process_next().await.unwrap();
        }
    })
    .await
    .expect("bob should hear about alice's lock");
    assert_eq!(
        bob.section_locks().get(&(0, 10)).map(String::as_str),
        Some("alice")
    );
}

#[tokio::test]
async fn test_relay_stats_track_connections() {
    let port = free_port().await;
    let server = Arc::new(RelayServer::new(RelayConfig::for_testing(port)));
    let runner = server.clone();
    tokio::spawn(async move {
        runner.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let transport = WsTransport::connect(format!("ws://127.0.0.1:{port}")).await.unwrap();
    transport.subscribe("collab:stats").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stats = server.stats().await;
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.active_connections, 1);
    assert_eq!(stats.active_channels, 1);
    assert!(stats.total_frames >= 1);
}

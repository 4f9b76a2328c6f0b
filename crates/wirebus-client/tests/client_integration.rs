//! Integration tests for the client state machine against scripted broker
//! sockets.
//!
//! Each test stands up a bare `TcpListener` that speaks just enough of the
//! protocol for the scenario: acking handshake probes, recording subscribe
//! traffic, echoing heartbeats, or going silent on purpose. This pins down
//! the client-side invariants — announce-once ref-counting, the unverified-
//! broker path, reconnect with re-announcement, and handler isolation —
//! without involving the real broker.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use wirebus_client::{ClientConfig, ClientError, ConnectState, EventClient};
use wirebus_core::protocol::codec::{encode_frame, encode_payload};
use wirebus_core::protocol::messages::{
    AckMessage, AckStatus, BusMessage, DeliveryMessage, Heartbeat, MessageKind,
};
use wirebus_core::transport::{read_message, send_message, write_frame};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);
const SILENCE_WINDOW: Duration = Duration::from_millis(200);

/// Test config with short intervals so failure paths run in milliseconds.
fn fast_config() -> ClientConfig {
    ClientConfig {
        reconnect_interval: Duration::from_millis(50),
        handshake_timeout: Duration::from_secs(1),
        heartbeat_interval: Duration::from_secs(60),
        max_heartbeat_failures: 3,
    }
}

async fn ack(stream: &mut TcpStream, task_id: u32) {
    send_message(
        stream,
        &AckMessage {
            task_id,
            status: AckStatus::Success,
            message: String::new(),
        },
    )
    .await
    .expect("ack send");
}

/// Serves one connection: acks probes and subscription traffic, echoes
/// heartbeats, and reports every subscribe/unsubscribe on `events`.
async fn serve_connection(mut stream: TcpStream, events: mpsc::UnboundedSender<BusMessage>) {
    while let Ok(Some(message)) = read_message(&mut stream).await {
        match &message {
            BusMessage::HandshakeProbe(probe) => ack(&mut stream, probe.task_id).await,
            BusMessage::Subscribe(subscribe) => {
                ack(&mut stream, subscribe.task_id).await;
                let _ = events.send(message);
            }
            BusMessage::Unsubscribe(unsubscribe) => {
                ack(&mut stream, unsubscribe.task_id).await;
                let _ = events.send(message);
            }
            BusMessage::Heartbeat(_) => {
                send_message(&mut stream, &Heartbeat::default())
                    .await
                    .expect("heartbeat echo");
            }
            _ => {}
        }
    }
}

/// Scripted broker accepting a single connection.
async fn spawn_single_connection_broker(
) -> (std::net::SocketAddr, mpsc::UnboundedReceiver<BusMessage>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        serve_connection(stream, tx).await;
    });
    (addr, rx)
}

async fn expect_event(rx: &mut mpsc::UnboundedReceiver<BusMessage>) -> BusMessage {
    timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for a recorded frame")
        .expect("recorder channel closed")
}

async fn assert_no_event(rx: &mut mpsc::UnboundedReceiver<BusMessage>) {
    let result = timeout(SILENCE_WINDOW, rx.recv()).await;
    assert!(result.is_err(), "expected no frame, got {:?}", result.unwrap());
}

// ── Subscribe ref-counting ────────────────────────────────────────────────────

#[tokio::test]
async fn test_two_handlers_announce_one_subscribe_and_one_unsubscribe() {
    let (addr, mut events) = spawn_single_connection_broker().await;
    let client = EventClient::new(fast_config());
    client.connect(&addr.ip().to_string(), addr.port()).await.unwrap();
    assert_eq!(client.state(), ConnectState::Connected);

    let first = client.subscribe::<String, _>("s", |_| {}).await.unwrap();
    let second = client.subscribe::<String, _>("s", |_| {}).await.unwrap();

    // Exactly one Subscribe frame for two handlers.
    match expect_event(&mut events).await {
        BusMessage::Subscribe(subscribe) => assert_eq!(subscribe.subject, "s"),
        other => panic!("expected subscribe, got {other:?}"),
    }
    assert_no_event(&mut events).await;

    // Removing the first handler announces nothing.
    assert!(client.unsubscribe("s", first).await.unwrap());
    assert_no_event(&mut events).await;

    // Removing the last one sends exactly one Unsubscribe.
    assert!(client.unsubscribe("s", second).await.unwrap());
    match expect_event(&mut events).await {
        BusMessage::Unsubscribe(unsubscribe) => assert_eq!(unsubscribe.subject, "s"),
        other => panic!("expected unsubscribe, got {other:?}"),
    }
    assert_no_event(&mut events).await;

    client.disconnect().await;
}

#[tokio::test]
async fn test_distinct_subjects_each_announce_their_own_subscribe() {
    let (addr, mut events) = spawn_single_connection_broker().await;
    let client = EventClient::new(fast_config());
    client.connect(&addr.ip().to_string(), addr.port()).await.unwrap();

    client.subscribe::<String, _>("a", |_| {}).await.unwrap();
    client.subscribe::<String, _>("b", |_| {}).await.unwrap();

    let mut subjects = Vec::new();
    for _ in 0..2 {
        match expect_event(&mut events).await {
            BusMessage::Subscribe(subscribe) => subjects.push(subscribe.subject),
            other => panic!("expected subscribe, got {other:?}"),
        }
    }
    subjects.sort();
    assert_eq!(subjects, vec!["a".to_string(), "b".to_string()]);

    client.disconnect().await;
}

// ── Handshake verification ────────────────────────────────────────────────────

#[tokio::test]
async fn test_silent_peer_yields_broker_not_verified() {
    // A listener that accepts and then says nothing: the TCP connect
    // succeeds but the peer never proves it is a broker.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        // Hold the socket open without answering anything.
        sleep(Duration::from_secs(10)).await;
        drop(stream);
    });

    let config = ClientConfig {
        handshake_timeout: Duration::from_millis(200),
        ..fast_config()
    };
    let client = EventClient::new(config);
    let result = client.connect(&addr.ip().to_string(), addr.port()).await;

    assert!(matches!(result, Err(ClientError::BrokerNotVerified { .. })));
    assert_eq!(client.state(), ConnectState::ConnectedButUnverified);
}

// ── Reconnect ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_connection_loss_reconnects_and_reannounces_subscriptions() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, mut events) = mpsc::unbounded_channel::<(usize, BusMessage)>();

    tokio::spawn(async move {
        // First connection: handshake, take the subscribe, then hang up.
        // Second connection: serve normally.
        for connection in 0usize..2 {
            let (mut stream, _) = listener.accept().await.expect("accept");
            loop {
                let Ok(Some(message)) = read_message(&mut stream).await else {
                    break;
                };
                match &message {
                    BusMessage::HandshakeProbe(probe) => ack(&mut stream, probe.task_id).await,
                    BusMessage::Subscribe(subscribe) => {
                        ack(&mut stream, subscribe.task_id).await;
                        let _ = tx.send((connection, message));
                        if connection == 0 {
                            // Drop the first connection right after the
                            // subscription lands.
                            break;
                        }
                    }
                    BusMessage::Heartbeat(_) => {
                        let _ = send_message(&mut stream, &Heartbeat::default()).await;
                    }
                    _ => {}
                }
            }
            if connection == 1 {
                // Keep the second connection open until the test ends.
                sleep(Duration::from_secs(10)).await;
            }
        }
    });

    let client = EventClient::new(fast_config());
    client.connect(&addr.ip().to_string(), addr.port()).await.unwrap();
    client.subscribe::<String, _>("durable", |_| {}).await.unwrap();

    // The subscription lands on the first connection, which then drops.
    let (connection, message) = timeout(RECV_TIMEOUT, events.recv())
        .await
        .expect("first subscribe")
        .unwrap();
    assert_eq!(connection, 0);
    assert_eq!(message.kind(), MessageKind::Subscribe);

    // The client notices the loss, redials, re-handshakes, and re-announces
    // the subject without any caller involvement.
    let (connection, message) = timeout(RECV_TIMEOUT, events.recv())
        .await
        .expect("re-announced subscribe after reconnect")
        .unwrap();
    assert_eq!(connection, 1);
    match message {
        BusMessage::Subscribe(subscribe) => assert_eq!(subscribe.subject, "durable"),
        other => panic!("expected re-announce, got {other:?}"),
    }

    // Wait for the reconnect to settle back into Connected.
    let mut waited = Duration::ZERO;
    while client.state() != ConnectState::Connected {
        assert!(waited < RECV_TIMEOUT, "client never returned to Connected");
        sleep(Duration::from_millis(20)).await;
        waited += Duration::from_millis(20);
    }

    client.disconnect().await;
}

// ── Handler dispatch ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_handlers_run_in_order_and_a_panic_does_not_stop_the_rest() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // Serve one connection: handshake + subscribe acks. The delivery is
    // pushed only once the client signals (with a publish) that all of its
    // handlers are registered, so the test cannot race registration.
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        loop {
            let Ok(Some(message)) = read_message(&mut stream).await else {
                break;
            };
            match message {
                BusMessage::HandshakeProbe(probe) => ack(&mut stream, probe.task_id).await,
                BusMessage::Subscribe(subscribe) => ack(&mut stream, subscribe.task_id).await,
                BusMessage::Publish(publish) => {
                    ack(&mut stream, publish.task_id).await;
                    let delivery = DeliveryMessage {
                        task_id: 9999,
                        subject: "fragile".to_string(),
                        payload: encode_payload(&"fragile".to_string()),
                    };
                    write_frame(&mut stream, &encode_frame(&delivery))
                        .await
                        .expect("delivery send");
                }
                _ => {}
            }
        }
    });

    let client = EventClient::new(fast_config());
    client.connect(&addr.ip().to_string(), addr.port()).await.unwrap();

    let log = Arc::new(StdMutex::new(Vec::new()));

    let log_first = Arc::clone(&log);
    client
        .subscribe::<String, _>("fragile", move |message| {
            log_first.lock().unwrap().push(format!("first:{message}"));
        })
        .await
        .unwrap();

    client
        .subscribe::<String, _>("fragile", |_message| {
            panic!("handler blew up");
        })
        .await
        .unwrap();

    let log_third = Arc::clone(&log);
    client
        .subscribe::<String, _>("fragile", move |message| {
            log_third.lock().unwrap().push(format!("third:{message}"));
        })
        .await
        .unwrap();

    // All handlers are registered; tell the scripted broker to deliver.
    client.publish("go", &0u32).await.unwrap();

    // Both surviving handlers must run, in registration order, despite the
    // panic in between.
    let mut waited = Duration::ZERO;
    while log.lock().unwrap().len() < 2 {
        assert!(waited < RECV_TIMEOUT, "handlers never ran: {:?}", log.lock().unwrap());
        sleep(Duration::from_millis(20)).await;
        waited += Duration::from_millis(20);
    }
    assert_eq!(
        *log.lock().unwrap(),
        vec!["first:fragile".to_string(), "third:fragile".to_string()]
    );

    client.disconnect().await;
}

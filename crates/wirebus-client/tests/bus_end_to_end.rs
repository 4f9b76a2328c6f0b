//! End-to-end tests: real clients against the real broker over loopback TCP.
//!
//! These cover the whole data path from `publish`/`query` on one client,
//! through the broker's registries, to typed handler invocation or query
//! resolution on another.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

use wirebus_broker::EventBroker;
use wirebus_client::{ClientConfig, ClientError, ConnectState, EventClient};
use wirebus_core::wire_shape;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

wire_shape! {
    /// Demo payload exercised across the bus.
    pub struct TemperatureReading = (0x40, 1) {
        pub sensor: String,
        pub millicelsius: i32,
    }
}

wire_shape! {
    /// Query payload asking for a sensor's latest reading.
    pub struct ReadingRequest = (0x41, 1) {
        pub sensor: String,
    }
}

fn fast_config() -> ClientConfig {
    ClientConfig {
        reconnect_interval: Duration::from_millis(50),
        handshake_timeout: Duration::from_secs(1),
        heartbeat_interval: Duration::from_secs(60),
        max_heartbeat_failures: 3,
    }
}

async fn start_broker() -> (EventBroker, std::net::SocketAddr) {
    let broker = EventBroker::new();
    broker.start("127.0.0.1", 0).await.expect("broker start");
    let addr = broker.local_addr().expect("bound address");
    (broker, addr)
}

async fn connect_client(addr: std::net::SocketAddr) -> EventClient {
    let client = EventClient::new(fast_config());
    client
        .connect(&addr.ip().to_string(), addr.port())
        .await
        .expect("client connect");
    assert_eq!(client.state(), ConnectState::Connected);
    client
}

#[tokio::test]
async fn test_publish_reaches_every_subscriber_with_typed_payload() {
    let (broker, addr) = start_broker().await;
    let subscriber_a = connect_client(addr).await;
    let subscriber_b = connect_client(addr).await;
    let publisher = connect_client(addr).await;

    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    subscriber_a
        .subscribe::<TemperatureReading, _>("weather", move |reading| {
            let _ = tx_a.send(reading);
        })
        .await
        .unwrap();
    subscriber_b
        .subscribe::<TemperatureReading, _>("weather", move |reading| {
            let _ = tx_b.send(reading);
        })
        .await
        .unwrap();
    // Let both Subscribe frames land in the broker's registry before
    // publishing; subscribe only confirms the local send.
    sleep(Duration::from_millis(100)).await;

    let reading = TemperatureReading {
        sensor: "roof".to_string(),
        millicelsius: 21_500,
    };
    publisher.publish("weather", &reading).await.unwrap();

    for rx in [&mut rx_a, &mut rx_b] {
        let received = timeout(RECV_TIMEOUT, rx.recv())
            .await
            .expect("delivery timed out")
            .expect("channel closed");
        assert_eq!(received, reading);
    }

    publisher.disconnect().await;
    subscriber_a.disconnect().await;
    subscriber_b.disconnect().await;
    broker.stop();
}

#[tokio::test]
async fn test_query_resolves_with_a_subscriber_answer() {
    let (broker, addr) = start_broker().await;
    let responder = Arc::new(connect_client(addr).await);
    let caller = connect_client(addr).await;

    // The responder answers a forwarded query by publishing back on the
    // same subject, exactly like the protocol prescribes.
    let responder_handle = Arc::clone(&responder);
    responder
        .subscribe_async::<ReadingRequest, _, _>("weather/latest", move |request| {
            let responder = Arc::clone(&responder_handle);
            async move {
                let answer = TemperatureReading {
                    sensor: request.sensor,
                    millicelsius: 19_250,
                };
                responder
                    .publish("weather/latest", &answer)
                    .await
                    .expect("answer publish");
            }
        })
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    let answer: TemperatureReading = caller
        .query(
            "weather/latest",
            &ReadingRequest {
                sensor: "roof".to_string(),
            },
            Duration::from_secs(1),
        )
        .await
        .expect("query must resolve");

    assert_eq!(answer.sensor, "roof");
    assert_eq!(answer.millicelsius, 19_250);

    caller.disconnect().await;
    responder.disconnect().await;
    broker.stop();
}

#[tokio::test]
async fn test_query_with_no_subscribers_times_out_and_leaves_no_residue() {
    let (broker, addr) = start_broker().await;
    let caller = connect_client(addr).await;

    let wait = Duration::from_millis(200);
    let started = Instant::now();
    let result: Result<TemperatureReading, _> = caller
        .query(
            "weather/latest",
            &ReadingRequest {
                sensor: "roof".to_string(),
            },
            wait,
        )
        .await;

    assert!(matches!(result, Err(ClientError::QueryTimeout { .. })));
    // The timeout must fire near the deadline, not at some polling multiple.
    assert!(started.elapsed() < wait + Duration::from_millis(500));

    // A fresh query on the same subject behaves as new: with a responder now
    // in place it resolves instead of inheriting stale state.
    let responder = Arc::new(connect_client(addr).await);
    let responder_handle = Arc::clone(&responder);
    responder
        .subscribe_async::<ReadingRequest, _, _>("weather/latest", move |request| {
            let responder = Arc::clone(&responder_handle);
            async move {
                let answer = TemperatureReading {
                    sensor: request.sensor,
                    millicelsius: 20_000,
                };
                let _ = responder.publish("weather/latest", &answer).await;
            }
        })
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    let answer: TemperatureReading = caller
        .query(
            "weather/latest",
            &ReadingRequest {
                sensor: "roof".to_string(),
            },
            Duration::from_secs(1),
        )
        .await
        .expect("second query must resolve");
    assert_eq!(answer.millicelsius, 20_000);

    caller.disconnect().await;
    responder.disconnect().await;
    broker.stop();
}

#[tokio::test]
async fn test_publisher_without_subscription_receives_nothing() {
    let (broker, addr) = start_broker().await;
    let publisher = connect_client(addr).await;

    // A handler on an unrelated subject: if the broker ever echoed the
    // publish back to its sender, this would record it.
    let log = Arc::new(StdMutex::new(Vec::<TemperatureReading>::new()));
    let log_handle = Arc::clone(&log);
    publisher
        .subscribe::<TemperatureReading, _>("other", move |reading| {
            log_handle.lock().unwrap().push(reading);
        })
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    publisher
        .publish(
            "weather",
            &TemperatureReading {
                sensor: "roof".to_string(),
                millicelsius: 1,
            },
        )
        .await
        .unwrap();

    sleep(Duration::from_millis(200)).await;
    assert!(log.lock().unwrap().is_empty());

    publisher.disconnect().await;
    broker.stop();
}

#[tokio::test]
async fn test_resubscription_after_broker_restart_restores_delivery() {
    // Restart the broker on the same port and verify the client's reconnect
    // path re-announces its subscription well enough that publishes flow
    // again end to end.
    let (broker, addr) = start_broker().await;
    let subscriber = connect_client(addr).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    subscriber
        .subscribe::<TemperatureReading, _>("weather", move |reading| {
            let _ = tx.send(reading);
        })
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    broker.stop();

    // A replacement broker on the very same address.
    let replacement = EventBroker::new();
    let mut waited = Duration::ZERO;
    loop {
        match replacement.start(&addr.ip().to_string(), addr.port()).await {
            Ok(()) => break,
            Err(_) if waited < RECV_TIMEOUT => {
                sleep(Duration::from_millis(50)).await;
                waited += Duration::from_millis(50);
            }
            Err(e) => panic!("replacement broker never bound: {e}"),
        }
    }

    // Wait until the client has redialed and re-announced.
    let mut waited = Duration::ZERO;
    while replacement.subscriber_count("weather").await == 0 {
        assert!(
            waited < Duration::from_secs(5),
            "subscription was never re-announced"
        );
        sleep(Duration::from_millis(50)).await;
        waited += Duration::from_millis(50);
    }

    let publisher = connect_client(addr).await;
    let reading = TemperatureReading {
        sensor: "roof".to_string(),
        millicelsius: 18_000,
    };
    publisher.publish("weather", &reading).await.unwrap();

    let received = timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("delivery after restart timed out")
        .expect("channel closed");
    assert_eq!(received, reading);

    publisher.disconnect().await;
    subscriber.disconnect().await;
    replacement.stop();
}

//! Integration Tests with a Real MQTT Broker
//!
//! Need a broker on localhost:1883 accepting admin/admin, e.g.
//! `docker run -p 1883:1883 emqx/emqx`. Run with `cargo test -- --ignored`.


use arkadiko::config::BridgeConfig;
use arkadiko::observability::MetricsCollector;
use arkadiko::transport::{MqttPublisher, MqttSession, Publisher, RetryPolicy};
use arkadiko::{AppContext, BridgeService};
use bytes::Bytes;
use mqtt_integration_helpers::{mqtt_config, MQTT_BROKER_HOST, MQTT_BROKER_PORT};
use rumqttc::v5::mqttbytes::v5::{Packet, Publish};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, EventLoop, MqttOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Connect a plain rumqttc client and wait until `topic` is subscribed
async fn subscriber(topic: &str) -> (AsyncClient, EventLoop) {
    let mut options = MqttOptions::new(
        format!("arkadiko-test-{}", uuid::Uuid::new_v4()),
        MQTT_BROKER_HOST,
        MQTT_BROKER_PORT,
    );
    options.set_credentials("admin", "admin");
    let (client, mut event_loop) = AsyncClient::new(options, 16);
    client.subscribe(topic, QoS::ExactlyOnce).await.unwrap();

    timeout(Duration::from_secs(3), async {
        loop {
            if let Event::Incoming(Packet::SubAck(_)) = event_loop.poll().await.unwrap() {
                break;
            }
        }
    })
    .await
    .expect("broker should acknowledge the subscription");

    (client, event_loop)
}

/// Every publish delivered to the subscriber within `window`
async fn collect_publishes(event_loop: &mut EventLoop, window: Duration) -> Vec<Publish> {
    let mut received = Vec::new();
    let _ = timeout(window, async {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => received.push(publish),
                Ok(_) => {}
                Err(_) => break,
            }
        }
    })
    .await;
    received
}

async fn connected_publisher(metrics: Arc<MetricsCollector>) -> MqttPublisher<MqttSession> {
    let session = Arc::new(MqttSession::start(&mqtt_config(), Arc::clone(&metrics)).unwrap());
    session
        .wait_for_connection(Duration::from_secs(3))
        .await
        .unwrap();
    MqttPublisher::new(session, RetryPolicy::default(), metrics)
}

#[tokio::test]
#[ignore = "needs a broker on localhost:1883"]
async fn test_connect_to_real_broker() {
    let session = MqttSession::start(&mqtt_config(), Arc::new(MetricsCollector::new())).unwrap();

    session
        .wait_for_connection(Duration::from_secs(3))
        .await
        .expect("should connect to local broker");
    assert!(session.state().can_publish());

    session.disconnect().await.unwrap();
}

#[tokio::test]
#[ignore = "needs a broker on localhost:1883"]
async fn test_retained_publish_is_delivered() {
    let metrics = Arc::new(MetricsCollector::new());
    let publisher = connected_publisher(Arc::clone(&metrics)).await;
    let topic = format!("arkadiko/test/{}", uuid::Uuid::new_v4());

    publisher
        .publish(&topic, Bytes::from_static(b"{\"hello\":\"world\"}"), true)
        .await
        .expect("QoS 2 publish should complete");

    // Subscribing afterwards only sees the message because the broker retained it
    let (_client, mut event_loop) = subscriber(&topic).await;
    let received = collect_publishes(&mut event_loop, Duration::from_secs(1)).await;

    assert_eq!(received.len(), 1);
    assert!(received[0].retain);
    assert_eq!(received[0].payload, Bytes::from_static(b"{\"hello\":\"world\"}"));
    assert_eq!(metrics.get_metrics().publish.successes, 1);
    assert!(metrics.is_mqtt_connected());

    // Clear the retained message
    publisher
        .publish(&topic, Bytes::new(), true)
        .await
        .unwrap();
    publisher.shutdown().await;
}

#[tokio::test]
#[ignore = "needs a broker on localhost:1883"]
async fn test_subscriber_receives_exactly_one_message() {
    let (_client, mut event_loop) = subscriber("room/42").await;
    let publisher = connected_publisher(Arc::new(MetricsCollector::new())).await;

    publisher
        .publish("room/42", Bytes::from_static(b"{\"msg\":\"hi\"}"), false)
        .await
        .expect("publish to a reachable broker should succeed");

    let received: Vec<Publish> = collect_publishes(&mut event_loop, Duration::from_secs(1))
        .await
        .into_iter()
        .filter(|publish| !publish.retain)
        .collect();

    assert_eq!(received.len(), 1);
    assert_eq!(received[0].topic, Bytes::from_static(b"room/42"));
    assert_eq!(received[0].payload, Bytes::from_static(b"{\"msg\":\"hi\"}"));

    publisher.shutdown().await;
}

#[tokio::test]
#[ignore = "needs a broker on localhost:1883"]
async fn test_many_concurrent_publishes_all_complete() {
    let mut config = BridgeConfig::default();
    config.mqttserver = mqtt_config();
    let context = Arc::new(AppContext::new(config));
    let service = BridgeService::new(Arc::clone(&context));

    let tasks: Vec<_> = (0..50)
        .map(|i| {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .send_message(
                        &format!("arkadiko/load/{i}"),
                        Bytes::from(format!("{{\"n\":{i}}}")),
                        false,
                    )
                    .await
            })
        })
        .collect();

    for result in futures::future::join_all(tasks).await {
        result.unwrap().unwrap();
    }

    let snapshot = context.metrics().get_metrics();
    assert_eq!(snapshot.requests.succeeded, 50);
    context.shutdown().await;
}

//! Bridge client against a mock bridge

use arkadiko::client::{BridgeClient, BridgeClientConfig, ClientError};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{basic_auth, body_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer) -> BridgeClient {
    BridgeClient::new(BridgeClientConfig::new(server.uri()).with_credentials("user", "pass"))
        .unwrap()
}

#[tokio::test]
async fn test_send_mqtt_returns_echo() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sendmqtt/topic"))
        .and(query_param("retained", "false"))
        .and(basic_auth("user", "pass"))
        .and(body_json(json!({"message": "message"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "payload": {"message": "message"},
            "retained": false,
            "topic": "topic"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let response = client_for(&server)
        .send_mqtt("topic", &json!({"message": "message"}), false)
        .await
        .unwrap();

    assert_eq!(response.topic, "topic");
    assert!(!response.retained);
    assert_eq!(response.payload, json!({"message": "message"}));
}

#[tokio::test]
async fn test_send_mqtt_escapes_topic() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sendmqtt/some%2Ftopic"))
        .and(query_param("retained", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "payload": {"message": "message"},
            "retained": true,
            "topic": "some/topic"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let response = client_for(&server)
        .send_mqtt("some/topic", &json!({"message": "message"}), true)
        .await
        .unwrap();

    assert_eq!(response.topic, "some/topic");
    assert!(response.retained);
}

#[tokio::test]
async fn test_send_mqtt_returns_meaningful_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
        .mount(&server)
        .await;

    let result = client_for(&server)
        .send_mqtt("topic", &json!({"message": "message"}), false)
        .await;

    match result {
        Err(ClientError::Request { status, body }) => {
            assert_eq!(status, 404);
            assert_eq!(body, "not found");
        }
        other => panic!("expected Request error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_send_mqtt_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let client = BridgeClient::new(
        BridgeClientConfig::new(server.uri()).with_timeout(Duration::from_millis(100)),
    )
    .unwrap();

    let result = client.send_mqtt("topic", &json!({}), false).await;
    match result {
        Err(ClientError::Http(e)) => assert!(e.is_timeout()),
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn test_send_mqtt_rejects_non_echo_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("WORKING"))
        .mount(&server)
        .await;

    let result = client_for(&server).send_mqtt("topic", &json!({}), false).await;
    assert!(matches!(result, Err(ClientError::Decode(_))));
}

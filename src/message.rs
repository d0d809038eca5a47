//! Message types carried through the bridge
//!
//! The inbound HTTP body becomes an [`OutboundMessage`]; the API echoes a
//! [`SendMqttResponse`]; the HTTP-proxy transport speaks [`ProxyPublishRequest`].

use crate::error::PublishError;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::QoS;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Key injected into every payload that does not set it
pub const MODERATION_KEY: &str = "should_moderate";

/// MQTT delivery guarantee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QualityOfService {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    /// The level every bridge publish uses
    #[default]
    ExactlyOnce = 2,
}

impl QualityOfService {
    pub fn level(self) -> u8 {
        self as u8
    }
}

impl From<QualityOfService> for QoS {
    fn from(qos: QualityOfService) -> Self {
        match qos {
            QualityOfService::AtMostOnce => QoS::AtMostOnce,
            QualityOfService::AtLeastOnce => QoS::AtLeastOnce,
            QualityOfService::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

/// A single message to publish downstream
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub retained: bool,
    pub qos: QualityOfService,
}

impl OutboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, retained: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retained,
            qos: QualityOfService::ExactlyOnce,
        }
    }

    /// Check the message can be handed to a transport
    pub fn validate(&self) -> Result<(), PublishError> {
        if self.topic.is_empty() {
            return Err(PublishError::invalid_topic("topic must not be empty"));
        }
        if self.topic.contains(['+', '#']) {
            return Err(PublishError::invalid_topic(format!(
                "wildcards are not allowed in publish topics: {}",
                self.topic
            )));
        }
        Ok(())
    }

    /// Payload as text for logs and the HTTP proxy body
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Response body of a successful `POST /sendmqtt/<topic>`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SendMqttResponse {
    pub topic: String,
    pub retained: bool,
    pub payload: Value,
}

/// Response body of a failed API request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureResponse {
    pub success: bool,
    pub reason: String,
}

impl FailureResponse {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: reason.into(),
        }
    }
}

/// Body posted to the broker's HTTP publish API
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyPublishRequest {
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
    pub client_id: String,
}

impl ProxyPublishRequest {
    pub fn from_message(message: &OutboundMessage) -> Self {
        Self {
            topic: message.topic.clone(),
            payload: message.payload_str(),
            qos: message.qos.level(),
            retain: message.retained,
            client_id: format!("arkadiko-{}", Uuid::new_v4()),
        }
    }
}

/// Parse a request body as a JSON object and default `should_moderate` to false
pub fn prepare_payload(body: &[u8]) -> Result<(Value, Vec<u8>), serde_json::Error> {
    let mut object: serde_json::Map<String, Value> = serde_json::from_slice(body)?;
    object
        .entry(MODERATION_KEY)
        .or_insert(Value::Bool(false));

    let value = Value::Object(object);
    let encoded = serde_json::to_vec(&value)?;
    Ok((value, encoded))
}

//! Client for the bridge's HTTP API
//!
//! ```no_run
//! use arkadiko::client::{BridgeClient, BridgeClientConfig};
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), arkadiko::client::ClientError> {
//! let client = BridgeClient::new(BridgeClientConfig::new("http://localhost:8890"))?;
//! let echoed = client.send_mqtt("room/42", &json!({"text": "hi"}), false).await?;
//! assert_eq!(echoed.topic, "room/42");
//! # Ok(())
//! # }
//! ```

use crate::message::SendMqttResponse;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::form_urlencoded;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The bridge answered with an error status
    #[error("Request failed with status code {status}: {body}")]
    Request { status: u16, body: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ClientError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Request { status, .. } => Some(*status),
            ClientError::Http(e) => e.status().map(|s| s.as_u16()),
            ClientError::Decode(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeClientConfig {
    pub url: String,
    pub user: String,
    pub pass: String,
    pub timeout: Duration,
    pub max_idle_conns_per_host: usize,
}

impl BridgeClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.user = user.into();
        self.pass = pass.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for BridgeClientConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8890".to_string(),
            user: String::new(),
            pass: String::new(),
            timeout: Duration::from_millis(500),
            max_idle_conns_per_host: 2,
        }
    }
}

pub struct BridgeClient {
    http: reqwest::Client,
    config: BridgeClientConfig,
}

impl BridgeClient {
    pub fn new(config: BridgeClientConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.max_idle_conns_per_host)
            .build()?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &BridgeClientConfig {
        &self.config
    }

    /// URL for publishing on `topic`; the topic is query-escaped so `/` becomes `%2F`
    pub fn send_url(&self, topic: &str, retained: bool) -> String {
        let escaped: String = form_urlencoded::byte_serialize(topic.as_bytes()).collect();
        format!(
            "{}/sendmqtt/{}?retained={}",
            self.config.url.trim_end_matches('/'),
            escaped,
            retained
        )
    }

    /// Publish `payload` on `topic` and return the bridge's echo
    pub async fn send_mqtt<T>(
        &self,
        topic: &str,
        payload: &T,
        retained: bool,
    ) -> Result<SendMqttResponse, ClientError>
    where
        T: Serialize + ?Sized,
    {
        let url = self.send_url(topic, retained);
        debug!(url = %url, "Sending message to bridge");

        let mut request = self.http.post(&url).json(payload);
        if !self.config.user.is_empty() {
            request = request.basic_auth(&self.config.user, Some(&self.config.pass));
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;

        if status > 399 {
            return Err(ClientError::Request { status, body });
        }

        Ok(serde_json::from_str(&body)?)
    }
}

//! Publishing through the broker's HTTP publish API

use crate::config::HttpServerSection;
use crate::error::PublishError;
use crate::message::{OutboundMessage, ProxyPublishRequest};
use crate::observability::MetricsCollector;
use crate::transport::Publisher;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn, Instrument};

/// Path of the publish endpoint relative to `httpserver.url`
pub const PUBLISH_PATH: &str = "/api/v2/mqtt/publish";

/// Single-attempt publisher that POSTs each message to the proxy
///
/// One `reqwest::Client` is built per publisher and reused, so connections
/// to the proxy are pooled for the process lifetime.
pub struct HttpProxyPublisher {
    client: reqwest::Client,
    endpoint: String,
    user: String,
    pass: String,
    timeout: Duration,
    metrics: Arc<MetricsCollector>,
}

impl HttpProxyPublisher {
    pub fn new(
        config: &HttpServerSection,
        metrics: Arc<MetricsCollector>,
    ) -> Result<Self, PublishError> {
        let timeout = Duration::from_millis(config.timeout_ms);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(config.max_idle_conns)
            .build()
            .map_err(PublishError::transport)?;

        Ok(Self {
            client,
            endpoint: format!("{}{}", config.url.trim_end_matches('/'), PUBLISH_PATH),
            user: config.user.clone(),
            pass: config.pass.clone(),
            timeout,
            metrics,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send(&self, message: OutboundMessage) -> Result<(), PublishError> {
        message.validate()?;

        let body = ProxyPublishRequest::from_message(&message);
        self.metrics.publish_attempted();
        let started = Instant::now();

        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.user, Some(&self.pass))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        let status = response.status();
        if status.as_u16() >= 400 {
            let body = response.text().await.unwrap_or_default();
            self.metrics.publish_failed();
            warn!(status = status.as_u16(), body = %body, "Publish proxy rejected message");
            return Err(PublishError::Status {
                code: status.as_u16(),
                body,
            });
        }

        // Drain the body so the connection goes back to the pool
        let _ = response.bytes().await;

        self.metrics.publish_succeeded(started.elapsed());
        debug!(status = status.as_u16(), client_id = %body.client_id, "Publish proxy accepted message");
        Ok(())
    }

    fn request_error(&self, e: reqwest::Error) -> PublishError {
        if e.is_timeout() {
            self.metrics.publish_timed_out();
            warn!(after = ?self.timeout, "Publish proxy request timed out");
            PublishError::Timeout {
                after: self.timeout,
            }
        } else {
            self.metrics.publish_failed();
            warn!(
                error = %e,
                is_connect = e.is_connect(),
                "Publish proxy request failed"
            );
            PublishError::transport(e)
        }
    }
}

#[async_trait]
impl Publisher for HttpProxyPublisher {
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        retained: bool,
    ) -> Result<(), PublishError> {
        let span = crate::publish_span!(
            transport = "http",
            topic = %topic,
            retained,
            payload_present = !payload.is_empty()
        );
        let message = OutboundMessage::new(topic, payload, retained);
        self.send(message).instrument(span).await
    }

    /// The proxy is stateless from our side; reachability is only known per request
    fn is_connected(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

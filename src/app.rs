//! Composition root
//!
//! [`AppContext`] owns everything request handlers need and is passed around
//! as `Arc<AppContext>`. The publisher is built lazily, exactly once, by the
//! first caller of [`AppContext::publisher`].

use crate::config::{BridgeConfig, TransportKind};
use crate::error::BridgeError;
use crate::lifecycle::{LifecycleError, SharedResource};
use crate::observability::MetricsCollector;
use crate::transport::{HttpProxyPublisher, MqttPublisher, MqttSession, Publisher, RetryPolicy};
use std::sync::Arc;
use tracing::{info, warn};

pub struct AppContext {
    config: BridgeConfig,
    metrics: Arc<MetricsCollector>,
    publisher: SharedResource<dyn Publisher>,
}

impl AppContext {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            metrics: Arc::new(MetricsCollector::new()),
            publisher: SharedResource::new("publisher"),
        }
    }

    /// Context whose publisher is already built, for tests and embedding
    pub async fn with_publisher(
        config: BridgeConfig,
        publisher: Arc<dyn Publisher>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let context = Self {
            config,
            metrics,
            publisher: SharedResource::new("publisher"),
        };
        let _ = context
            .publisher
            .get_or_create(|| async move { Ok::<_, BridgeError>(publisher) })
            .await;
        context
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// The configured transport, constructed on first use
    pub async fn publisher(&self) -> Result<Arc<dyn Publisher>, LifecycleError> {
        self.publisher
            .get_or_create(|| build_publisher(&self.config, Arc::clone(&self.metrics)))
            .await
    }

    /// The transport if it has already been built
    pub fn publisher_if_ready(&self) -> Option<Arc<dyn Publisher>> {
        self.publisher.get()
    }

    /// Release transport resources; a never-built publisher is left alone
    pub async fn shutdown(&self) {
        if let Some(publisher) = self.publisher.get() {
            info!(transport = publisher.name(), "Shutting down publisher");
            publisher.shutdown().await;
        }
    }
}

async fn build_publisher(
    config: &BridgeConfig,
    metrics: Arc<MetricsCollector>,
) -> Result<Arc<dyn Publisher>, BridgeError> {
    match config.publish.transport {
        TransportKind::Mqtt => {
            let session = MqttSession::start(&config.mqttserver, Arc::clone(&metrics))?;

            if let Some(timeout) = config.mqttserver.connect_timeout() {
                if let Err(e) = session.wait_for_connection(timeout).await {
                    // Fatal at startup: nothing can be published without a broker
                    warn!(broker = session.broker(), error = %e, "Broker did not accept the connection");
                    session.disconnect().await?;
                    return Err(e.into());
                }
            }

            let policy = RetryPolicy::from_config(&config.publish);
            info!(
                max_attempts = policy.max_attempts,
                attempt_timeout_ms = policy.attempt_timeout.as_millis() as u64,
                "MQTT publisher ready"
            );
            Ok(Arc::new(MqttPublisher::new(Arc::new(session), policy, metrics)))
        }
        TransportKind::Http => {
            let publisher = HttpProxyPublisher::new(&config.httpserver, metrics)?;
            info!(endpoint = publisher.endpoint(), "HTTP proxy publisher ready");
            Ok(Arc::new(publisher))
        }
    }
}

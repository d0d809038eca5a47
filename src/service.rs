//! Transport-agnostic `SendMessage` operation
//!
//! The HTTP handler calls [`BridgeService::send_message`]; any other front
//! end (an RPC server, a queue consumer) can call it the same way.

use crate::app::AppContext;
use crate::error::PublishError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

/// Result of a successful send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageResult {
    pub topic: String,
    pub retained: bool,
}

#[derive(Clone)]
pub struct BridgeService {
    context: Arc<AppContext>,
}

impl BridgeService {
    pub fn new(context: Arc<AppContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.context
    }

    /// Publish `payload` on `topic` through the configured transport
    pub async fn send_message(
        &self,
        topic: &str,
        payload: Bytes,
        retained: bool,
    ) -> Result<SendMessageResult, PublishError> {
        let metrics = self.context.metrics();
        metrics.request_received();
        let started = Instant::now();

        let publisher = self.context.publisher().await.map_err(|e| {
            error!(error = %e, "Publisher unavailable");
            PublishError::not_connected(e.to_string())
        });

        let outcome = match publisher {
            Ok(publisher) => publisher.publish(topic, payload, retained).await,
            Err(e) => Err(e),
        };

        let latency = started.elapsed();
        metrics.request_completed(latency, outcome.is_ok());

        match outcome {
            Ok(()) => {
                debug!(
                    topic,
                    retained,
                    latency_us = latency.as_micros() as u64,
                    "sent mqtt message"
                );
                Ok(SendMessageResult {
                    topic: topic.to_string(),
                    retained,
                })
            }
            Err(e) => {
                error!(topic, retained, error = %e, "failed to send mqtt message");
                Err(e)
            }
        }
    }
}

//! Downstream publish transports
//!
//! Request handling depends only on [`Publisher`]. Two implementations exist:
//! [`mqtt::MqttPublisher`] talks to the broker directly with bounded retry,
//! [`http_proxy::HttpProxyPublisher`] hands the message to the broker's HTTP
//! publish API.

use crate::error::PublishError;
use bytes::Bytes;

pub mod http_proxy;
pub mod mqtt;

pub use http_proxy::HttpProxyPublisher;
pub use mqtt::{MqttPublisher, MqttSession, RetryPolicy, Session};

/// Publish a message downstream
///
/// Every message is sent with QoS 2. `Ok(())` means the transport confirmed
/// delivery to the broker.
#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Bytes, retained: bool)
        -> Result<(), PublishError>;

    /// Whether the transport currently believes it can deliver
    fn is_connected(&self) -> bool;

    /// Short transport name for logs
    fn name(&self) -> &'static str;

    /// Release transport resources before exit
    async fn shutdown(&self) {}
}

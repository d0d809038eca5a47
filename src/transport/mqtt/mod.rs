//! Direct MQTT transport
//!
//! - [`connection`] - connection state, reconnect schedule and option building
//! - [`ack_tracker`] - binds queued publishes to their QoS 2 acknowledgements
//! - [`client`] - the long-lived broker session and its supervisor task
//! - [`publisher`] - retry and timeout policy on top of a session
//!
//! # Usage
//!
//! ```rust,no_run
//! use arkadiko::config::MqttServerSection;
//! use arkadiko::observability::MetricsCollector;
//! use arkadiko::transport::mqtt::{MqttPublisher, MqttSession, RetryPolicy};
//! use arkadiko::transport::Publisher;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let metrics = Arc::new(MetricsCollector::new());
//! let session = MqttSession::start(&MqttServerSection::default(), Arc::clone(&metrics))?;
//! session.wait_for_connection(Duration::from_secs(5)).await?;
//!
//! let publisher = MqttPublisher::new(Arc::new(session), RetryPolicy::default(), metrics);
//! publisher.publish("room/42", r#"{"text":"hi"}"#.into(), false).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod ack_tracker;
pub mod client;
pub mod connection;
pub mod publisher;

pub use ack_tracker::AckTracker;
pub use client::MqttSession;
pub use connection::{ConnectionState, MqttError, ReconnectConfig};
pub use publisher::{MqttPublisher, RetryPolicy, Session};

//! Arkadiko - HTTP to MQTT bridge
//!
//! Accepts JSON payloads over HTTP and republishes them as MQTT messages,
//! either directly to a broker (QoS 2, with per-attempt timeouts and bounded
//! retries) or through the broker's HTTP publish API.
//!
//! # Overview
//!
//! - [`transport`]: the [`Publisher`](transport::Publisher) trait with MQTT
//!   and HTTP proxy implementations
//! - [`lifecycle`]: one-time async construction of shared resources
//! - [`app`] / [`service`]: dependency wiring and the `SendMessage` operation
//! - [`api`]: the warp HTTP surface
//! - [`client`]: an SDK for calling a running bridge
//!
//! # Quick Start
//!
//! ```no_run
//! use arkadiko::{AppContext, BridgeConfig, BridgeService};
//! use bytes::Bytes;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BridgeConfig::load_from_file(Path::new("arkadiko.toml"))?;
//! let service = BridgeService::new(Arc::new(AppContext::new(config)));
//!
//! service
//!     .send_message("room/42", Bytes::from_static(br#"{"text":"hi"}"#), false)
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod app;
pub mod client;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod message;
pub mod observability;
pub mod service;
pub mod testing;
pub mod transport;

pub use app::AppContext;
pub use config::{BridgeConfig, ConfigError, TransportKind};
pub use error::{BridgeError, BridgeResult, PublishError};
pub use lifecycle::{LifecycleError, LifecycleState, SharedResource};
pub use message::{OutboundMessage, QualityOfService, SendMqttResponse};
pub use service::{BridgeService, SendMessageResult};
pub use transport::Publisher;

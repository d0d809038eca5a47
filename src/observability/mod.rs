//! Observability: structured logging and in-process metrics

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{MetricsCollector, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{publish_span, request_span};

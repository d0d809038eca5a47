//! Error types for the bridge
//!
//! `PublishError` is the outcome of a failed publish on either transport and
//! is what the API layer turns into an HTTP status. `BridgeError` collects the
//! startup-time failures (configuration, lifecycle) for `main`.

use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use thiserror::Error;

/// Outcome of a publish that did not succeed
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Invalid topic: {message}")]
    InvalidTopic { message: String },

    #[error("MQTT session is not connected (state: {state})")]
    NotConnected { state: String },

    #[error("Transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Publish rejected by broker: {reason}")]
    Rejected { reason: String },

    #[error("Publish not acknowledged within {after:?}")]
    Timeout { after: Duration },

    #[error("Publish proxy returned HTTP {code}: {body}")]
    Status { code: u16, body: String },

    #[error("Publish failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<PublishError>,
    },
}

impl PublishError {
    /// Create invalid topic error
    pub fn invalid_topic<S: Into<String>>(message: S) -> Self {
        Self::InvalidTopic {
            message: message.into(),
        }
    }

    /// Create not connected error
    pub fn not_connected<S: Into<String>>(state: S) -> Self {
        Self::NotConnected {
            state: state.into(),
        }
    }

    /// Create transport error from anything error-like (including plain strings)
    pub fn transport<E>(source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Transport(source.into())
    }

    /// Create broker rejection error
    pub fn rejected<S: Into<String>>(reason: S) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    /// Whether this is a per-attempt acknowledgement timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, PublishError::Timeout { .. })
    }

    /// HTTP status the API answers with for this failure
    pub fn status_code(&self) -> u16 {
        match self {
            PublishError::Status { code, .. } => *code,
            PublishError::InvalidTopic { .. } => 400,
            PublishError::RetriesExhausted { last, .. } => last.status_code(),
            _ => 500,
        }
    }

    /// Reason string safe to hand back to HTTP callers
    pub fn public_reason(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

/// Crate-level error for startup and wiring failures
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] crate::lifecycle::LifecycleError),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] crate::transport::mqtt::MqttError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|pass|token|key|secret)[=:]\s*\S+").expect("static regex")
});

static SENSITIVE_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .expect("static regex")
});

const MAX_REASON_LEN: usize = 500;

/// Mask credential-like values and sensitive paths, capping the length
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN
        .replace_all(message, "${1}=***")
        .to_string();

    sanitized = SENSITIVE_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .to_string();

    if sanitized.len() > MAX_REASON_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_REASON_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

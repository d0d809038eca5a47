//! Connection state and option building for the broker session
//!
//! Pure functions only; the I/O lives in [`super::client`].

use crate::config::{MqttServerSection, MIN_KEEP_ALIVE_SECS};
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Max MQTT packet size accepted and sent by the session
const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Connection state for the broker session
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - waiting for the first ConnAck
    Connecting,
    /// ConnAck received, publishes are accepted
    Connected,
    /// Connection lost, the supervisor is reconnecting
    Disconnected(String),
    /// Session shut down on request
    Closed,
}

impl ConnectionState {
    pub fn can_publish(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Disconnected(reason) => write!(f, "disconnected: {reason}"),
            ConnectionState::Closed => f.write_str("closed"),
        }
    }
}

/// Delay schedule between event loop polls after a connection error
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Backoff pattern in milliseconds
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff_pattern: vec![25, 50, 100, 250],
            sustained_delay: 250,
        }
    }
}

impl ReconnectConfig {
    /// Backoff delay for the given (1-based) consecutive failure
    pub fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        let millis = self
            .backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay);
        Duration::from_millis(millis)
    }
}

/// Broker session errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("No ConnAck received within {after:?}")]
    ConnectionTimeout { after: Duration },
    #[error("Failed to read CA certificate {path}")]
    CaCertificate {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Session closed")]
    Closed,
}

/// Build rumqttc options from the `[mqttserver]` section
///
/// Every session gets a fresh `arkadiko-<uuid>` client id so restarts and
/// replicas never collide on the broker.
pub fn configure_mqtt_options(config: &MqttServerSection) -> Result<MqttOptions, MqttError> {
    let client_id = format!("arkadiko-{}", Uuid::new_v4());
    let mut mqtt_options = MqttOptions::new(client_id, config.host.clone(), config.port);

    if !config.user.is_empty() {
        mqtt_options.set_credentials(config.user.clone(), config.pass.clone());
    }

    let keep_alive = config.keep_alive_secs.max(MIN_KEEP_ALIVE_SECS);
    mqtt_options.set_keep_alive(Duration::from_secs(keep_alive));
    mqtt_options.set_clean_start(true);
    mqtt_options.set_max_packet_size(Some(MAX_PACKET_SIZE));

    if config.usetls {
        let transport = if config.ca_cert_file.is_empty() {
            RumqttcTransport::tls_with_default_config()
        } else {
            let ca = std::fs::read(&config.ca_cert_file).map_err(|source| {
                MqttError::CaCertificate {
                    path: config.ca_cert_file.clone(),
                    source,
                }
            })?;
            RumqttcTransport::tls(ca, None, None)
        };
        mqtt_options.set_transport(transport);
    }

    Ok(mqtt_options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_config_default() {
        let config = ReconnectConfig::default();
        assert_eq!(config.backoff_pattern, vec![25, 50, 100, 250]);
        assert_eq!(config.sustained_delay, 250);
    }

    #[test]
    fn test_calculate_backoff_delay() {
        let config = ReconnectConfig::default();

        assert_eq!(config.calculate_backoff_delay(1), Duration::from_millis(25));
        assert_eq!(config.calculate_backoff_delay(2), Duration::from_millis(50));
        assert_eq!(config.calculate_backoff_delay(3), Duration::from_millis(100));
        assert_eq!(config.calculate_backoff_delay(4), Duration::from_millis(250));

        // Sustained after the pattern runs out
        assert_eq!(config.calculate_backoff_delay(5), Duration::from_millis(250));
        assert_eq!(config.calculate_backoff_delay(100), Duration::from_millis(250));
    }

    #[test]
    fn test_empty_pattern_uses_sustained_delay() {
        let config = ReconnectConfig {
            backoff_pattern: vec![],
            sustained_delay: 40,
        };
        assert_eq!(config.calculate_backoff_delay(1), Duration::from_millis(40));
    }

    #[test]
    fn test_only_connected_can_publish() {
        assert!(ConnectionState::Connected.can_publish());
        assert!(!ConnectionState::Connecting.can_publish());
        assert!(!ConnectionState::Disconnected("reset".to_string()).can_publish());
        assert!(!ConnectionState::Closed.can_publish());
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(
            ConnectionState::Disconnected("broker gone".to_string()).to_string(),
            "disconnected: broker gone"
        );
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
    }

    #[test]
    fn test_configure_mqtt_options() {
        let config = MqttServerSection::default();
        let options = configure_mqtt_options(&config).unwrap();

        assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
        assert!(options.client_id().starts_with("arkadiko-"));
        assert_eq!(options.keep_alive(), Duration::from_secs(5));
    }

    #[test]
    fn test_short_keep_alive_is_clamped() {
        let config = MqttServerSection {
            keep_alive_secs: 1,
            ..MqttServerSection::default()
        };
        let options = configure_mqtt_options(&config).unwrap();
        assert_eq!(options.keep_alive(), Duration::from_secs(MIN_KEEP_ALIVE_SECS));
    }

    #[test]
    fn test_client_ids_are_unique() {
        let config = MqttServerSection::default();
        let first = configure_mqtt_options(&config).unwrap();
        let second = configure_mqtt_options(&config).unwrap();
        assert_ne!(first.client_id(), second.client_id());
    }

    #[test]
    fn test_missing_ca_file_is_an_error() {
        let config = MqttServerSection {
            usetls: true,
            ca_cert_file: "/nonexistent/arkadiko-ca.pem".to_string(),
            ..MqttServerSection::default()
        };

        let result = configure_mqtt_options(&config);
        assert!(matches!(result, Err(MqttError::CaCertificate { .. })));
    }
}

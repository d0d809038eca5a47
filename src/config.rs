//! Bridge configuration
//!
//! Configuration is read from a TOML file. Every section and key is optional
//! and falls back to a default. Any key can be overridden from the
//! environment as `ARKADIKO_<SECTION>_<KEY>`, for example
//! `ARKADIKO_MQTTSERVER_HOST=broker.internal`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "ARKADIKO";

/// Shortest keep-alive rumqttc accepts
pub const MIN_KEEP_ALIVE_SECS: u64 = 5;

/// Locations searched when no config path is given on the command line
pub const DEFAULT_CONFIG_PATHS: &[&str] = &[
    "arkadiko.toml",
    "config/arkadiko.toml",
    "config/local.toml",
];

/// Top-level bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BridgeConfig {
    #[serde(default)]
    pub mqttserver: MqttServerSection,
    #[serde(default)]
    pub publish: PublishSection,
    #[serde(default)]
    pub httpserver: HttpServerSection,
    #[serde(default)]
    pub basicauth: BasicAuthSection,
    #[serde(default)]
    pub healthcheck: HealthcheckSection,
}

/// Downstream MQTT broker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttServerSection {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_mqtt_user")]
    pub user: String,
    #[serde(default = "default_mqtt_pass")]
    pub pass: String,
    #[serde(default)]
    pub usetls: bool,
    /// PEM bundle of extra root certificates, empty for none
    #[serde(default)]
    pub ca_cert_file: String,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// How long startup waits for the broker handshake (0 = do not wait)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtt_user() -> String {
    "admin".to_string()
}

fn default_mqtt_pass() -> String {
    "admin".to_string()
}

fn default_keep_alive_secs() -> u64 {
    MIN_KEEP_ALIVE_SECS
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

impl Default for MqttServerSection {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            user: default_mqtt_user(),
            pass: default_mqtt_pass(),
            usetls: false,
            ca_cert_file: String::new(),
            keep_alive_secs: default_keep_alive_secs(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl MqttServerSection {
    pub fn connect_timeout(&self) -> Option<Duration> {
        match self.connect_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

/// Which downstream transport carries publishes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Talk MQTT to the broker directly
    #[default]
    Mqtt,
    /// Proxy publishes through the broker's HTTP publish API
    Http,
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mqtt" => Ok(TransportKind::Mqtt),
            "http" => Ok(TransportKind::Http),
            other => Err(format!("unknown transport '{other}'")),
        }
    }
}

/// Publish retry policy and transport selection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PublishSection {
    pub transport: TransportKind,
    /// Per-attempt acknowledgement timeout
    pub timeout_ms: u64,
    pub max_attempts: u32,
    /// Fixed pause between failed attempts
    pub backoff_ms: u64,
    /// Whether an unacknowledged attempt is retried or reported immediately
    pub retry_on_timeout: bool,
}

impl Default for PublishSection {
    fn default() -> Self {
        Self {
            transport: TransportKind::Mqtt,
            timeout_ms: 5000,
            max_attempts: 3,
            backoff_ms: 100,
            retry_on_timeout: true,
        }
    }
}

/// HTTP publish proxy in front of the broker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HttpServerSection {
    pub url: String,
    pub user: String,
    pub pass: String,
    pub timeout_ms: u64,
    pub max_idle_conns: usize,
}

impl Default for HttpServerSection {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080".to_string(),
            user: "admin".to_string(),
            pass: "public".to_string(),
            timeout_ms: 10_000,
            max_idle_conns: 1024,
        }
    }
}

/// Basic auth for the bridge API; disabled while `username` is empty
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct BasicAuthSection {
    pub username: String,
    pub password: String,
}

impl BasicAuthSection {
    pub fn enabled(&self) -> bool {
        !self.username.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthcheckSection {
    pub working_text: String,
}

impl Default for HealthcheckSection {
    fn default() -> Self {
        Self {
            working_text: "WORKING".to_string(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("No configuration file found in {0:?}")]
    NotFound(Vec<String>),
    #[error("Invalid value for {key}: {message}")]
    InvalidEnvValue { key: String, message: String },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BridgeConfig {
    /// Load configuration from a TOML file, apply environment overrides and validate
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: BridgeConfig = toml::from_str(&content)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate TOML content without consulting the environment
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the config file to use: the explicit path, or the first default that exists
    pub fn locate(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }

        DEFAULT_CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
            .ok_or_else(|| {
                ConfigError::NotFound(DEFAULT_CONFIG_PATHS.iter().map(|p| p.to_string()).collect())
            })
    }

    /// Apply `ARKADIKO_<SECTION>_<KEY>` overrides using the given lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mqtt = &mut self.mqttserver;
        override_string(&lookup, "MQTTSERVER_HOST", &mut mqtt.host);
        override_parsed(&lookup, "MQTTSERVER_PORT", &mut mqtt.port)?;
        override_string(&lookup, "MQTTSERVER_USER", &mut mqtt.user);
        override_string(&lookup, "MQTTSERVER_PASS", &mut mqtt.pass);
        override_parsed(&lookup, "MQTTSERVER_USETLS", &mut mqtt.usetls)?;
        override_string(&lookup, "MQTTSERVER_CA_CERT_FILE", &mut mqtt.ca_cert_file);
        override_parsed(&lookup, "MQTTSERVER_KEEP_ALIVE_SECS", &mut mqtt.keep_alive_secs)?;
        override_parsed(
            &lookup,
            "MQTTSERVER_CONNECT_TIMEOUT_MS",
            &mut mqtt.connect_timeout_ms,
        )?;

        let publish = &mut self.publish;
        override_parsed(&lookup, "PUBLISH_TRANSPORT", &mut publish.transport)?;
        override_parsed(&lookup, "PUBLISH_TIMEOUT_MS", &mut publish.timeout_ms)?;
        override_parsed(&lookup, "PUBLISH_MAX_ATTEMPTS", &mut publish.max_attempts)?;
        override_parsed(&lookup, "PUBLISH_BACKOFF_MS", &mut publish.backoff_ms)?;
        override_parsed(
            &lookup,
            "PUBLISH_RETRY_ON_TIMEOUT",
            &mut publish.retry_on_timeout,
        )?;

        let http = &mut self.httpserver;
        override_string(&lookup, "HTTPSERVER_URL", &mut http.url);
        override_string(&lookup, "HTTPSERVER_USER", &mut http.user);
        override_string(&lookup, "HTTPSERVER_PASS", &mut http.pass);
        override_parsed(&lookup, "HTTPSERVER_TIMEOUT_MS", &mut http.timeout_ms)?;
        override_parsed(&lookup, "HTTPSERVER_MAX_IDLE_CONNS", &mut http.max_idle_conns)?;

        override_string(&lookup, "BASICAUTH_USERNAME", &mut self.basicauth.username);
        override_string(&lookup, "BASICAUTH_PASSWORD", &mut self.basicauth.password);
        override_string(
            &lookup,
            "HEALTHCHECK_WORKING_TEXT",
            &mut self.healthcheck.working_text,
        );

        Ok(())
    }

    /// Reject configurations the bridge cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqttserver.host.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "mqttserver.host must not be empty".to_string(),
            ));
        }
        if self.mqttserver.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqttserver.port must be greater than zero".to_string(),
            ));
        }
        if self.mqttserver.keep_alive_secs < MIN_KEEP_ALIVE_SECS {
            return Err(ConfigError::InvalidConfig(format!(
                "mqttserver.keep_alive_secs must be at least {MIN_KEEP_ALIVE_SECS}"
            )));
        }
        if self.publish.max_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "publish.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.publish.timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "publish.timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.publish.transport == TransportKind::Http {
            url::Url::parse(&self.httpserver.url).map_err(|e| {
                ConfigError::InvalidConfig(format!(
                    "httpserver.url '{}' is not a valid URL: {e}",
                    self.httpserver.url
                ))
            })?;
        }
        Ok(())
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[mqttserver]
host = "localhost"
port = 1883

[publish]
timeout_ms = 200
max_attempts = 3
backoff_ms = 10
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

fn env_key(suffix: &str) -> String {
    format!("{ENV_PREFIX}_{suffix}")
}

fn override_string<F>(lookup: &F, suffix: &str, target: &mut String)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(&env_key(suffix)) {
        *target = value;
    }
}

fn override_parsed<F, T>(lookup: &F, suffix: &str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let key = env_key(suffix);
    if let Some(raw) = lookup(&key) {
        *target = raw
            .trim()
            .to_lowercase()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidEnvValue {
                key,
                message: e.to_string(),
            })?;
    }
    Ok(())
}

//! Bridge configuration.
//!
//! Configuration is read from a TOML file and then overridden from the
//! environment:
//!
//! ```toml
//! [device]
//! address = "C9:AE:AD:8D:1D:07"
//! name = "Radar"
//!
//! [sink]
//! kind = "mqtt"
//! host = "192.168.1.20"
//! port = 1883
//!
//! [session]
//! max_reconnect_attempts = 5
//!
//! [status]
//! listen = "127.0.0.1:8099"
//! ```
//!
//! Missing files and sections fall back to defaults.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::format::CoordinateFormat;

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "RADARLINK_CONFIG";

/// Environment variables that override file values.
pub mod env_vars {
    /// Radar Bluetooth address.
    pub const DEVICE_ADDRESS: &str = "RADARLINK_DEVICE_ADDRESS";
    /// Device name used in commands and topics.
    pub const DEVICE_NAME: &str = "RADARLINK_DEVICE_NAME";
    /// Sink kind, `http` or `mqtt`.
    pub const SINK: &str = "RADARLINK_SINK";
    /// Consumer host or broker address.
    pub const CONSUMER_HOST: &str = "RADARLINK_CONSUMER_HOST";
    /// Consumer or broker port.
    pub const CONSUMER_PORT: &str = "RADARLINK_CONSUMER_PORT";
    /// Status API listen address.
    pub const STATUS_LISTEN: &str = "RADARLINK_STATUS_LISTEN";
}

static MAC_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9A-Fa-f]{2}:){5}[0-9A-Fa-f]{2}$").expect("Valid MAC regex")
});

static COMPACT_MAC_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9A-Fa-f]{12}$").expect("Valid compact MAC regex"));

/// Placeholder address meaning "no radar configured yet".
pub const UNCONFIGURED_ADDRESS: &str = "00:00:00:00:00:00";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read {path}: {source}")]
    ReadError {
        /// File path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for this schema.
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] toml::de::Error),

    /// A single value failed validation.
    #[error("Invalid {field}: {message}")]
    ValidationError {
        /// Offending field.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several values failed validation.
    #[error("Configuration has {} errors", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Complete bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The radar.
    pub device: DeviceConfig,
    /// Where readings go.
    pub sink: SinkConfig,
    /// Reconnect behavior.
    pub session: SessionConfig,
    /// Local status API.
    pub status: StatusConfig,
    /// Log output.
    pub logging: LoggingConfig,
}

/// Radar device settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Bluetooth address, `AA:BB:CC:DD:EE:FF` or `AABBCCDDEEFF`.
    pub address: String,
    /// Name used in consumer commands and topics.
    pub name: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: UNCONFIGURED_ADDRESS.to_string(),
            name: "Radar".to_string(),
        }
    }
}

/// Consumer transport selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SinkConfig {
    /// Batched commands over HTTP.
    Http(HttpSinkConfig),
    /// JSON records over MQTT.
    Mqtt(MqttSinkConfig),
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self::Mqtt(MqttSinkConfig::default())
    }
}

impl SinkConfig {
    /// Transport name.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Http(_) => "http",
            Self::Mqtt(_) => "mqtt",
        }
    }

    fn host_mut(&mut self) -> &mut String {
        match self {
            Self::Http(config) => &mut config.host,
            Self::Mqtt(config) => &mut config.host,
        }
    }

    fn port_mut(&mut self) -> &mut u16 {
        match self {
            Self::Http(config) => &mut config.port,
            Self::Mqtt(config) => &mut config.port,
        }
    }

    fn host(&self) -> &str {
        match self {
            Self::Http(config) => &config.host,
            Self::Mqtt(config) => &config.host,
        }
    }

    fn port(&self) -> u16 {
        match self {
            Self::Http(config) => config.port,
            Self::Mqtt(config) => config.port,
        }
    }
}

/// HTTP batch-command consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSinkConfig {
    /// Consumer host.
    pub host: String,
    /// Consumer web port.
    pub port: u16,
    /// Timeout for each forwarded request.
    pub timeout_secs: u64,
    /// Timeout for the initial `connecting` report.
    pub startup_timeout_secs: u64,
    /// Coordinate rendering.
    pub coordinate_format: CoordinateFormat,
}

impl Default for HttpSinkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8083,
            timeout_secs: 5,
            startup_timeout_secs: 10,
            coordinate_format: CoordinateFormat::Millimeters,
        }
    }
}

/// MQTT structured-message consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSinkConfig {
    /// Broker host.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// MQTT client identifier.
    pub client_id: String,
    /// First topic level.
    pub namespace: String,
    /// Keep-alive interval.
    pub keep_alive_secs: u64,
    /// Time allowed for the broker to accept the connection.
    pub connect_timeout_secs: u64,
    /// Coordinate rendering.
    pub coordinate_format: CoordinateFormat,
}

impl Default for MqttSinkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "radarlink".to_string(),
            namespace: "fhem".to_string(),
            keep_alive_secs: 60,
            connect_timeout_secs: 10,
            coordinate_format: CoordinateFormat::MetersSwapped,
        }
    }
}

/// Connection lifecycle timings and limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Consecutive failures before the radio stack is restarted.
    pub max_reconnect_attempts: u32,
    /// Pause between reconnect attempts.
    pub backoff_secs: u64,
    /// Pause before every connection attempt.
    pub settle_delay_ms: u64,
    /// Pause after a radio stack restart.
    pub recovery_settle_secs: u64,
    /// Longest a radio stack restart may take.
    pub remediation_timeout_secs: u64,
    /// How often the link is checked while streaming.
    pub poll_interval_ms: u64,
    /// Pause between the start command and arming notifications.
    pub command_delay_ms: u64,
    /// How long to scan for an uncached device.
    pub discovery_timeout_secs: u64,
    /// Command restarting the radio stack.
    pub remediation_command: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            backoff_secs: 5,
            settle_delay_ms: 1000,
            recovery_settle_secs: 10,
            remediation_timeout_secs: 60,
            poll_interval_ms: 1000,
            command_delay_ms: 200,
            discovery_timeout_secs: 20,
            remediation_command: vec![
                "systemctl".to_string(),
                "restart".to_string(),
                "bluetooth".to_string(),
            ],
        }
    }
}

/// Local status API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    /// Listen address; the API is disabled when unset.
    pub listen: Option<SocketAddr>,
}

/// Log output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// JSON file logs plus compact stdout instead of pretty stdout.
    pub production: bool,
}

impl Config {
    /// Load from `RADARLINK_CONFIG` or the default path, then apply
    /// environment overrides and validate.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or
    /// if the resulting configuration is invalid.
    pub fn load() -> ConfigResult<Self> {
        let path = std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_config_path());

        let mut config = Self::load_or_default(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, or return defaults if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_or_default(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.display().to_string(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Apply overrides looked up through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an unknown sink kind or a value that
    /// does not parse.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(kind) = lookup(env_vars::SINK) {
            let wanted = kind.trim().to_lowercase();
            if wanted != self.sink.kind() {
                self.sink = match wanted.as_str() {
                    "http" => SinkConfig::Http(HttpSinkConfig::default()),
                    "mqtt" => SinkConfig::Mqtt(MqttSinkConfig::default()),
                    _ => {
                        return Err(ConfigError::ValidationError {
                            field: env_vars::SINK.to_string(),
                            message: format!("unknown sink kind '{kind}', expected http or mqtt"),
                        })
                    }
                };
            }
        }

        if let Some(address) = lookup(env_vars::DEVICE_ADDRESS) {
            self.device.address = address;
        }
        if let Some(name) = lookup(env_vars::DEVICE_NAME) {
            self.device.name = name;
        }
        if let Some(host) = lookup(env_vars::CONSUMER_HOST) {
            *self.sink.host_mut() = host;
        }
        if let Some(port) = lookup(env_vars::CONSUMER_PORT) {
            *self.sink.port_mut() = port.trim().parse().map_err(|_| ConfigError::ValidationError {
                field: env_vars::CONSUMER_PORT.to_string(),
                message: format!("'{port}' is not a port number"),
            })?;
        }
        if let Some(listen) = lookup(env_vars::STATUS_LISTEN) {
            let addr = listen.trim().parse().map_err(|_| ConfigError::ValidationError {
                field: env_vars::STATUS_LISTEN.to_string(),
                message: format!("'{listen}' is not a socket address"),
            })?;
            self.status.listen = Some(addr);
        }

        Ok(())
    }

    /// Bring values into canonical form, e.g. expand compact MAC addresses.
    pub fn normalize(&mut self) {
        if let Some(address) = normalize_mac_address(&self.device.address) {
            self.device.address = address;
        }
        self.device.name = self.device.name.trim().to_string();
    }

    /// Check every value and report all problems at once.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for a single problem or
    /// [`ConfigError::MultipleValidationErrors`] for several.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        let mut invalid = |field: &str, message: &str| {
            errors.push(ConfigError::ValidationError {
                field: field.to_string(),
                message: message.to_string(),
            });
        };

        if self.device.address == UNCONFIGURED_ADDRESS {
            invalid("device.address", "no radar configured");
        } else if !is_valid_mac_address(&self.device.address) {
            invalid("device.address", "expected a Bluetooth address like AA:BB:CC:DD:EE:FF");
        }
        if self.device.name.is_empty() || self.device.name.contains(char::is_whitespace) {
            invalid("device.name", "must be a single non-empty word");
        }
        if self.sink.host().trim().is_empty() {
            invalid("sink.host", "must not be empty");
        }
        if self.sink.port() == 0 {
            invalid("sink.port", "must not be 0");
        }
        if let SinkConfig::Mqtt(mqtt) = &self.sink {
            if mqtt.client_id.trim().is_empty() {
                invalid("sink.client_id", "must not be empty");
            }
            if mqtt.namespace.trim().is_empty() {
                invalid("sink.namespace", "must not be empty");
            }
        }
        if self.session.max_reconnect_attempts == 0 {
            invalid("session.max_reconnect_attempts", "must be at least 1");
        }
        if self.session.poll_interval_ms == 0 || self.session.poll_interval_ms > 1000 {
            invalid("session.poll_interval_ms", "must be between 1 and 1000");
        }
        if self.session.remediation_timeout_secs == 0 {
            invalid("session.remediation_timeout_secs", "must be at least 1");
        }
        if self.session.remediation_command.is_empty() {
            invalid("session.remediation_command", "must name a program");
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }
}

/// Whether `address` is a colon-separated Bluetooth address.
#[must_use]
pub fn is_valid_mac_address(address: &str) -> bool {
    MAC_REGEX.is_match(address)
}

/// Convert `c9aead8d1d07` or `c9:ae:ad:8d:1d:07` into `C9:AE:AD:8D:1D:07`.
///
/// Returns `None` for anything that is not a Bluetooth address.
#[must_use]
pub fn normalize_mac_address(address: &str) -> Option<String> {
    let address = address.trim();
    if is_valid_mac_address(address) {
        return Some(address.to_uppercase());
    }
    if !COMPACT_MAC_REGEX.is_match(address) {
        return None;
    }

    let upper = address.to_uppercase();
    let pairs: Vec<&str> = (0..6).map(|i| &upper[i * 2..i * 2 + 2]).collect();
    Some(pairs.join(":"))
}

/// Default configuration file location.
///
/// On Linux: `/etc/radarlink/config.toml`; elsewhere the platform config dir.
#[must_use]
pub fn default_config_path() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/etc/radarlink/config.toml")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "radarlink").map_or_else(
            || PathBuf::from("radarlink.toml"),
            |dirs| dirs.config_dir().join("config.toml"),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.device.address = "C9:AE:AD:8D:1D:07".to_string();
        config
    }

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.device.name, "Radar");
        assert_eq!(config.session.max_reconnect_attempts, 5);
        assert_eq!(config.session.backoff_secs, 5);
        assert_eq!(config.session.recovery_settle_secs, 10);
        assert_eq!(config.session.remediation_timeout_secs, 60);
        assert_eq!(config.sink.kind(), "mqtt");
        assert!(config.status.listen.is_none());
    }

    #[test]
    fn test_mac_address_validation() {
        assert!(is_valid_mac_address("C9:AE:AD:8D:1D:07"));
        assert!(is_valid_mac_address("c9:ae:ad:8d:1d:07"));
        assert!(!is_valid_mac_address("C9AEAD8D1D07"));
        assert!(!is_valid_mac_address("C9:AE:AD:8D:1D"));
        assert!(!is_valid_mac_address("ZZ:AE:AD:8D:1D:07"));
    }

    #[test]
    fn test_normalize_compact_mac_address() {
        assert_eq!(
            normalize_mac_address("c9aead8d1d07").as_deref(),
            Some("C9:AE:AD:8D:1D:07")
        );
        assert_eq!(
            normalize_mac_address(" c9:ae:ad:8d:1d:07 ").as_deref(),
            Some("C9:AE:AD:8D:1D:07")
        );
        assert_eq!(normalize_mac_address("not-a-mac"), None);
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.device.name, "Radar");
    }

    #[test]
    fn test_load_http_sink_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[device]
address = "c9aead8d1d07"
name = "Hallway"

[sink]
kind = "http"
host = "192.168.69.32"
port = 8083

[session]
max_reconnect_attempts = 3

[status]
listen = "127.0.0.1:8099"
"#
        )
        .unwrap();

        let mut config = Config::load_or_default(file.path()).unwrap();
        config.normalize();
        config.validate().unwrap();

        assert_eq!(config.device.address, "C9:AE:AD:8D:1D:07");
        assert_eq!(config.device.name, "Hallway");
        assert_eq!(config.session.max_reconnect_attempts, 3);
        assert_eq!(config.session.backoff_secs, 5);
        assert_eq!(config.status.listen, Some("127.0.0.1:8099".parse().unwrap()));

        match config.sink {
            SinkConfig::Http(http) => {
                assert_eq!(http.host, "192.168.69.32");
                assert_eq!(http.timeout_secs, 5);
                assert_eq!(http.coordinate_format, CoordinateFormat::Millimeters);
            }
            SinkConfig::Mqtt(_) => panic!("expected http sink"),
        }
    }

    #[test]
    fn test_load_rejects_unknown_sink_kind() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[sink]\nkind = \"carrier-pigeon\"").unwrap();
        assert!(matches!(
            Config::load_or_default(file.path()),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = valid_config();
        config
            .apply_overrides(lookup(&[
                (env_vars::SINK, "http"),
                (env_vars::CONSUMER_HOST, "10.0.0.5"),
                (env_vars::CONSUMER_PORT, "8085"),
                (env_vars::DEVICE_NAME, "Kitchen"),
                (env_vars::STATUS_LISTEN, "0.0.0.0:9000"),
            ]))
            .unwrap();

        assert_eq!(config.device.name, "Kitchen");
        assert_eq!(config.status.listen, Some("0.0.0.0:9000".parse().unwrap()));
        match &config.sink {
            SinkConfig::Http(http) => {
                assert_eq!(http.host, "10.0.0.5");
                assert_eq!(http.port, 8085);
            }
            SinkConfig::Mqtt(_) => panic!("expected http sink"),
        }
    }

    #[test]
    fn test_env_override_rejects_bad_port() {
        let mut config = valid_config();
        let err = config
            .apply_overrides(lookup(&[(env_vars::CONSUMER_PORT, "eighty")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn test_env_override_rejects_unknown_sink() {
        let mut config = valid_config();
        assert!(config
            .apply_overrides(lookup(&[(env_vars::SINK, "smoke-signal")]))
            .is_err());
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut config = Config::default();
        config.device.address = "nope".to_string();
        config.session.max_reconnect_attempts = 0;
        config.session.poll_interval_ms = 5000;

        match config.validate() {
            Err(ConfigError::MultipleValidationErrors(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_validation_single_error() {
        let mut config = valid_config();
        config.device.name = "Living Room".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError { field, .. }) if field == "device.name"
        ));
    }

    #[test]
    fn test_placeholder_address_is_rejected() {
        assert!(matches!(
            Config::default().validate(),
            Err(ConfigError::ValidationError { field, .. }) if field == "device.address"
        ));
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }
}

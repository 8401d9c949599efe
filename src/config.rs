//! Configuration loading and validation
//!
//! Configuration is TOML with `[device]`, `[transport]`, and `[reconnect]`
//! sections. SAS tokens are never stored in the file; the file names an
//! environment variable resolved at runtime through [`EnvTokenProvider`].

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level configuration for one hub connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HubConfig {
    pub device: DeviceSection,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
}

/// Device identity and credential configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Hub hostname, e.g. `contoso.azure-devices.net`
    pub hostname: String,
    /// Device identifier registered with the hub
    pub device_id: String,
    /// Optional module identifier for module identities
    pub module_id: Option<String>,
    /// Environment variable holding the current SAS token
    pub sas_token_env: Option<String>,
    /// Use the connection's X.509 client certificate instead of SAS tokens
    #[serde(default)]
    pub use_x509: bool,
    /// Assumed SAS token lifetime in seconds (default: 3600)
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
    /// Optional IoT Plug and Play model id advertised on worker links
    pub model_id: Option<String>,
    /// User-agent string advertised on worker links
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

/// Transport timing configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportSection {
    /// AMQP over TLS port (default: 5671)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bounded wait for open/close in seconds (default: 60)
    #[serde(default = "default_open_timeout_secs")]
    pub open_timeout_secs: u64,
    /// Bounded wait for authentication and link opening in seconds (default: 10)
    #[serde(default = "default_authentication_timeout_secs")]
    pub authentication_timeout_secs: u64,
    /// Connection idle timeout in seconds (default: 230)
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            open_timeout_secs: default_open_timeout_secs(),
            authentication_timeout_secs: default_authentication_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl TransportSection {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }

    pub fn authentication_timeout(&self) -> Duration {
        Duration::from_secs(self.authentication_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Reconnection policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    /// Maximum reconnection attempts (default: unlimited)
    pub max_attempts: Option<u32>,
    /// First backoff delay in milliseconds (default: 100)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Backoff ceiling in milliseconds (default: 30000)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            max_attempts: None,
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_token_ttl_secs() -> u64 {
    3600
}

fn default_user_agent() -> String {
    crate::protocol::client_version()
}

fn default_port() -> u16 {
    5671
}

fn default_open_timeout_secs() -> u64 {
    60
}

fn default_authentication_timeout_secs() -> u64 {
    10
}

fn default_idle_timeout_secs() -> u64 {
    230
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    30_000
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid device ID format: {0}")]
    InvalidDeviceId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl HubConfig {
    /// Load configuration from a TOML file and validate it.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: HubConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.hostname.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "[device] hostname must not be empty".to_string(),
            ));
        }
        validate_device_id(&self.device.device_id)?;
        if let Some(module) = &self.device.module_id {
            validate_device_id(module)?;
        }
        if !self.device.use_x509 && self.device.sas_token_env.is_none() {
            return Err(ConfigError::InvalidConfig(
                "[device] requires either sas_token_env or use_x509".to_string(),
            ));
        }
        if self.reconnect.base_delay_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "[reconnect] base_delay_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[device]
hostname = "hub.example.net"
device_id = "test-device"
sas_token_env = "HUBLINK_TEST_SAS"
"#;
        toml::from_str(toml_content).expect("test config must parse")
    }
}

/// Device ids are restricted to alphanumerics plus `-`, `_`, and `.`.
fn validate_device_id(id: &str) -> Result<(), ConfigError> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidDeviceId(id.to_string()))
    }
}

/// A SAS token with its remaining validity.
#[derive(Debug, Clone, PartialEq)]
pub struct SasToken {
    pub token: String,
    pub ttl: Duration,
}

/// Source of the device's current SAS token.
///
/// Implementations are consulted on every put-token request so renewed
/// tokens are picked up without restarting the transport.
pub trait TokenProvider: Send + Sync {
    /// Current token and its remaining validity.
    fn current_token(&self) -> Result<SasToken, ConfigError>;

    /// Whether the token needs renewal before further sends.
    fn is_expired(&self) -> bool {
        false
    }
}

/// Token provider resolving the token from an environment variable.
pub struct EnvTokenProvider {
    variable: String,
    ttl: Duration,
}

impl EnvTokenProvider {
    pub fn new(variable: impl Into<String>, ttl: Duration) -> Self {
        Self {
            variable: variable.into(),
            ttl,
        }
    }
}

impl TokenProvider for EnvTokenProvider {
    fn current_token(&self) -> Result<SasToken, ConfigError> {
        let token = std::env::var(&self.variable)
            .map_err(|_| ConfigError::EnvVarNotFound(self.variable.clone()))?;
        Ok(SasToken {
            token,
            ttl: self.ttl,
        })
    }
}

/// Device credentials: either a renewable SAS token source or the
/// connection's X.509 client certificate.
#[derive(Clone)]
pub enum Credentials {
    Sas(Arc<dyn TokenProvider>),
    X509,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Sas(_) => f.write_str("Credentials::Sas"),
            Credentials::X509 => f.write_str("Credentials::X509"),
        }
    }
}

impl Credentials {
    pub fn is_sas(&self) -> bool {
        matches!(self, Credentials::Sas(_))
    }
}

/// Runtime view of one device's identity, built from the config file.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub hostname: String,
    pub device_id: String,
    pub module_id: Option<String>,
    pub credentials: Credentials,
    pub user_agent: String,
    pub model_id: Option<String>,
}

impl DeviceConfig {
    /// Build the runtime device view from a validated `[device]` section.
    pub fn from_section(section: &DeviceSection) -> Result<Self, ConfigError> {
        let credentials = if section.use_x509 {
            Credentials::X509
        } else {
            let variable = section.sas_token_env.as_ref().ok_or_else(|| {
                ConfigError::InvalidConfig(
                    "[device] requires either sas_token_env or use_x509".to_string(),
                )
            })?;
            Credentials::Sas(Arc::new(EnvTokenProvider::new(
                variable.clone(),
                Duration::from_secs(section.token_ttl_secs),
            )))
        };
        Ok(Self {
            hostname: section.hostname.clone(),
            device_id: section.device_id.clone(),
            module_id: section.module_id.clone(),
            credentials,
            user_agent: section.user_agent.clone(),
            model_id: section.model_id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied() {
        let config = HubConfig::test_config();

        assert_eq!(config.transport.port, 5671);
        assert_eq!(config.transport.open_timeout_secs, 60);
        assert_eq!(config.transport.authentication_timeout_secs, 10);
        assert_eq!(config.reconnect.max_attempts, None);
        assert_eq!(config.reconnect.base_delay_ms, 100);
        assert_eq!(config.device.token_ttl_secs, 3600);
        assert!(config.device.user_agent.starts_with("hublink/"));
    }

    #[test]
    fn test_validate_accepts_test_config() {
        let config = HubConfig::test_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_credentials() {
        let mut config = HubConfig::test_config();
        config.device.sas_token_env = None;

        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_bad_device_id() {
        let mut config = HubConfig::test_config();
        config.device.device_id = "bad/device".to_string();

        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::InvalidDeviceId(_))));
    }

    #[test]
    fn test_x509_needs_no_token_env() {
        let mut config = HubConfig::test_config();
        config.device.sas_token_env = None;
        config.device.use_x509 = true;

        assert!(config.validate().is_ok());

        let device = DeviceConfig::from_section(&config.device).expect("runtime view");
        assert!(matches!(device.credentials, Credentials::X509));
    }

    #[test]
    fn test_env_token_provider_reports_missing_variable() {
        let provider =
            EnvTokenProvider::new("HUBLINK_DEFINITELY_UNSET_VAR", Duration::from_secs(60));

        let result = provider.current_token();
        assert!(matches!(result, Err(ConfigError::EnvVarNotFound(_))));
    }

    #[test]
    fn test_device_config_from_section() {
        let config = HubConfig::test_config();
        let device = DeviceConfig::from_section(&config.device).expect("runtime view");

        assert_eq!(device.hostname, "hub.example.net");
        assert_eq!(device.device_id, "test-device");
        assert!(device.module_id.is_none());
        assert!(device.credentials.is_sas());
    }

    #[test]
    fn test_reconnect_section_overrides() {
        let toml_content = r#"
[device]
hostname = "hub.example.net"
device_id = "dev"
sas_token_env = "T"

[reconnect]
max_attempts = 5
base_delay_ms = 50
"#;
        let config: HubConfig = toml::from_str(toml_content).expect("parse");
        assert_eq!(config.reconnect.max_attempts, Some(5));
        assert_eq!(config.reconnect.base_delay_ms, 50);
        assert_eq!(config.reconnect.max_delay_ms, 30_000);
    }
}

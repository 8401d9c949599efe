//! Configuration loading and validation tests
//!
//! Tests focus on BEHAVIOR of configuration loading, validation, and error
//! handling: observable outcomes, not TOML parsing internals.

use std::io::Write;

use hublink::config::{ConfigError, DeviceConfig, HubConfig};
use tempfile::NamedTempFile;

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[device]
hostname = "contoso.azure-devices.net"
device_id = "thermostat-01"
sas_token_env = "HUB_SAS_TOKEN"

[transport]
port = 5671
open_timeout_secs = 30

[reconnect]
max_attempts = 10
"#
    )
    .unwrap();

    let config = HubConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.device.hostname, "contoso.azure-devices.net");
    assert_eq!(config.device.device_id, "thermostat-01");
    assert_eq!(config.device.sas_token_env, Some("HUB_SAS_TOKEN".to_string()));
    assert_eq!(config.transport.port, 5671);
    assert_eq!(config.transport.open_timeout_secs, 30);
    assert_eq!(config.reconnect.max_attempts, Some(10));
}

#[test]
fn test_config_applies_defaults_for_omitted_sections() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[device]
hostname = "contoso.azure-devices.net"
device_id = "thermostat-01"
sas_token_env = "HUB_SAS_TOKEN"
"#
    )
    .unwrap();

    let config = HubConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.transport.port, 5671);
    assert_eq!(config.transport.open_timeout_secs, 60);
    assert_eq!(config.transport.authentication_timeout_secs, 10);
    assert_eq!(config.transport.idle_timeout_secs, 230);
    assert_eq!(config.reconnect.max_attempts, None);
    assert_eq!(config.reconnect.base_delay_ms, 100);
    assert_eq!(config.reconnect.max_delay_ms, 30_000);
    assert_eq!(config.device.token_ttl_secs, 3600);
}

#[test]
fn test_config_loads_with_optional_device_fields() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[device]
hostname = "contoso.azure-devices.net"
device_id = "gateway-01"
module_id = "edge-module"
sas_token_env = "HUB_SAS_TOKEN"
model_id = "dtmi:com:example:Thermostat;1"
token_ttl_secs = 1800
"#
    )
    .unwrap();

    let config = HubConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.device.module_id, Some("edge-module".to_string()));
    assert_eq!(
        config.device.model_id,
        Some("dtmi:com:example:Thermostat;1".to_string())
    );
    assert_eq!(config.device.token_ttl_secs, 1800);
}

#[test]
fn test_config_rejects_missing_credentials() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[device]
hostname = "contoso.azure-devices.net"
device_id = "thermostat-01"
"#
    )
    .unwrap();

    let result = HubConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_config_accepts_x509_without_token_env() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[device]
hostname = "contoso.azure-devices.net"
device_id = "thermostat-01"
use_x509 = true
"#
    )
    .unwrap();

    let config = HubConfig::load_from_file(temp_file.path()).unwrap();
    let device = DeviceConfig::from_section(&config.device).unwrap();
    assert!(!device.credentials.is_sas());
}

#[test]
fn test_config_rejects_invalid_device_id() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[device]
hostname = "contoso.azure-devices.net"
device_id = "bad/device id"
sas_token_env = "HUB_SAS_TOKEN"
"#
    )
    .unwrap();

    let result = HubConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidDeviceId(_))));
}

#[test]
fn test_config_rejects_zero_base_delay() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[device]
hostname = "contoso.azure-devices.net"
device_id = "thermostat-01"
sas_token_env = "HUB_SAS_TOKEN"

[reconnect]
base_delay_ms = 0
"#
    )
    .unwrap();

    let result = HubConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_config_reports_missing_file() {
    let result = HubConfig::load_from_file(std::path::Path::new("/definitely/not/here.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_config_reports_malformed_toml() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "this is not toml [").unwrap();

    let result = HubConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

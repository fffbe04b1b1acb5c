use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{net::SocketAddr, path::PathBuf};
use wxctl_homie::{ConnectionConfig, TlsMaterial};

use crate::ConfigError;

/// Whole controller configuration as persisted and as accepted on
/// `$implementation/config/set`. Every section and field is optional in the
/// JSON; missing ones take their default.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub homie: HomieConfig,
    pub radio: RadioConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub ssl: bool,
    pub ssl_config: SslConfig,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "iot.eclipse.org".to_string(),
            port: 1883,
            ssl: true,
            ssl_config: SslConfig::default(),
        }
    }
}

/// PEM file paths; empty means unset
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct SslConfig {
    pub ca: String,
    pub client_cert: String,
    pub privkey: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct HomieConfig {
    pub name: String,
    pub prefix: String,
}

impl Default for HomieConfig {
    fn default() -> Self {
        Self {
            name: "weatherStation".to_string(),
            prefix: "devices/".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RadioConfig {
    pub network_id: u8,
    pub node_id: u8,
    pub encryption_key: String,
    /// Band in MHz, e.g. `"868"`
    pub frequency: String,
    /// Local address the radio bridge datagrams arrive on
    pub bind: SocketAddr,
    /// Address of the radio bridge
    pub bridge: SocketAddr,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            network_id: 100,
            node_id: 1,
            encryption_key: "sampleEncryptKey".to_string(),
            frequency: "868".to_string(),
            bind: SocketAddr::from(([0, 0, 0, 0], 7470)),
            bridge: SocketAddr::from(([127, 0, 0, 1], 7471)),
        }
    }
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Overlay a partial JSON document on this configuration and return the
    /// result. Objects are merged key by key, any other value replaces what
    /// was there. `self` is left untouched when the patch does not parse or
    /// does not produce a valid configuration.
    pub fn merge(&self, patch: &str) -> Result<Self, ConfigError> {
        let patch: Value = serde_json::from_str(patch)?;
        if !patch.is_object() {
            return Err(ConfigError::Json(serde::de::Error::custom(
                "configuration patch must be a JSON object",
            )));
        }
        let mut merged = serde_json::to_value(self)?;
        merge_values(&mut merged, patch);
        Ok(serde_json::from_value(merged)?)
    }
}

fn merge_values(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, patch) => *base = patch,
    }
}

fn path(value: &str) -> Option<PathBuf> {
    (!value.is_empty()).then(|| PathBuf::from(value))
}

impl From<&Config> for ConnectionConfig {
    fn from(config: &Config) -> Self {
        let ssl = &config.mqtt.ssl_config;
        Self {
            host: config.mqtt.host.clone(),
            port: config.mqtt.port,
            ssl: config.mqtt.ssl,
            tls: TlsMaterial {
                ca: path(&ssl.ca),
                client_cert: path(&ssl.client_cert),
                private_key: path(&ssl.privkey),
            },
            prefix: config.homie.prefix.clone(),
            device_name: config.homie.name.clone(),
            ..Default::default()
        }
    }
}

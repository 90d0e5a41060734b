//! Configuration (spec §6): TOML file with defaults for every section.
//!
//! Grounded on the teacher's `Config`/`load`/`Default` structure,
//! generalized from the single-socket Phase 1 shape to the two-socket
//! uplink/downlink model plus directory/publisher/subscriber/mqtt sections.

use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub udp: UdpConfig,
    #[serde(default)]
    pub lorawan: LorawanConfig,
    #[serde(default)]
    pub directory: Option<DirectoryConfig>,
    #[serde(default)]
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub subscriber: SubscriberConfig,
    #[serde(default)]
    pub mqtt: Option<MqttConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct UdpConfig {
    pub uplink_bind: String,
    pub downlink_bind: String,
}

#[derive(Debug, Deserialize)]
pub struct LorawanConfig {
    pub decrypt_payload: bool,
    pub verify_mic: bool,
}

impl Default for LorawanConfig {
    fn default() -> Self {
        Self {
            decrypt_payload: true,
            verify_mic: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryConfig {
    pub url: String,
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct PublisherConfig {
    pub topic: String,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            topic: "uplink".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SubscriberConfig {
    pub topic: String,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            topic: "downlink-request".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_mqtt_port() -> u16 {
    1883
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {:?}: {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("failed to parse config file: {}", e))?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            udp: UdpConfig {
                uplink_bind: "0.0.0.0:1730".to_string(),
                downlink_bind: "0.0.0.0:1700".to_string(),
            },
            lorawan: LorawanConfig::default(),
            directory: None,
            publisher: PublisherConfig::default(),
            subscriber: SubscriberConfig::default(),
            mqtt: None,
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_binds_match_spec_ports() {
        let config = Config::default();
        assert_eq!(config.udp.uplink_bind, "0.0.0.0:1730");
        assert_eq!(config.udp.downlink_bind, "0.0.0.0:1700");
    }

    #[test]
    fn parses_full_toml() {
        let toml = r#"
            [udp]
            uplink_bind = "0.0.0.0:1730"
            downlink_bind = "0.0.0.0:1700"

            [lorawan]
            decrypt_payload = true
            verify_mic = true

            [directory]
            url = "https://directory.example.com/devices"
            token = "secret"

            [publisher]
            topic = "uplink"

            [subscriber]
            topic = "downlink-request"

            [mqtt]
            host = "mqtt.example.com"
            port = 8883

            [logging]
            level = "debug"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.directory.unwrap().url, "https://directory.example.com/devices");
        assert_eq!(config.mqtt.unwrap().port, 8883);
        assert_eq!(config.logging.level, "debug");
    }
}

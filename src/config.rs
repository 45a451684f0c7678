//! Bridge configuration
//!
//! Loaded from a TOML file, then overridden by the `MQTT_*` / `FAN_*`
//! environment variables. Every field has a default so an empty file (or
//! no file at all) yields a bridge that runs without a broker.

use crate::bridge::automation::FanThresholds;
use crate::error::BridgeError;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = "aluna-bridge";
const CONFIG_FILE: &str = "bridge.toml";

pub const DEFAULT_QOS: u8 = 1;

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    pub broker: BrokerConfig,
    pub topics: TopicConfig,
    pub automation: FanThresholds,
    pub stream: StreamConfig,
    /// Settled commands older than this are swept from the store; unset keeps them forever
    pub pending_retention_secs: Option<u64>,
    pub debug: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    /// `mqtt://host:port`, `mqtts://host:port` or `host:port`; unset disables the connection
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
    pub qos: u8,
    pub clean_session: bool,
    pub keep_alive_secs: u64,
    pub reconnect_interval_secs: u64,
    pub publish_timeout_secs: u64,
    pub inbound_buffer: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: None,
            username: None,
            password: None,
            client_id: None,
            qos: DEFAULT_QOS,
            clean_session: true,
            keep_alive_secs: 30,
            reconnect_interval_secs: 5,
            publish_timeout_secs: 10,
            inbound_buffer: 256,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TopicConfig {
    pub telemetry: String,
    pub ack_pattern: String,
    pub command_template: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            telemetry: "aluna/telemetry".to_string(),
            ack_pattern: "aluna/devices/+/ack".to_string(),
            command_template: "aluna/commands/<deviceId>/<channel>".to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    pub keep_alive_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self { keep_alive_secs: 15 }
    }
}

/// Host, port and transport parsed from the broker url
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerAddress {
    pub fn parse(url: &str) -> Result<Self, BridgeError> {
        let url = url.trim();
        let (scheme, rest) = match url.split_once("://") {
            Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
            None => ("mqtt".to_string(), url),
        };

        let tls = match scheme.as_str() {
            "mqtt" | "tcp" => false,
            "mqtts" | "ssl" => true,
            other => {
                return Err(BridgeError::Config(format!(
                    "Unsupported broker scheme `{}` in `{}`",
                    other, url
                )))
            }
        };

        let authority = rest.split('/').next().unwrap_or_default();
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|e| {
                    BridgeError::Config(format!("Invalid broker port `{}`: {}", port, e))
                })?;
                (host, port)
            }
            None => (authority, if tls { 8883 } else { 1883 }),
        };

        if host.is_empty() {
            return Err(BridgeError::Config(format!(
                "Broker url `{}` has no host",
                url
            )));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }
}

impl BrokerConfig {
    /// QoS level to use, falling back to 1 for anything outside 0..=2
    pub fn qos_level(&self) -> u8 {
        if self.qos <= 2 {
            self.qos
        } else {
            warn!("Invalid QoS {}, using {}", self.qos, DEFAULT_QOS);
            DEFAULT_QOS
        }
    }

    pub fn resolved_client_id(&self) -> String {
        match &self.client_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => {
                let random = uuid::Uuid::new_v4().simple().to_string();
                format!("aluna-backend-{}", &random[..12])
            }
        }
    }
}

impl BridgeConfig {
    /// Loads the config file (explicit path, else the user config dir if a
    /// file exists there, else defaults) and applies environment overrides
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => match default_config_path() {
                Some(path) if tokio::fs::try_exists(&path).await.unwrap_or(false) => Some(path),
                _ => None,
            },
        };

        let mut config = match path {
            Some(path) => {
                info!("Loading bridge config from {}", path.display());
                let content = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
                Self::from_toml(&content)?
            }
            None => {
                debug!("No config file found, using defaults");
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| eyre!("Failed to parse bridge config: {}", e))
    }

    /// Applies the environment variable overrides through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(url) = non_empty("MQTT_URL") {
            self.broker.url = Some(url);
        }
        if let Some(username) = non_empty("MQTT_USERNAME") {
            self.broker.username = Some(username);
        }
        if let Some(password) = lookup("MQTT_PASSWORD") {
            self.broker.password = Some(password);
        }
        if let Some(client_id) = non_empty("MQTT_CLIENT_ID") {
            self.broker.client_id = Some(client_id);
        }
        if let Some(qos) = non_empty("MQTT_QOS") {
            self.broker.qos = match qos.trim().parse::<u8>() {
                Ok(level) if level <= 2 => level,
                _ => {
                    warn!("Ignoring MQTT_QOS={}, using {}", qos, DEFAULT_QOS);
                    DEFAULT_QOS
                }
            };
        }
        if let Some(clean) = lookup("MQTT_CLEAN_SESSION") {
            self.broker.clean_session = clean != "false";
        }
        if let Some(debug) = lookup("MQTT_DEBUG") {
            self.debug = debug == "1" || debug == "true";
        }

        if let Some(topic) = non_empty("MQTT_TELEMETRY_TOPIC") {
            self.topics.telemetry = topic;
        }
        if let Some(topic) = non_empty("MQTT_ACK_TOPIC") {
            self.topics.ack_pattern = topic;
        }
        if let Some(template) = non_empty("MQTT_COMMAND_TOPIC_TEMPLATE") {
            self.topics.command_template = template;
        }

        let threshold = |key: &str, current: f64| -> f64 {
            match lookup(key).and_then(|raw| raw.trim().parse::<f64>().ok()) {
                Some(value) if value.is_finite() => value,
                _ => current,
            }
        };
        self.automation.temp_on = threshold("FAN_TEMP_ON", self.automation.temp_on);
        self.automation.temp_off = threshold("FAN_TEMP_OFF", self.automation.temp_off);
        self.automation.hum_on = threshold("FAN_HUM_ON", self.automation.hum_on);
        self.automation.hum_off = threshold("FAN_HUM_OFF", self.automation.hum_off);
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
}

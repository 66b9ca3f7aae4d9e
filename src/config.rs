use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::connection::SessionTuning;
use crate::transport::DEFAULT_MQTT_PORT;

const DEFAULT_SETTINGS_PATH: &str = "smp_settings.json";
const DEFAULT_TAG_PATH: &str = "smp_tag.url";
const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;

#[derive(Debug, Deserialize, Default)]
struct PublisherConfigFile {
    settings_path: Option<PathBuf>,
    tag_path: Option<PathBuf>,
    mqtt: Option<MqttConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    port: Option<u16>,
    keep_alive_secs: Option<u64>,
}

/// Runtime configuration of the publisher process.
///
/// Loaded from the file named by `SMP_CONFIG` (JSON, or TOML when the file
/// ends in `.toml`), then overridden by `SMP_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherConfig {
    pub settings_path: PathBuf,
    pub tag_path: PathBuf,
    pub mqtt_port: u16,
    pub keep_alive: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            settings_path: PathBuf::from(DEFAULT_SETTINGS_PATH),
            tag_path: PathBuf::from(DEFAULT_TAG_PATH),
            mqtt_port: DEFAULT_MQTT_PORT,
            keep_alive: Duration::from_secs(DEFAULT_KEEP_ALIVE_SECS),
        }
    }
}

impl PublisherConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SMP_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PublisherConfigFile) -> Self {
        let defaults = Self::default();
        let mqtt = file.mqtt.unwrap_or_default();
        Self {
            settings_path: file.settings_path.unwrap_or(defaults.settings_path),
            tag_path: file.tag_path.unwrap_or(defaults.tag_path),
            mqtt_port: mqtt.port.unwrap_or(defaults.mqtt_port),
            keep_alive: mqtt
                .keep_alive_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.keep_alive),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("SMP_SETTINGS_PATH") {
            if !path.trim().is_empty() {
                self.settings_path = PathBuf::from(path);
            }
        }
        if let Ok(path) = std::env::var("SMP_TAG_PATH") {
            if !path.trim().is_empty() {
                self.tag_path = PathBuf::from(path);
            }
        }
        if let Ok(port) = std::env::var("SMP_MQTT_PORT") {
            self.mqtt_port = port
                .trim()
                .parse()
                .map_err(|_| anyhow!("SMP_MQTT_PORT must be a port number"))?;
        }
        if let Ok(keep_alive) = std::env::var("SMP_KEEP_ALIVE_SECS") {
            let seconds: u64 = keep_alive.trim().parse().map_err(|_| {
                anyhow!("SMP_KEEP_ALIVE_SECS must be an integer number of seconds")
            })?;
            self.keep_alive = Duration::from_secs(seconds);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.mqtt_port == 0 {
            return Err(anyhow!("MQTT port must be greater than zero"));
        }
        if self.keep_alive.as_secs() == 0 {
            return Err(anyhow!("keep-alive must be greater than zero"));
        }
        Ok(())
    }

    pub fn session_tuning(&self) -> SessionTuning {
        SessionTuning {
            default_port: self.mqtt_port,
            keep_alive: self.keep_alive,
        }
    }
}

fn read_config_file(path: &Path) -> Result<PublisherConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

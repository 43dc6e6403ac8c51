//! Coordinator configuration
//!
//! Loaded from a TOML file; every field has a default so an empty file (or
//! no file at all) yields a usable development setup.

use crate::command::DispatcherConfig;
use crate::error::ConfigError;
use meshcoord_shared::defaults;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Serial port settings for the coordinator radio
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Device path, e.g. `/dev/ttyACM0`
    pub path: String,
    pub baud_rate: u32,
    /// Hardware (RTS/CTS) flow control
    pub rtscts: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            path: "/dev/ttyACM0".into(),
            baud_rate: defaults::SERIAL_BAUD_RATE,
            rtscts: false,
        }
    }
}

/// Network formation parameters
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// PAN id as hex text (`0x1a62` or `1a62`)
    pub pan_id: Option<String>,
    /// Network key as hex byte pairs; separators are ignored
    pub network_key: Option<String>,
    pub channel_list: Vec<u8>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            pan_id: None,
            network_key: None,
            channel_list: vec![11],
        }
    }
}

impl NetworkConfig {
    pub fn pan_id(&self) -> Result<u16, ConfigError> {
        match self.pan_id.as_deref().map(str::trim) {
            None | Some("") => Ok(defaults::PAN_ID),
            Some(text) => {
                let digits = text
                    .strip_prefix("0x")
                    .or_else(|| text.strip_prefix("0X"))
                    .unwrap_or(text);
                u16::from_str_radix(digits, 16).map_err(|_| ConfigError::InvalidPanId(text.into()))
            }
        }
    }

    pub fn network_key(&self) -> Result<Option<Vec<u8>>, ConfigError> {
        match self.network_key.as_deref() {
            None => Ok(None),
            Some(text) if text.trim().is_empty() => Ok(None),
            Some(text) => parse_key_bytes(text).map(Some),
        }
    }
}

/// Pick hex byte pairs out of free-form text ("01:03:05...", "0x01 0x03", ...)
fn parse_key_bytes(text: &str) -> Result<Vec<u8>, ConfigError> {
    let mut bytes = Vec::new();
    let mut high: Option<u32> = None;

    for c in text.chars() {
        match (c.to_digit(16), high) {
            (Some(low), Some(h)) => {
                bytes.push((h * 16 + low) as u8);
                high = None;
            }
            (Some(digit), None) => high = Some(digit),
            // A lone digit before a separator is not a byte
            (None, _) => high = None,
        }
    }

    if bytes.len() != 16 {
        return Err(ConfigError::InvalidNetworkKey(format!(
            "expected 16 bytes, found {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LifecycleSettings {
    pub start_retry_backoff_ms: u64,
    pub overdue_check_interval_ms: u64,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            start_retry_backoff_ms: defaults::START_RETRY_BACKOFF_MS,
            overdue_check_interval_ms: defaults::OVERDUE_CHECK_INTERVAL_MS,
        }
    }
}

impl LifecycleSettings {
    pub fn start_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.start_retry_backoff_ms)
    }

    pub fn overdue_check_interval(&self) -> Duration {
        Duration::from_millis(self.overdue_check_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub listen: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen: defaults::ADMIN_LISTEN.into(),
        }
    }
}

/// Configuration for one coordinator instance
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Instance id used to address this coordinator on the admin surface
    pub instance_id: String,
    /// Root of the persisted state; each instance gets its own subdirectory
    pub persist_dir: PathBuf,
    pub serial: SerialConfig,
    pub network: NetworkConfig,
    /// Drive the coordinator's indicator LED
    pub indicator_enabled: bool,
    pub dispatcher: DispatcherConfig,
    pub lifecycle: LifecycleSettings,
    /// Staleness thresholds in minutes per model id, merged over the built-in table
    pub overdue_intervals: HashMap<String, u64>,
    pub admin: AdminConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            instance_id: "coordinator".into(),
            persist_dir: PathBuf::from("./zigbee"),
            serial: SerialConfig::default(),
            network: NetworkConfig::default(),
            indicator_enabled: false,
            dispatcher: DispatcherConfig::default(),
            lifecycle: LifecycleSettings::default(),
            overdue_intervals: HashMap::new(),
            admin: AdminConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Load from a TOML file, or use defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_toml_str(&std::fs::read_to_string(path)?)?,
            None => Self::default(),
        };
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.network.pan_id()?;
        self.network.network_key()?;
        Ok(())
    }

    /// Per-instance persistence directory
    pub fn instance_dir(&self) -> PathBuf {
        self.persist_dir.join(&self.instance_id)
    }

    /// Device name/metadata file
    pub fn names_path(&self) -> PathBuf {
        self.instance_dir().join("names.json")
    }

    /// Network database owned by the transport
    pub fn db_path(&self) -> PathBuf {
        self.instance_dir().join("dev.db")
    }
}

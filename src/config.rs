use std::{fmt, fs, path::Path, str::FromStr};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, EventError};
use crate::gpio::Channel;

pub const DEFAULT_SYSFS_ROOT: &str = "/sys/class/gpio";

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HttpConfig {
    pub unix_socket: Option<String>,
    pub host: Option<String>,
    pub path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeDetect {
    #[default]
    None,
    Rising,
    Falling,
    Both,
}

impl EdgeDetect {
    /// Text accepted by the kernel `edge` attribute.
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeDetect::None => "none",
            EdgeDetect::Rising => "rising",
            EdgeDetect::Falling => "falling",
            EdgeDetect::Both => "both",
        }
    }

    pub fn is_active(&self) -> bool {
        *self != EdgeDetect::None
    }
}

impl fmt::Display for EdgeDetect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EdgeDetect {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(EdgeDetect::None),
            "rising" => Ok(EdgeDetect::Rising),
            "falling" => Ok(EdgeDetect::Falling),
            "both" => Ok(EdgeDetect::Both),
            other => Err(EventError::IllegalEdgeArgument(other.to_string())),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChannelConfig {
    pub name: String,
    pub line: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpio_name: Option<String>,
}

impl ChannelConfig {
    pub fn gpio_name(&self) -> String {
        self.gpio_name
            .clone()
            .unwrap_or_else(|| format!("gpio{}", self.line))
    }
}

fn default_sysfs_root() -> String {
    DEFAULT_SYSFS_ROOT.to_string()
}

fn default_broadcast_capacity() -> usize {
    64
}

fn default_event_history_capacity() -> usize {
    32
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub http: HttpConfig,
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: String,
    pub channels: FxHashMap<String, ChannelConfig>,
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    #[serde(default = "default_event_history_capacity")]
    pub event_history_capacity: usize,
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, AppError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, AppError> {
        let config: AppConfig = serde_json::from_str(contents)
            .map_err(|e| AppError::Config(format!("Invalid config json: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.http.unix_socket.is_none() && self.http.host.is_none() {
            return Err(AppError::Config(
                "either 'unix_socket' or 'host' must be specified".into(),
            ));
        }

        let mut lines = FxHashMap::default();
        for (id, cfg) in &self.channels {
            if let Some(other) = lines.insert(cfg.line, id) {
                return Err(AppError::Config(format!(
                    "channels {other} and {id} share line {}",
                    cfg.line
                )));
            }
        }
        Ok(())
    }

    /// Resolves a user-facing channel id to the identity the event engine works with.
    pub fn resolve(&self, id: &str) -> Result<Channel, AppError> {
        let cfg = self
            .channels
            .get(id)
            .ok_or_else(|| AppError::NotFoundChannel(id.to_string()))?;

        Ok(Channel {
            id: id.to_string(),
            line: cfg.line,
            gpio_name: cfg.gpio_name(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_text_round_trips_through_kernel_names() {
        for edge in [
            EdgeDetect::None,
            EdgeDetect::Rising,
            EdgeDetect::Falling,
            EdgeDetect::Both,
        ] {
            assert_eq!(edge.as_str().parse::<EdgeDetect>().unwrap(), edge);
        }
        assert_eq!(" Rising\n".parse::<EdgeDetect>().unwrap(), EdgeDetect::Rising);
    }

    #[test]
    fn unknown_edge_text_is_illegal() {
        let err = "sideways".parse::<EdgeDetect>().unwrap_err();
        assert_eq!(err.code(), -102);
    }

    #[test]
    fn rejects_duplicate_lines() {
        let err = AppConfig::from_json(
            r#"{
                "http": { "host": "localhost:8080", "path": "/api" },
                "channels": {
                    "18": { "name": "BUTTON", "line": 79 },
                    "19": { "name": "SENSOR", "line": 79 }
                }
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn resolve_defaults_gpio_name() {
        let cfg = AppConfig::from_json(
            r#"{
                "http": { "unix_socket": "/tmp/edgemgr.sock", "path": "/api" },
                "channels": {
                    "18": { "name": "BUTTON", "line": 79 },
                    "SPI_CS": { "name": "CS", "line": 12, "gpio_name": "PZ.02" }
                }
            }"#,
        )
        .unwrap();

        let ch = cfg.resolve("18").unwrap();
        assert_eq!(ch.line, 79);
        assert_eq!(ch.gpio_name, "gpio79");
        assert_eq!(cfg.resolve("SPI_CS").unwrap().gpio_name, "PZ.02");
        assert_eq!(cfg.sysfs_root, DEFAULT_SYSFS_ROOT);
        assert!(matches!(
            cfg.resolve("7"),
            Err(AppError::NotFoundChannel(_))
        ));
    }
}

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub render: RenderConfig,
}

impl Config {
    /// Load configuration from file or create default
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)?;
            let config: Config = toml::from_str(&contents)?;
            Ok(config)
        } else {
            // Create default config
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, contents)?;
        Ok(())
    }

    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        let home = std::env::var("HOME")?;
        Ok(PathBuf::from(home).join(".config/deckhand/config.toml"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device brightness (0-100)
    pub brightness: u8,
    /// Press duration that counts as a hold, in milliseconds
    pub hold_threshold_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            brightness: 50,
            hold_threshold_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Deck-wide background media, applied at startup
    pub background: Option<PathBuf>,
    /// Playback rate for an animated background
    pub background_fps: f32,
    /// Loop an animated background
    pub background_loop: bool,
    /// Default label font; system fonts are probed when unset
    pub font: Option<PathBuf>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            background: None,
            background_fps: 30.0,
            background_loop: true,
            font: None,
        }
    }
}

/// Opaque per-component settings, stored as JSON objects on disk. The
/// contents are never interpreted here; callers get their mapping back
/// exactly as saved.
pub struct SettingsStore;

impl SettingsStore {
    /// Load a settings mapping. A missing or unreadable file is reported
    /// and treated as "no settings yet".
    pub fn load(path: &Path) -> Option<Map<String, Value>> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                warn!("No settings at {}: {e}", path.display());
                return None;
            }
        };
        match serde_json::from_str::<Value>(&contents) {
            Ok(Value::Object(map)) => Some(map),
            Ok(_) => {
                warn!("Settings at {} are not a JSON object", path.display());
                None
            }
            Err(e) => {
                warn!("Unparseable settings at {}: {e}", path.display());
                None
            }
        }
    }

    /// Save a settings mapping, creating parent directories as needed.
    pub fn save(path: &Path, settings: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(&Value::Object(settings.clone()))?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

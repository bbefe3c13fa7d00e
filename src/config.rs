use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::BaseDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{ChatError, Result};
use crate::geo::PositionOptions;
use crate::stomp::Heartbeat;

const CONFIG_FILE: &str = "chatsync.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BrokerSettings {
    pub url: String,
    pub subscribe_destination: String,
    pub publish_destination: String,
    /// Zero disables automatic reconnects.
    pub reconnect_delay_ms: u64,
    pub heartbeat_outgoing_ms: u64,
    pub heartbeat_incoming_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/ws-endpoint".into(),
            subscribe_destination: "/topic/messages".into(),
            publish_destination: "/ws/message".into(),
            reconnect_delay_ms: 5000,
            heartbeat_outgoing_ms: 4000,
            heartbeat_incoming_ms: 4000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl BrokerSettings {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn heartbeat(&self) -> Heartbeat {
        Heartbeat::new(
            Duration::from_millis(self.heartbeat_outgoing_ms),
            Duration::from_millis(self.heartbeat_incoming_ms),
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiSettings {
    pub base_url: String,
    pub timeout_ms: u64,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/api".into(),
            timeout_ms: 15_000,
        }
    }
}

impl ApiSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeolocationSettings {
    pub timeout_ms: u64,
    pub high_accuracy: bool,
    /// Fixed coordinates to report; without them messages go out unlocated.
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl Default for GeolocationSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            high_accuracy: true,
            latitude: None,
            longitude: None,
        }
    }
}

impl GeolocationSettings {
    pub fn options(&self) -> PositionOptions {
        PositionOptions {
            timeout: Duration::from_millis(self.timeout_ms),
            high_accuracy: self.high_accuracy,
            ..PositionOptions::default()
        }
    }

    pub fn fixed_position(&self) -> Option<(f64, f64)> {
        Some((self.latitude?, self.longitude?))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NotificationSettings {
    pub visible_ms: u64,
    pub fade_ms: u64,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            visible_ms: 5000,
            fade_ms: 300,
        }
    }
}

impl NotificationSettings {
    pub fn visible_for(&self) -> Duration {
        Duration::from_millis(self.visible_ms)
    }

    pub fn fade_for(&self) -> Duration {
        Duration::from_millis(self.fade_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Local user id. Taken from the token's subject when absent.
    pub user_id: Option<String>,
    pub token: Option<String>,
    pub broker: BrokerSettings,
    pub api: ApiSettings,
    pub geolocation: GeolocationSettings,
    pub notifications: NotificationSettings,
}

impl Settings {
    pub fn path() -> Option<PathBuf> {
        let base = BaseDirs::new()?;
        Some(base.config_dir().join(CONFIG_FILE))
    }

    /// Reads the user's settings, falling back to defaults when the file is
    /// missing or unreadable.
    pub fn load() -> Self {
        let Some(path) = Self::path() else {
            warn!("No config directory available; using default settings");
            return Self::default();
        };
        if !path.exists() {
            debug!("{} not found; using default settings", path.display());
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("{}; using default settings", e);
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| ChatError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        toml::from_str(&text).map_err(|e| ChatError::Config(format!("invalid {}: {}", path.display(), e)))
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::path().ok_or_else(|| ChatError::Config("no config directory".into()))?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ChatError::Config(format!("cannot create {}: {}", parent.display(), e)))?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| ChatError::Config(e.to_string()))?;
        fs::write(path, text).map_err(|e| ChatError::Config(format!("cannot write {}: {}", path.display(), e)))
    }
}

use crate::domain::models::Role;
use crate::infrastructure::bluetooth::protocol;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "bracelet_controller".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// How long a role may scan before giving up
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,

    // Advertised names, matched case-insensitively
    #[serde(default = "default_bracelet_name")]
    pub bracelet_name: String,
    #[serde(default = "default_sensor_name")]
    pub sensor_name: String,

    // BLE wire contract
    #[serde(default = "default_service_uuid")]
    pub ble_service_uuid: String,
    #[serde(default = "default_send_uuid")]
    pub ble_send_char_uuid: String,
    #[serde(default = "default_receive_uuid")]
    pub ble_receive_char_uuid: String,
    #[serde(default = "default_client_config_uuid")]
    pub ble_client_config_uuid: String,

    /// Ask the platform to re-establish dropped links on its own
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    /// Brightness attached to sensor-driven colors until the user sets one
    #[serde(default = "default_initial_brightness")]
    pub initial_brightness: u8,

    #[serde(default)]
    pub log_settings: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            scan_timeout_ms: default_scan_timeout_ms(),
            bracelet_name: default_bracelet_name(),
            sensor_name: default_sensor_name(),
            ble_service_uuid: default_service_uuid(),
            ble_send_char_uuid: default_send_uuid(),
            ble_receive_char_uuid: default_receive_uuid(),
            ble_client_config_uuid: default_client_config_uuid(),
            auto_reconnect: default_true(),
            initial_brightness: default_initial_brightness(),
            log_settings: LogSettings::default(),
        }
    }
}

fn default_scan_timeout_ms() -> u64 {
    20_000
}
fn default_bracelet_name() -> String {
    "Bracelet".to_string()
}
fn default_sensor_name() -> String {
    "Mantra".to_string()
}
fn default_service_uuid() -> String {
    protocol::SERVICE_UUID.to_string()
}
fn default_send_uuid() -> String {
    protocol::SEND_CHAR_UUID.to_string()
}
fn default_receive_uuid() -> String {
    protocol::RECEIVE_CHAR_UUID.to_string()
}
fn default_client_config_uuid() -> String {
    protocol::CLIENT_CONFIG_UUID.to_string()
}
fn default_initial_brightness() -> u8 {
    100
}

/// Per-role view of the settings consumed by a device session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionProfile {
    pub role: Role,
    pub device_name: String,
    pub service: Uuid,
    /// Characteristic colors are written to (bracelet only)
    pub write_char: Option<Uuid>,
    /// Characteristic readings are notified on (sensor only)
    pub read_char: Option<Uuid>,
    /// Client config descriptor of `read_char`
    pub notify_config: Option<Uuid>,
    pub scan_timeout: Duration,
    pub auto_reconnect: bool,
}

impl SessionProfile {
    /// Case-insensitive exact match against the advertised name
    pub fn matches_name(&self, advertised: &str) -> bool {
        advertised.eq_ignore_ascii_case(&self.device_name)
    }
}

impl Settings {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn session_profile(&self, role: Role) -> anyhow::Result<SessionProfile> {
        let service = protocol::parse_uuid(&self.ble_service_uuid)?;
        let profile = match role {
            Role::Bracelet => SessionProfile {
                role,
                device_name: self.bracelet_name.clone(),
                service,
                write_char: Some(protocol::parse_uuid(&self.ble_send_char_uuid)?),
                read_char: None,
                notify_config: None,
                scan_timeout: self.scan_timeout(),
                auto_reconnect: self.auto_reconnect,
            },
            Role::Sensor => SessionProfile {
                role,
                device_name: self.sensor_name.clone(),
                service,
                write_char: None,
                read_char: Some(protocol::parse_uuid(&self.ble_receive_char_uuid)?),
                notify_config: Some(protocol::parse_uuid(&self.ble_client_config_uuid)?),
                scan_timeout: self.scan_timeout(),
                auto_reconnect: self.auto_reconnect,
            },
        };
        Ok(profile)
    }
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Load from the per-user config directory, falling back to defaults
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        let settings = Self::load_from_file(&settings_path).unwrap_or_else(|e| {
            tracing::debug!("Using default settings ({}): {}", settings_path.display(), e);
            Settings::default()
        });

        Ok(Self {
            settings,
            settings_path,
        })
    }

    /// Load an explicit settings file; unlike [`SettingsService::new`] a
    /// missing or malformed file is an error.
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let settings_path = path.as_ref().to_path_buf();
        let settings = Self::load_from_file(&settings_path)?;
        Ok(Self {
            settings,
            settings_path,
        })
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BraceletController");
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::app::error::AppError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdbSettings {
    pub command_path: String,
}

impl Default for AdbSettings {
    fn default() -> Self {
        Self {
            command_path: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DisplaySettings {
    pub stay_awake: bool,
    pub turn_screen_off: bool,
    pub fullscreen: bool,
    pub always_on_top: bool,
    pub show_touches: bool,
    pub window_title: String,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            stay_awake: true,
            turn_screen_off: false,
            fullscreen: false,
            always_on_top: false,
            show_touches: false,
            window_title: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EncodingSettings {
    pub video_bit_rate: String,
    pub max_size: i32,
    pub max_fps: i32,
    pub video_codec: String,
    pub audio_enabled: bool,
    pub audio_bit_rate: String,
    /// `display` (default) or `camera`.
    pub video_source: String,
}

impl Default for EncodingSettings {
    fn default() -> Self {
        Self {
            video_bit_rate: String::new(),
            max_size: 0,
            max_fps: 0,
            video_codec: String::new(),
            audio_enabled: true,
            audio_bit_rate: String::new(),
            video_source: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    pub scrcpy_command_path: String,
    /// Overrides the companion server binary scrcpy pushes to the device
    /// (SCRCPY_SERVER_PATH). Empty means scrcpy's bundled server.
    pub server_path: String,
    pub tunnel_forward: bool,
    /// Port used by `adb tcpip` when enabling wireless mode.
    pub connect_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            scrcpy_command_path: String::new(),
            server_path: String::new(),
            tunnel_forward: false,
            connect_port: 5555,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecordingSettings {
    pub enabled: bool,
    pub output_dir: String,
    pub format: String,
    pub ffmpeg_command_path: String,
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            output_dir: String::new(),
            format: "mp4".to_string(),
            ffmpeg_command_path: String::new(),
        }
    }
}

/// Timing knobs for the reconciliation loop, the liveness poll, and the
/// recording guard. The grace-window and poll-interval values ship as the
/// constants observed in the field but stay configurable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SupervisionSettings {
    pub poll_interval_secs: u64,
    pub wifi_grace_ms: u64,
    pub liveness_poll_ms: u64,
    pub graceful_timeout_ms: u64,
    pub corruption_threshold_bytes: u64,
}

impl Default for SupervisionSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            wifi_grace_ms: 5_000,
            liveness_poll_ms: 2_000,
            graceful_timeout_ms: 1_500,
            corruption_threshold_bytes: 4_096,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub adb: AdbSettings,
    #[serde(default)]
    pub display: DisplaySettings,
    #[serde(default)]
    pub encoding: EncodingSettings,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub recording: RecordingSettings,
    #[serde(default)]
    pub supervision: SupervisionSettings,
    #[serde(default)]
    pub version: String,
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("MIRROR_DESK_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join(".mirror_desk_config.json")
}

pub fn backup_config_path() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join(".mirror_desk_config.backup.json")
}

pub fn load_config() -> Result<AppConfig, AppError> {
    load_config_from_path(&config_path())
}

pub fn save_config(config: &AppConfig) -> Result<(), AppError> {
    save_config_to_path(config, &config_path(), &backup_config_path())
}

pub fn load_config_from_path(path: &Path) -> Result<AppConfig, AppError> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read config: {err}"), ""))?;
    // Unknown fields from older config files are dropped here rather than
    // flowing into launch-argument derivation.
    let config: AppConfig = serde_json::from_str(&raw).unwrap_or_default();
    Ok(validate_config(config))
}

pub fn save_config_to_path(
    config: &AppConfig,
    path: &Path,
    backup_path: &Path,
) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if path.exists() {
        let _ = fs::copy(path, backup_path);
    }
    let payload = serde_json::to_string_pretty(config)
        .map_err(|err| AppError::system(format!("Failed to serialize config: {err}"), ""))?;
    fs::write(path, payload)
        .map_err(|err| AppError::system(format!("Failed to write config: {err}"), ""))?;
    Ok(())
}

pub fn validate_config(mut config: AppConfig) -> AppConfig {
    let defaults = SupervisionSettings::default();
    if config.supervision.poll_interval_secs < 1 {
        config.supervision.poll_interval_secs = defaults.poll_interval_secs;
    }
    if config.supervision.wifi_grace_ms < 500 {
        config.supervision.wifi_grace_ms = defaults.wifi_grace_ms;
    }
    if config.supervision.liveness_poll_ms < 100 {
        config.supervision.liveness_poll_ms = defaults.liveness_poll_ms;
    }
    if config.supervision.graceful_timeout_ms < 100 {
        config.supervision.graceful_timeout_ms = defaults.graceful_timeout_ms;
    }
    if config.supervision.corruption_threshold_bytes == 0 {
        config.supervision.corruption_threshold_bytes = defaults.corruption_threshold_bytes;
    }
    if config.server.connect_port == 0 {
        config.server.connect_port = 5555;
    }
    if config.encoding.max_size < 0 {
        config.encoding.max_size = 0;
    }
    if config.encoding.max_fps < 0 {
        config.encoding.max_fps = 0;
    }
    if config.recording.format.trim().is_empty() {
        config.recording.format = "mp4".to_string();
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_invalid_values() {
        let mut config = AppConfig::default();
        config.supervision.poll_interval_secs = 0;
        config.supervision.wifi_grace_ms = 10;
        config.supervision.liveness_poll_ms = 0;
        config.supervision.corruption_threshold_bytes = 0;
        config.server.connect_port = 0;
        config.encoding.max_size = -5;
        config.recording.format = "  ".to_string();

        let validated = validate_config(config);
        assert_eq!(validated.supervision.poll_interval_secs, 10);
        assert_eq!(validated.supervision.wifi_grace_ms, 5_000);
        assert_eq!(validated.supervision.liveness_poll_ms, 2_000);
        assert_eq!(validated.supervision.corruption_threshold_bytes, 4_096);
        assert_eq!(validated.server.connect_port, 5555);
        assert_eq!(validated.encoding.max_size, 0);
        assert_eq!(validated.recording.format, "mp4");
    }

    #[test]
    fn unknown_fields_do_not_leak_into_settings() {
        let raw = serde_json::json!({
            "encoding": { "audio_enabled": false, "legacy_flag": "--evil" },
            "mystery_section": { "anything": 1 }
        })
        .to_string();
        let config: AppConfig = serde_json::from_str(&raw).unwrap_or_default();
        let config = validate_config(config);
        assert!(!config.encoding.audio_enabled);
        assert_eq!(config.encoding.video_bit_rate, "");
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nope.json");
        let config = load_config_from_path(&path).expect("load");
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn save_then_load_round_trips_and_backs_up() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        let backup = dir.path().join("config.backup.json");

        let mut config = AppConfig::default();
        config.encoding.max_size = 1920;
        save_config_to_path(&config, &path, &backup).expect("save");
        // Second save copies the previous file aside.
        config.encoding.max_size = 1280;
        save_config_to_path(&config, &path, &backup).expect("save again");

        let loaded = load_config_from_path(&path).expect("load");
        assert_eq!(loaded.encoding.max_size, 1280);
        let backed_up = load_config_from_path(&backup).expect("load backup");
        assert_eq!(backed_up.encoding.max_size, 1920);
    }
}

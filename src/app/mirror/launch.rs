use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::app::config::{DisplaySettings, EncodingSettings, RecordingSettings, ServerSettings};

/// Partial per-session override applied on top of the persisted settings.
/// Every toggle action (audio, camera, recording) goes through one of these
/// and a full restart; scrcpy has no live-reconfiguration protocol.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionOverrides {
    pub audio: Option<bool>,
    pub camera: Option<bool>,
    pub record: Option<bool>,
}

/// The exact invocation handed to the gateway: program, ordered argument
/// list, environment overrides, and the expected recording target (if any).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchConfig {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub recording_path: Option<PathBuf>,
}

/// Where a recording session writes its output. Computed by the caller (the
/// timestamp is an input, not ambient state) so launch derivation stays a
/// pure function.
pub fn recording_file_path(
    recording: &RecordingSettings,
    device_id: &str,
    now: DateTime<Utc>,
) -> PathBuf {
    let dir = if recording.output_dir.trim().is_empty() {
        std::env::temp_dir()
    } else {
        PathBuf::from(recording.output_dir.trim())
    };
    let safe_id: String = device_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    dir.join(format!(
        "mirror_{}_{}.{}",
        safe_id,
        now.format("%Y%m%d_%H%M%S"),
        recording.format.trim()
    ))
}

/// Derives the scrcpy invocation for one device. Identical inputs always
/// produce identical argument lists; settings matching scrcpy's defaults are
/// omitted entirely rather than passed explicitly.
#[allow(clippy::too_many_arguments)]
pub fn build_launch_config(
    device_id: &str,
    display: &DisplaySettings,
    encoding: &EncodingSettings,
    server: &ServerSettings,
    recording: &RecordingSettings,
    overrides: &SessionOverrides,
    scrcpy_program: &str,
    adb_program: &str,
    recording_target: Option<&Path>,
) -> LaunchConfig {
    let mut args = vec!["-s".to_string(), device_id.to_string()];

    if display.stay_awake {
        args.push("--stay-awake".to_string());
    }
    if display.turn_screen_off {
        args.push("--turn-screen-off".to_string());
    }
    if display.fullscreen {
        args.push("--fullscreen".to_string());
    }
    if display.always_on_top {
        args.push("--always-on-top".to_string());
    }
    if display.show_touches {
        args.push("--show-touches".to_string());
    }
    if !display.window_title.trim().is_empty() {
        args.push(format!("--window-title={}", display.window_title.trim()));
    }

    if !encoding.video_bit_rate.trim().is_empty() {
        args.push(format!("--video-bit-rate={}", encoding.video_bit_rate.trim()));
    }
    if encoding.max_size > 0 {
        args.push(format!("--max-size={}", encoding.max_size));
    }
    if encoding.max_fps > 0 {
        args.push(format!("--max-fps={}", encoding.max_fps));
    }
    if !encoding.video_codec.trim().is_empty() {
        args.push(format!("--video-codec={}", encoding.video_codec.trim()));
    }

    let audio_enabled = overrides.audio.unwrap_or(encoding.audio_enabled);
    if !audio_enabled {
        args.push("--no-audio".to_string());
    } else if !encoding.audio_bit_rate.trim().is_empty() {
        args.push(format!("--audio-bit-rate={}", encoding.audio_bit_rate.trim()));
    }

    let camera = overrides
        .camera
        .unwrap_or(encoding.video_source.trim() == "camera");
    if camera {
        args.push("--video-source=camera".to_string());
    }

    if server.tunnel_forward {
        args.push("--force-adb-forward".to_string());
    }

    let record = overrides.record.unwrap_or(recording.enabled);
    let recording_path = match (record, recording_target) {
        (true, Some(path)) => {
            args.push(format!("--record={}", path.display()));
            Some(path.to_path_buf())
        }
        _ => None,
    };

    let mut env = Vec::new();
    if !server.server_path.trim().is_empty() {
        env.push((
            "SCRCPY_SERVER_PATH".to_string(),
            server.server_path.trim().to_string(),
        ));
    }
    if adb_program != "adb" {
        env.push(("ADB".to_string(), adb_program.to_string()));
    }

    LaunchConfig {
        program: scrcpy_program.to_string(),
        args,
        env,
        recording_path,
    }
}

use std::path::Path;
use std::process::Command;

use crate::app::models::{AdbInfo, ScrcpyInfo};

pub fn normalize_command_path(value: &str) -> String {
    let trimmed = value.trim();
    if let Some(inner) = trimmed
        .strip_prefix('"')
        .and_then(|candidate| candidate.strip_suffix('"'))
    {
        return inner.trim().to_string();
    }
    if let Some(inner) = trimmed
        .strip_prefix('\'')
        .and_then(|candidate| candidate.strip_suffix('\''))
    {
        return inner.trim().to_string();
    }
    trimmed.to_string()
}

/// Maps an empty configured path to the bare command name resolved via PATH.
pub fn resolve_program(config_command_path: &str, default_name: &str) -> String {
    let normalized = normalize_command_path(config_command_path);
    if normalized.is_empty() {
        default_name.to_string()
    } else {
        normalized
    }
}

/// Bare command names are left to PATH resolution; explicit paths must point
/// at an existing file.
pub fn validate_program(program: &str) -> Result<(), String> {
    if program.trim().is_empty() {
        return Err("Command is empty".to_string());
    }
    if !program.contains('/') && !program.contains('\\') {
        return Ok(());
    }
    let path = Path::new(program);
    if path.is_dir() {
        return Err("Path must point to an executable file".to_string());
    }
    if !path.exists() {
        return Err("Executable not found at the configured path".to_string());
    }
    Ok(())
}

pub fn probe_adb(program: &str) -> AdbInfo {
    match try_version(program, &["version"]) {
        Some(output) => AdbInfo {
            available: true,
            version_output: output,
            command_path: program.to_string(),
            error: None,
        },
        None => AdbInfo {
            available: false,
            version_output: String::new(),
            command_path: program.to_string(),
            error: Some("adb did not respond to `version`".to_string()),
        },
    }
}

pub fn probe_scrcpy(program: &str) -> ScrcpyInfo {
    let mut info = ScrcpyInfo {
        available: false,
        version_output: String::new(),
        major_version: 2,
        command_path: program.to_string(),
    };
    if let Some(output) = try_version(program, &["--version"]) {
        info.available = true;
        info.major_version = parse_scrcpy_major(&output);
        info.version_output = output;
    }
    info
}

fn try_version(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if output.status.success() {
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        None
    }
}

pub fn parse_scrcpy_major(output: &str) -> i32 {
    let lower = output.to_lowercase();
    for token in lower.split_whitespace() {
        if let Some(version) = token.strip_prefix("scrcpy") {
            if let Some(version) = version.strip_prefix('v') {
                if let Some(major) = version.split('.').next() {
                    if let Ok(value) = major.parse::<i32>() {
                        return value;
                    }
                }
            }
        }
        if let Some(major) = token.split('.').next() {
            if let Ok(value) = major.parse::<i32>() {
                return value;
            }
        }
    }
    2
}

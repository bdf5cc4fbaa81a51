use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::app::models::HistoryEntry;

/// On-disk form of the registry: connect history plus the soft-removed set.
/// Written as one document with whole-file overwrite; concurrent external
/// edits resolve as last-writer-wins by design.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PersistedRegistry {
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub removed: Vec<String>,
}

pub fn registry_path() -> PathBuf {
    if let Ok(path) = std::env::var("MIRROR_DESK_REGISTRY_PATH") {
        return PathBuf::from(path);
    }
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join(".mirror_desk_devices.json")
}

pub fn backup_registry_path() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join(".mirror_desk_devices.backup.json")
}

pub fn load_registry_file(path: &Path) -> PersistedRegistry {
    if !path.exists() {
        return PersistedRegistry::default();
    }
    match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
            warn!(error = %err, path = %path.display(), "device history file is corrupt; starting empty");
            PersistedRegistry::default()
        }),
        Err(err) => {
            warn!(error = %err, path = %path.display(), "failed to read device history");
            PersistedRegistry::default()
        }
    }
}

/// Best-effort write-through. In-memory state stays authoritative for the
/// running session, so a disk failure is logged and swallowed.
pub fn save_registry_file(persisted: &PersistedRegistry, path: &Path, backup_path: &Path) {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if path.exists() {
        let _ = fs::copy(path, backup_path);
    }
    let payload = match serde_json::to_string_pretty(persisted) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "failed to serialize device history");
            return;
        }
    };
    if let Err(err) = fs::write(path, payload) {
        warn!(error = %err, path = %path.display(), "failed to persist device history");
    }
}

/// Write-through of the live registry to its default location.
pub fn persist(registry: &crate::app::registry::DeviceRegistry) {
    save_registry_file(&registry.to_persisted(), &registry_path(), &backup_registry_path());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::models::ConnectionKind;
    use chrono::{TimeZone, Utc};

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("devices.json");
        let backup = dir.path().join("devices.backup.json");

        let persisted = PersistedRegistry {
            history: vec![HistoryEntry {
                id: "192.168.1.9:5555".to_string(),
                name: "phone".to_string(),
                kind: ConnectionKind::Wifi,
                auto_connect: true,
                last_connected: Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap(),
            }],
            removed: vec!["OLDSERIAL".to_string()],
        };
        save_registry_file(&persisted, &path, &backup);
        let loaded = load_registry_file(&path);
        assert_eq!(loaded, persisted);
    }

    #[test]
    fn corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("devices.json");
        std::fs::write(&path, "{ this is not json").expect("write");
        let loaded = load_registry_file(&path);
        assert_eq!(loaded, PersistedRegistry::default());
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let loaded = load_registry_file(&dir.path().join("absent.json"));
        assert_eq!(loaded, PersistedRegistry::default());
    }
}

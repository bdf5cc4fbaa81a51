pub mod store;

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::app::models::{ConnectionKind, DeviceRecord, DeviceStatus, HistoryEntry};
use crate::app::registry::store::PersistedRegistry;

pub const HISTORY_CAP: usize = 20;

/// In-memory map of every device ever seen, plus the persisted connect
/// history. The registry is the single shared mutable resource of the core;
/// all mutations go through this narrow operation set and each is atomic
/// under the surrounding mutex.
///
/// Ordered containers keep snapshots deterministic, so two reconciliation
/// ticks over unchanged input compare equal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceRegistry {
    devices: BTreeMap<String, DeviceRecord>,
    removed: BTreeSet<String>,
    history: Vec<HistoryEntry>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_persisted(persisted: PersistedRegistry) -> Self {
        let mut history = persisted.history;
        history.truncate(HISTORY_CAP);
        Self {
            devices: BTreeMap::new(),
            removed: persisted.removed.into_iter().collect(),
            history,
        }
    }

    pub fn to_persisted(&self) -> PersistedRegistry {
        PersistedRegistry {
            history: self.history.clone(),
            removed: self.removed.iter().cloned().collect(),
        }
    }

    pub fn upsert(&mut self, record: DeviceRecord) {
        self.devices.insert(record.id.clone(), record);
    }

    pub fn get(&self, id: &str) -> Option<&DeviceRecord> {
        self.devices.get(id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.values()
    }

    pub fn mark_offline(&mut self, id: &str) {
        if let Some(record) = self.devices.get_mut(id) {
            record.status = DeviceStatus::Offline;
        }
    }

    pub fn set_status(&mut self, id: &str, status: DeviceStatus, seen_at: Option<DateTime<Utc>>) {
        if let Some(record) = self.devices.get_mut(id) {
            record.status = status;
            if let Some(at) = seen_at {
                record.last_seen = at;
            }
        }
    }

    /// Soft-removes a device from the known view. Idempotent; the record
    /// itself is kept so history and a later restore stay intact.
    pub fn remove(&mut self, id: &str) {
        self.removed.insert(id.to_string());
    }

    pub fn restore(&mut self, id: &str) {
        self.removed.remove(id);
    }

    pub fn is_removed(&self, id: &str) -> bool {
        self.removed.contains(id)
    }

    /// The device list handed to the UI: everything known minus soft-removed
    /// ids.
    pub fn known_view(&self) -> Vec<DeviceRecord> {
        self.devices
            .values()
            .filter(|record| !self.removed.contains(&record.id))
            .cloned()
            .collect()
    }

    /// Records a successful Wi-Fi connect. Deduped by id (the entry moves to
    /// the front and keeps its auto-connect preference); capped at
    /// `HISTORY_CAP` with the oldest entry evicted.
    pub fn record_history(&mut self, id: &str, name: &str, connected_at: DateTime<Utc>) {
        let auto_connect = self
            .history
            .iter()
            .position(|entry| entry.id == id)
            .map(|index| self.history.remove(index).auto_connect)
            .unwrap_or(false);
        self.history.insert(
            0,
            HistoryEntry {
                id: id.to_string(),
                name: name.to_string(),
                kind: ConnectionKind::from_id(id),
                auto_connect,
                last_connected: connected_at,
            },
        );
        self.history.truncate(HISTORY_CAP);
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn set_auto_connect(&mut self, id: &str, auto_connect: bool) -> bool {
        match self.history.iter_mut().find(|entry| entry.id == id) {
            Some(entry) => {
                entry.auto_connect = auto_connect;
                true
            }
            None => false,
        }
    }

    pub fn remove_history_entry(&mut self, id: &str) -> bool {
        let before = self.history.len();
        self.history.retain(|entry| entry.id != id);
        self.history.len() != before
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 10, minute, 0).unwrap()
    }

    fn usb_record(id: &str) -> DeviceRecord {
        DeviceRecord {
            id: id.to_string(),
            name: format!("Device {id}"),
            kind: ConnectionKind::Usb,
            status: DeviceStatus::Device,
            last_seen: at(0),
        }
    }

    #[test]
    fn removed_devices_are_hidden_until_restored() {
        let mut registry = DeviceRegistry::new();
        registry.upsert(usb_record("A"));
        registry.upsert(usb_record("B"));

        registry.remove("A");
        registry.remove("A"); // idempotent
        let view = registry.known_view();
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].id, "B");

        registry.restore("A");
        assert_eq!(registry.known_view().len(), 2);
    }

    #[test]
    fn history_caps_at_twenty_evicting_the_oldest() {
        let mut registry = DeviceRegistry::new();
        for i in 0..21 {
            registry.record_history(
                &format!("192.168.1.{i}:5555"),
                &format!("dev-{i}"),
                at(i as u32),
            );
        }
        assert_eq!(registry.history().len(), HISTORY_CAP);
        // Newest first; the first-recorded entry fell off.
        assert_eq!(registry.history()[0].id, "192.168.1.20:5555");
        assert!(registry
            .history()
            .iter()
            .all(|entry| entry.id != "192.168.1.0:5555"));
    }

    #[test]
    fn re_recording_moves_entry_to_front_and_keeps_auto_connect() {
        let mut registry = DeviceRegistry::new();
        registry.record_history("192.168.1.5:5555", "tablet", at(1));
        registry.record_history("192.168.1.9:5555", "phone", at(2));
        assert!(registry.set_auto_connect("192.168.1.5:5555", true));

        registry.record_history("192.168.1.5:5555", "tablet", at(3));
        assert_eq!(registry.history().len(), 2);
        assert_eq!(registry.history()[0].id, "192.168.1.5:5555");
        assert!(registry.history()[0].auto_connect);
        assert_eq!(registry.history()[0].last_connected, at(3));
    }

    #[test]
    fn set_auto_connect_reports_unknown_ids() {
        let mut registry = DeviceRegistry::new();
        assert!(!registry.set_auto_connect("nope", true));
    }

    #[test]
    fn persisted_round_trip_preserves_history_and_removed_set() {
        let mut registry = DeviceRegistry::new();
        registry.record_history("192.168.1.5:5555", "tablet", at(1));
        registry.remove("SERIAL1");

        let restored = DeviceRegistry::from_persisted(registry.to_persisted());
        assert_eq!(restored.history(), registry.history());
        assert!(restored.is_removed("SERIAL1"));
        // Live device records are not persisted.
        assert_eq!(restored.devices().count(), 0);
    }
}

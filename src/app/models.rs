use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a device reaches the host. Derived from the device id: adb renders
/// network transports as `ip:port`, so a `:` in the id means Wi-Fi.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Usb,
    Wifi,
}

impl ConnectionKind {
    pub fn from_id(id: &str) -> Self {
        if id.contains(':') {
            ConnectionKind::Wifi
        } else {
            ConnectionKind::Usb
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Device,
    Unauthorized,
    Connected,
    Connecting,
    Offline,
}

/// Canonical per-device view owned by the registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceRecord {
    pub id: String,
    pub name: String,
    pub kind: ConnectionKind,
    pub status: DeviceStatus,
    pub last_seen: DateTime<Utc>,
}

/// Persisted subset of a device, recorded on successful Wi-Fi connects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub id: String,
    pub name: String,
    pub kind: ConnectionKind,
    pub auto_connect: bool,
    pub last_connected: DateTime<Utc>,
}

/// One row of `adb devices -l` output, as returned by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdbDevice {
    pub id: String,
    pub state: String,
    pub name: String,
}

/// User-facing classification of an `adb connect` failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectFailure {
    Refused,
    Timeout,
    NoRoute,
    Other,
}

impl ConnectFailure {
    pub fn reason(&self) -> &'static str {
        match self {
            ConnectFailure::Refused => "Device refused the connection",
            ConnectFailure::Timeout => "Connection timed out",
            ConnectFailure::NoRoute => "No route to the device",
            ConnectFailure::Other => "Connection failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ConnectOutcome {
    Connected,
    AlreadyConnected,
    Failed { failure: ConnectFailure, detail: String },
}

impl ConnectOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ConnectOutcome::Connected | ConnectOutcome::AlreadyConnected
        )
    }
}

/// Result of switching a USB device's debug transport to TCP. `ip` is absent
/// when the routing-table probe found nothing; the caller prompts for manual
/// entry in that case.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WirelessMode {
    pub ip: Option<String>,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdbInfo {
    pub available: bool,
    pub version_output: String,
    pub command_path: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScrcpyInfo {
    pub available: bool,
    pub version_output: String,
    pub major_version: i32,
    pub command_path: String,
}

/// Why a mirroring session left the Running phase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExitCause {
    Stopped,
    Crashed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum SessionEvent {
    SessionStarted {
        id: String,
        pid: u32,
        recording_path: Option<String>,
        trace_id: String,
    },
    SessionExited {
        id: String,
        pid: u32,
        cause: ExitCause,
        recording_path: Option<String>,
        repair_error: Option<String>,
        trace_id: String,
    },
}

impl SessionEvent {
    pub fn device_id(&self) -> &str {
        match self {
            SessionEvent::SessionStarted { id, .. } => id,
            SessionEvent::SessionExited { id, .. } => id,
        }
    }
}

/// Device row handed to the UI: the registry record plus whether a
/// mirroring session is currently active for it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceView {
    #[serde(flatten)]
    pub record: DeviceRecord,
    pub mirroring: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandResponse<T> {
    pub trace_id: String,
    pub data: T,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_kind_follows_id_shape() {
        assert_eq!(ConnectionKind::from_id("0123456789ABCDEF"), ConnectionKind::Usb);
        assert_eq!(ConnectionKind::from_id("192.168.1.20:5555"), ConnectionKind::Wifi);
    }

    #[test]
    fn connect_outcome_success_covers_already_connected() {
        assert!(ConnectOutcome::Connected.is_success());
        assert!(ConnectOutcome::AlreadyConnected.is_success());
        assert!(!ConnectOutcome::Failed {
            failure: ConnectFailure::Timeout,
            detail: String::new(),
        }
        .is_success());
    }
}

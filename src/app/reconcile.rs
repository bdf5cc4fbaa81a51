use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::app::adb::gateway::AdbGateway;
use crate::app::error::AppError;
use crate::app::models::{AdbDevice, ConnectionKind, DeviceRecord, DeviceStatus};
use crate::app::registry::DeviceRegistry;

/// What woke the reconciler. Ticks are trigger-agnostic: every variant runs
/// the same snapshot pass, only the manual path additionally offers
/// reconnects for Wi-Fi devices that dropped off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickTrigger {
    Interval,
    Manual,
    VisibilityRegained,
    DeviceAttached,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickOutcome {
    pub changed: bool,
    /// Wi-Fi devices that were live last tick but missing from this
    /// snapshot. Populated only for manual refreshes, at most once per tick.
    pub reconnect_candidates: Vec<String>,
}

/// Notifications pushed to the UI layer when a tick changes state.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    DeviceListChanged(Vec<DeviceRecord>),
    ReconnectOffer(Vec<String>),
}

pub type RegistryEmitter = Arc<dyn Fn(RegistryEvent) + Send + Sync>;

/// Backoff schedule between device-list query retries.
pub const QUERY_RETRY_BACKOFF: [Duration; 3] = [
    Duration::from_millis(500),
    Duration::from_millis(1_000),
    Duration::from_millis(2_000),
];

fn status_for(device: &AdbDevice, kind: ConnectionKind) -> DeviceStatus {
    if device.state == "unauthorized" {
        return DeviceStatus::Unauthorized;
    }
    match kind {
        // A network transport in the adb table is itself the live session.
        ConnectionKind::Wifi => DeviceStatus::Connected,
        ConnectionKind::Usb => DeviceStatus::Device,
    }
}

/// Only these statuses are considered live when deciding whether an absent
/// Wi-Fi device has actually dropped.
fn is_live(status: DeviceStatus) -> bool {
    matches!(status, DeviceStatus::Connected | DeviceStatus::Connecting)
}

/// UI-relevant projection of the registry, used to decide whether a tick
/// changed anything. `last_seen` bumps are bookkeeping, not a change.
fn fingerprint(registry: &DeviceRegistry) -> Vec<(String, String, DeviceStatus)> {
    registry
        .known_view()
        .into_iter()
        .map(|record| (record.id, record.name, record.status))
        .collect()
}

/// Folds one adb device-list snapshot into the registry. Pure with respect
/// to time; the caller supplies `now`, so applying the same snapshot twice
/// at the same instant is a no-op.
pub fn apply_device_snapshot(
    registry: &mut DeviceRegistry,
    snapshot: &[AdbDevice],
    now: DateTime<Utc>,
    trigger: TickTrigger,
    wifi_grace: Duration,
) -> TickOutcome {
    let before = fingerprint(registry);

    let mut reconnect_candidates = Vec::new();
    if trigger == TickTrigger::Manual {
        for record in registry.devices() {
            let present = snapshot.iter().any(|device| device.id == record.id);
            if record.kind == ConnectionKind::Wifi && is_live(record.status) && !present {
                reconnect_candidates.push(record.id.clone());
            }
        }
    }

    for device in snapshot {
        let kind = ConnectionKind::from_id(&device.id);
        if registry.is_removed(&device.id) {
            // A soft-removed USB device that shows up authorized was plugged
            // back in deliberately; anything else stays hidden.
            if kind == ConnectionKind::Usb && device.state == "device" {
                registry.restore(&device.id);
            } else {
                continue;
            }
        }
        let status = status_for(device, kind);
        match registry.get(&device.id) {
            Some(existing) => {
                let name = if device.name == crate::app::adb::parse::UNKNOWN_DEVICE_NAME
                    && !existing.name.is_empty()
                {
                    existing.name.clone()
                } else {
                    device.name.clone()
                };
                registry.upsert(DeviceRecord {
                    id: device.id.clone(),
                    name,
                    kind,
                    status,
                    last_seen: now,
                });
            }
            None => {
                registry.upsert(DeviceRecord {
                    id: device.id.clone(),
                    name: device.name.clone(),
                    kind,
                    status,
                    last_seen: now,
                });
            }
        }
    }

    let absent_ids: Vec<(String, ConnectionKind, DeviceStatus, DateTime<Utc>)> = registry
        .devices()
        .filter(|record| !snapshot.iter().any(|device| device.id == record.id))
        .map(|record| (record.id.clone(), record.kind, record.status, record.last_seen))
        .collect();
    for (id, kind, status, last_seen) in absent_ids {
        match kind {
            // USB presence is authoritative: gone from the table means gone.
            ConnectionKind::Usb => {
                if status != DeviceStatus::Offline {
                    registry.mark_offline(&id);
                }
            }
            // Wi-Fi devices blink out of the adb table during brief radio
            // drops; only a sustained absence of a live session counts.
            ConnectionKind::Wifi => {
                if is_live(status) {
                    let absence = now.signed_duration_since(last_seen);
                    if absence.num_milliseconds() >= wifi_grace.as_millis() as i64 {
                        registry.mark_offline(&id);
                    }
                }
            }
        }
    }

    TickOutcome {
        changed: fingerprint(registry) != before,
        reconnect_candidates,
    }
}

/// Queries the device list, retrying on failure with the supplied backoff
/// schedule. Returns the last error when every attempt fails.
pub fn query_with_retry<F>(mut query: F, backoff: &[Duration]) -> Result<Vec<AdbDevice>, AppError>
where
    F: FnMut() -> Result<Vec<AdbDevice>, AppError>,
{
    let mut last_err = match query() {
        Ok(devices) => return Ok(devices),
        Err(err) => err,
    };
    for delay in backoff {
        std::thread::sleep(*delay);
        match query() {
            Ok(devices) => return Ok(devices),
            Err(err) => last_err = err,
        }
    }
    Err(last_err)
}

/// A failed device-list query says nothing about individual devices, so the
/// ordinary absence rules run against an empty snapshot: USB devices drop
/// immediately, live Wi-Fi sessions only past the grace window.
pub fn degrade_after_query_failure(
    registry: &mut DeviceRegistry,
    now: DateTime<Utc>,
    wifi_grace: Duration,
) -> bool {
    apply_device_snapshot(registry, &[], now, TickTrigger::Interval, wifi_grace).changed
}

pub fn run_tick(
    registry: &Mutex<DeviceRegistry>,
    gateway: &AdbGateway,
    trigger: TickTrigger,
    wifi_grace: Duration,
    emitter: &RegistryEmitter,
) {
    let trace_id = Uuid::new_v4().to_string();
    let snapshot = query_with_retry(
        || gateway.query_device_list(&trace_id),
        &QUERY_RETRY_BACKOFF,
    );
    let mut guard = match registry.lock() {
        Ok(guard) => guard,
        Err(_) => {
            warn!(trace_id = %trace_id, "device registry lock poisoned; skipping tick");
            return;
        }
    };
    match snapshot {
        Ok(devices) => {
            let outcome =
                apply_device_snapshot(&mut guard, &devices, Utc::now(), trigger, wifi_grace);
            let mut changed = outcome.changed;
            let candidates = outcome.reconnect_candidates;
            drop(guard);
            if !candidates.is_empty() {
                emitter(RegistryEvent::ReconnectOffer(candidates.clone()));
                if reconnect_candidates(registry, gateway, &candidates, &trace_id) {
                    changed = true;
                }
            }
            if changed {
                if let Ok(guard) = registry.lock() {
                    emitter(RegistryEvent::DeviceListChanged(guard.known_view()));
                }
            }
        }
        Err(err) => {
            warn!(trace_id = %trace_id, error = %err, "device list query failed after retries");
            let changed = degrade_after_query_failure(&mut guard, Utc::now(), wifi_grace);
            let view = guard.known_view();
            drop(guard);
            if changed {
                emitter(RegistryEvent::DeviceListChanged(view));
            }
        }
    }
}

/// Auto-recovery for Wi-Fi devices that dropped off between refreshes: one
/// connect attempt per candidate per tick, sequential. Returns whether any
/// attempt changed the registry.
fn reconnect_candidates(
    registry: &Mutex<DeviceRegistry>,
    gateway: &AdbGateway,
    candidates: &[String],
    trace_id: &str,
) -> bool {
    let mut changed = false;
    for id in candidates {
        match gateway.connect(id, trace_id) {
            Ok(outcome) if outcome.is_success() => {
                info!(trace_id = %trace_id, device = %id, "reconnected after refresh");
                if record_live_connection(registry, id, id) {
                    changed = true;
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!(trace_id = %trace_id, device = %id, error = %err, "reconnect attempt failed");
            }
        }
    }
    changed
}

/// Registry bookkeeping after a successful connect: upsert as a live Wi-Fi
/// session, refresh the history entry, write the registry file through.
fn record_live_connection(
    registry: &Mutex<DeviceRegistry>,
    id: &str,
    fallback_name: &str,
) -> bool {
    let Ok(mut guard) = registry.lock() else {
        return false;
    };
    let now = Utc::now();
    let name = guard
        .get(id)
        .map(|record| record.name.clone())
        .unwrap_or_else(|| fallback_name.to_string());
    guard.upsert(DeviceRecord {
        id: id.to_string(),
        name: name.clone(),
        kind: ConnectionKind::Wifi,
        status: DeviceStatus::Connected,
        last_seen: now,
    });
    guard.record_history(id, &name, now);
    crate::app::registry::store::persist(&guard);
    true
}

/// Wakes on triggers pushed through `triggers` and falls back to a periodic
/// tick when none arrive within the poll interval.
pub fn start_reconcile_loop(
    registry: Arc<Mutex<DeviceRegistry>>,
    gateway: AdbGateway,
    triggers: Receiver<TickTrigger>,
    poll_interval: Duration,
    wifi_grace: Duration,
    emitter: RegistryEmitter,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || loop {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        let trigger = match triggers.recv_timeout(poll_interval) {
            Ok(trigger) => trigger,
            Err(RecvTimeoutError::Timeout) => TickTrigger::Interval,
            Err(RecvTimeoutError::Disconnected) => return,
        };
        if stop.load(Ordering::Relaxed) {
            return;
        }
        run_tick(&registry, &gateway, trigger, wifi_grace, &emitter);
    })
}

/// Startup pass over the persisted history: sequentially reconnects every
/// entry marked auto-connect. Failures are logged and skipped so one dead
/// address never blocks the rest.
pub fn run_startup_autoconnect(
    registry: &Mutex<DeviceRegistry>,
    gateway: &AdbGateway,
    trace_id: &str,
) {
    let targets: Vec<(String, String)> = match registry.lock() {
        Ok(guard) => guard
            .history()
            .iter()
            .filter(|entry| entry.auto_connect && entry.kind == ConnectionKind::Wifi)
            .map(|entry| (entry.id.clone(), entry.name.clone()))
            .collect(),
        Err(_) => return,
    };
    for (id, name) in targets {
        match gateway.connect(&id, trace_id) {
            Ok(outcome) if outcome.is_success() => {
                info!(trace_id = %trace_id, device = %id, "auto-connected");
                record_live_connection(registry, &id, &name);
            }
            Ok(outcome) => {
                warn!(trace_id = %trace_id, device = %id, outcome = ?outcome, "auto-connect failed");
            }
            Err(err) => {
                warn!(trace_id = %trace_id, device = %id, error = %err, "auto-connect errored");
            }
        }
    }
}

use std::sync::MutexGuard;
use std::time::Duration;

use chrono::Utc;
use tauri::State;
use tracing::{info, warn};
use uuid::Uuid;

use crate::app::adb::gateway::AdbGateway;
use crate::app::adb::locator::{probe_adb, probe_scrcpy, resolve_program};
use crate::app::config::{load_config, save_config, validate_config, AppConfig};
use crate::app::error::AppError;
use crate::app::mirror::launch::{build_launch_config, recording_file_path, SessionOverrides};
use crate::app::models::{
    AdbInfo, CommandResponse, ConnectOutcome, ConnectionKind, DeviceRecord, DeviceStatus,
    DeviceView, HistoryEntry, ScrcpyInfo, WirelessMode,
};
use crate::app::reconcile::{
    apply_device_snapshot, degrade_after_query_failure, query_with_retry, TickTrigger,
    QUERY_RETRY_BACKOFF,
};
use crate::app::registry::{store, DeviceRegistry};
use crate::app::state::AppState;

pub fn resolve_trace_id(trace_id: Option<String>) -> String {
    trace_id
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn ensure_non_empty(value: &str, field: &str, trace_id: &str) -> Result<String, AppError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AppError::validation(
            format!("{field} must not be empty"),
            trace_id,
        ));
    }
    Ok(trimmed.to_string())
}

/// Bare `ip` inputs get the configured connect port appended; `ip:port`
/// inputs pass through untouched.
fn normalize_wifi_address(address: &str, default_port: u16) -> String {
    let trimmed = address.trim();
    if trimmed.contains(':') {
        trimmed.to_string()
    } else {
        format!("{trimmed}:{default_port}")
    }
}

fn respond<T>(trace_id: String, data: T) -> CommandResponse<T> {
    CommandResponse { trace_id, data }
}

fn gateway_for(config: &AppConfig) -> AdbGateway {
    AdbGateway::new(resolve_program(&config.adb.command_path, "adb"))
}

fn lock_registry<'a>(
    state: &'a AppState,
    trace_id: &str,
) -> Result<MutexGuard<'a, DeviceRegistry>, AppError> {
    state
        .registry
        .lock()
        .map_err(|_| AppError::system("Device registry lock poisoned", trace_id))
}

// ---- configuration ----

#[tauri::command]
pub fn get_config(trace_id: Option<String>) -> Result<CommandResponse<AppConfig>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let config = load_config()?;
    Ok(respond(trace_id, config))
}

#[tauri::command]
pub fn save_app_config(
    config: AppConfig,
    trace_id: Option<String>,
) -> Result<CommandResponse<AppConfig>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let validated = validate_config(config);
    save_config(&validated)?;
    info!(trace_id = %trace_id, "configuration saved");
    Ok(respond(trace_id, validated))
}

#[tauri::command]
pub fn reset_config(trace_id: Option<String>) -> Result<CommandResponse<AppConfig>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let defaults = AppConfig::default();
    save_config(&defaults)?;
    Ok(respond(trace_id, defaults))
}

// ---- tool probes ----

#[tauri::command]
pub fn check_adb(trace_id: Option<String>) -> Result<CommandResponse<AdbInfo>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let config = load_config()?;
    let program = resolve_program(&config.adb.command_path, "adb");
    Ok(respond(trace_id, probe_adb(&program)))
}

#[tauri::command]
pub fn check_scrcpy(trace_id: Option<String>) -> Result<CommandResponse<ScrcpyInfo>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let config = load_config()?;
    let program = resolve_program(&config.server.scrcpy_command_path, "scrcpy");
    Ok(respond(trace_id, probe_scrcpy(&program)))
}

// ---- device listing ----

pub(crate) fn list_devices_inner(
    state: &AppState,
    trace_id: &str,
) -> Result<Vec<DeviceView>, AppError> {
    let config = load_config()?;
    let gateway = gateway_for(&config);
    let grace = Duration::from_millis(config.supervision.wifi_grace_ms);

    let snapshot = query_with_retry(|| gateway.query_device_list(trace_id), &QUERY_RETRY_BACKOFF);
    let mut registry = lock_registry(state, trace_id)?;
    match snapshot {
        Ok(devices) => {
            apply_device_snapshot(&mut registry, &devices, Utc::now(), TickTrigger::Interval, grace);
        }
        Err(err) => {
            // Stale state is worse than pessimistic state.
            warn!(trace_id = %trace_id, error = %err, "device query failed; degrading to offline");
            degrade_after_query_failure(&mut registry, Utc::now(), grace);
        }
    }
    let view = registry.known_view();
    drop(registry);
    Ok(view
        .into_iter()
        .map(|record| DeviceView {
            mirroring: state.supervisor.is_active(&record.id),
            record,
        })
        .collect())
}

#[tauri::command]
pub fn list_devices(
    state: State<'_, AppState>,
    trace_id: Option<String>,
) -> Result<CommandResponse<Vec<DeviceView>>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let devices = list_devices_inner(&state, &trace_id)?;
    Ok(respond(trace_id, devices))
}

#[tauri::command]
pub fn refresh_devices(
    state: State<'_, AppState>,
    trace_id: Option<String>,
) -> Result<CommandResponse<bool>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let queued = state.request_tick(TickTrigger::Manual);
    if !queued {
        // Loop not running (early startup); fall back to an inline pass.
        list_devices_inner(&state, &trace_id)?;
    }
    Ok(respond(trace_id, queued))
}

// ---- wifi connection ----

pub(crate) fn connect_wifi_inner(
    state: &AppState,
    address: &str,
    trace_id: &str,
) -> Result<ConnectOutcome, AppError> {
    let address = ensure_non_empty(address, "address", trace_id)?;
    let config = load_config()?;
    let address = normalize_wifi_address(&address, config.server.connect_port);
    let gateway = gateway_for(&config);

    // The attempt itself is visible state: the record shows `connecting`
    // until the gateway reports either way.
    {
        let mut registry = lock_registry(state, trace_id)?;
        // An explicit connect overrides a prior removal.
        registry.restore(&address);
        let name = registry
            .get(&address)
            .map(|record| record.name.clone())
            .unwrap_or_else(|| address.clone());
        registry.upsert(DeviceRecord {
            id: address.clone(),
            name,
            kind: ConnectionKind::Wifi,
            status: DeviceStatus::Connecting,
            last_seen: Utc::now(),
        });
    }

    let outcome = match gateway.connect(&address, trace_id) {
        Ok(outcome) => outcome,
        Err(err) => {
            let mut registry = lock_registry(state, trace_id)?;
            registry.set_status(&address, DeviceStatus::Offline, None);
            return Err(err);
        }
    };
    let mut registry = lock_registry(state, trace_id)?;
    if outcome.is_success() {
        let now = Utc::now();
        let name = registry
            .get(&address)
            .map(|record| record.name.clone())
            .unwrap_or_else(|| address.clone());
        registry.upsert(DeviceRecord {
            id: address.clone(),
            name: name.clone(),
            kind: ConnectionKind::Wifi,
            status: DeviceStatus::Connected,
            last_seen: now,
        });
        registry.record_history(&address, &name, now);
        store::persist(&registry);
        info!(trace_id = %trace_id, device = %address, "wifi device connected");
    } else {
        registry.set_status(&address, DeviceStatus::Offline, None);
    }
    Ok(outcome)
}

#[tauri::command]
pub fn connect_wifi_device(
    state: State<'_, AppState>,
    address: String,
    trace_id: Option<String>,
) -> Result<CommandResponse<ConnectOutcome>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let outcome = connect_wifi_inner(&state, &address, &trace_id)?;
    Ok(respond(trace_id, outcome))
}

#[tauri::command]
pub fn disconnect_wifi_device(
    state: State<'_, AppState>,
    address: String,
    trace_id: Option<String>,
) -> Result<CommandResponse<()>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let address = ensure_non_empty(&address, "address", &trace_id)?;
    let config = load_config()?;
    let address = normalize_wifi_address(&address, config.server.connect_port);
    gateway_for(&config).disconnect(&address, &trace_id)?;
    let mut registry = lock_registry(&state, &trace_id)?;
    registry.set_status(&address, DeviceStatus::Offline, None);
    Ok(respond(trace_id, ()))
}

#[tauri::command]
pub fn enable_wireless_mode(
    serial: String,
    trace_id: Option<String>,
) -> Result<CommandResponse<WirelessMode>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let serial = ensure_non_empty(&serial, "serial", &trace_id)?;
    let config = load_config()?;
    let mode = gateway_for(&config).enable_wireless_mode(
        &serial,
        config.server.connect_port,
        &trace_id,
    )?;
    Ok(respond(trace_id, mode))
}

// ---- mirroring sessions ----

pub(crate) fn start_mirror_inner(
    state: &AppState,
    device_id: &str,
    overrides: SessionOverrides,
    trace_id: &str,
) -> Result<u32, AppError> {
    let device_id = ensure_non_empty(device_id, "device_id", trace_id)?;
    let config = load_config()?;
    let gateway = gateway_for(&config);
    let scrcpy_program = resolve_program(&config.server.scrcpy_command_path, "scrcpy");
    let adb_program = resolve_program(&config.adb.command_path, "adb");

    let record = overrides.record.unwrap_or(config.recording.enabled);
    let recording_target = if record {
        Some(recording_file_path(&config.recording, &device_id, Utc::now()))
    } else {
        None
    };
    let launch = build_launch_config(
        &device_id,
        &config.display,
        &config.encoding,
        &config.server,
        &config.recording,
        &overrides,
        &scrcpy_program,
        &adb_program,
        recording_target.as_deref(),
    );
    state.supervisor.start(&gateway, &device_id, &launch, trace_id)
}

#[tauri::command]
pub fn start_mirror(
    state: State<'_, AppState>,
    device_id: String,
    overrides: Option<SessionOverrides>,
    trace_id: Option<String>,
) -> Result<CommandResponse<u32>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let pid = start_mirror_inner(&state, &device_id, overrides.unwrap_or_default(), &trace_id)?;
    Ok(respond(trace_id, pid))
}

#[tauri::command]
pub fn stop_mirror(
    state: State<'_, AppState>,
    device_id: String,
    forced: Option<bool>,
    trace_id: Option<String>,
) -> Result<CommandResponse<()>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let device_id = ensure_non_empty(&device_id, "device_id", &trace_id)?;
    state
        .supervisor
        .stop(&device_id, forced.unwrap_or(false), &trace_id)?;
    Ok(respond(trace_id, ()))
}

#[tauri::command]
pub fn restart_mirror(
    state: State<'_, AppState>,
    device_id: String,
    overrides: Option<SessionOverrides>,
    trace_id: Option<String>,
) -> Result<CommandResponse<u32>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let device_id = ensure_non_empty(&device_id, "device_id", &trace_id)?;
    let overrides = overrides.unwrap_or_default();
    let config = load_config()?;
    let gateway = gateway_for(&config);
    let scrcpy_program = resolve_program(&config.server.scrcpy_command_path, "scrcpy");
    let adb_program = resolve_program(&config.adb.command_path, "adb");

    let record = overrides.record.unwrap_or(config.recording.enabled);
    let recording_target = if record {
        Some(recording_file_path(&config.recording, &device_id, Utc::now()))
    } else {
        None
    };
    let launch = build_launch_config(
        &device_id,
        &config.display,
        &config.encoding,
        &config.server,
        &config.recording,
        &overrides,
        &scrcpy_program,
        &adb_program,
        recording_target.as_deref(),
    );
    let pid = state
        .supervisor
        .restart(&gateway, &device_id, &launch, &trace_id)?;
    Ok(respond(trace_id, pid))
}

// ---- device removal ----

pub(crate) fn remove_device_inner(
    state: &AppState,
    device_id: &str,
    trace_id: &str,
) -> Result<(), AppError> {
    let device_id = ensure_non_empty(device_id, "device_id", trace_id)?;
    // A session on a hidden device would be unstoppable from the UI.
    if state.supervisor.is_active(&device_id) {
        let _ = state.supervisor.stop(&device_id, true, trace_id);
    }
    let mut registry = lock_registry(state, trace_id)?;
    registry.remove(&device_id);
    store::persist(&registry);
    Ok(())
}

#[tauri::command]
pub fn remove_device(
    state: State<'_, AppState>,
    device_id: String,
    trace_id: Option<String>,
) -> Result<CommandResponse<()>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    remove_device_inner(&state, &device_id, &trace_id)?;
    Ok(respond(trace_id, ()))
}

#[tauri::command]
pub fn restore_device(
    state: State<'_, AppState>,
    device_id: String,
    trace_id: Option<String>,
) -> Result<CommandResponse<()>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let device_id = ensure_non_empty(&device_id, "device_id", &trace_id)?;
    let mut registry = lock_registry(&state, &trace_id)?;
    registry.restore(&device_id);
    store::persist(&registry);
    Ok(respond(trace_id, ()))
}

// ---- connect history ----

#[tauri::command]
pub fn list_history(
    state: State<'_, AppState>,
    trace_id: Option<String>,
) -> Result<CommandResponse<Vec<HistoryEntry>>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let registry = lock_registry(&state, &trace_id)?;
    Ok(respond(trace_id, registry.history().to_vec()))
}

#[tauri::command]
pub fn remove_history_entry(
    state: State<'_, AppState>,
    device_id: String,
    trace_id: Option<String>,
) -> Result<CommandResponse<bool>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let device_id = ensure_non_empty(&device_id, "device_id", &trace_id)?;
    let mut registry = lock_registry(&state, &trace_id)?;
    let removed = registry.remove_history_entry(&device_id);
    store::persist(&registry);
    Ok(respond(trace_id, removed))
}

pub(crate) fn set_auto_connect_inner(
    state: &AppState,
    device_id: &str,
    enabled: bool,
    trace_id: &str,
) -> Result<(), AppError> {
    let device_id = ensure_non_empty(device_id, "device_id", trace_id)?;
    let mut registry = lock_registry(state, trace_id)?;
    if !registry.set_auto_connect(&device_id, enabled) {
        return Err(AppError::validation(
            "Device is not in the connect history",
            trace_id,
        ));
    }
    store::persist(&registry);
    Ok(())
}

#[tauri::command]
pub fn set_device_auto_connect(
    state: State<'_, AppState>,
    device_id: String,
    enabled: bool,
    trace_id: Option<String>,
) -> Result<CommandResponse<()>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    set_auto_connect_inner(&state, &device_id, enabled, &trace_id)?;
    Ok(respond(trace_id, ()))
}

#[tauri::command]
pub fn clear_history(
    state: State<'_, AppState>,
    trace_id: Option<String>,
) -> Result<CommandResponse<()>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let mut registry = lock_registry(&state, &trace_id)?;
    registry.clear_history();
    store::persist(&registry);
    Ok(respond(trace_id, ()))
}

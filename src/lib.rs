pub mod app;

use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tauri::{Emitter, Manager};
use uuid::Uuid;

use app::adb::gateway::AdbGateway;
use app::adb::locator::resolve_program;
use app::commands::{
    check_adb, check_scrcpy, clear_history, connect_wifi_device, disconnect_wifi_device,
    enable_wireless_mode, get_config, list_devices, list_history, refresh_devices, remove_device,
    remove_history_entry, reset_config, restart_mirror, restore_device, save_app_config,
    set_device_auto_connect, start_mirror, stop_mirror,
};
use app::config::load_config;
use app::logging::init_logging;
use app::mirror::supervisor::{MirrorSupervisor, RepairHook, SessionEmitter, SupervisorTuning};
use app::reconcile::{
    run_startup_autoconnect, start_reconcile_loop, RegistryEmitter, RegistryEvent,
};
use app::recording::run_repair;
use app::registry::store::{load_registry_file, registry_path};
use app::registry::DeviceRegistry;
use app::state::AppState;

#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    init_logging();
    tauri::Builder::default()
        .plugin(tauri_plugin_dialog::init())
        .plugin(tauri_plugin_opener::init())
        .plugin(tauri_plugin_notification::init())
        .setup(|app| {
            let config = load_config().unwrap_or_default();
            let registry = Arc::new(Mutex::new(DeviceRegistry::from_persisted(
                load_registry_file(&registry_path()),
            )));

            let session_handle = app.handle().clone();
            let session_emitter: SessionEmitter = Arc::new(move |event| {
                tracing::debug!(device = %event.device_id(), "forwarding session event");
                let _ = session_handle.emit("mirror-session-event", &event);
            });
            let ffmpeg_program =
                resolve_program(&config.recording.ffmpeg_command_path, "ffmpeg");
            let threshold = config.supervision.corruption_threshold_bytes;
            let repair: RepairHook = Arc::new(move |path, trace_id| {
                run_repair(path, threshold, &ffmpeg_program, trace_id).failure_message()
            });
            let supervisor = Arc::new(MirrorSupervisor::new(
                session_emitter,
                repair,
                SupervisorTuning {
                    liveness_poll: Duration::from_millis(config.supervision.liveness_poll_ms),
                    graceful_timeout: Duration::from_millis(
                        config.supervision.graceful_timeout_ms,
                    ),
                },
            ));

            let state = AppState::new(Arc::clone(&registry), supervisor);

            let registry_handle = app.handle().clone();
            let registry_emitter: RegistryEmitter = Arc::new(move |event| match event {
                RegistryEvent::DeviceListChanged(devices) => {
                    let _ = registry_handle.emit("device-list-changed", &devices);
                }
                RegistryEvent::ReconnectOffer(candidates) => {
                    let _ = registry_handle.emit("reconnect-offer", &candidates);
                }
            });
            let gateway = AdbGateway::new(resolve_program(&config.adb.command_path, "adb"));

            let (tx, rx) = mpsc::channel();
            if let Ok(mut triggers) = state.triggers.lock() {
                *triggers = Some(tx);
            }
            state.reconcile_stop.store(false, Ordering::Relaxed);
            start_reconcile_loop(
                Arc::clone(&registry),
                gateway.clone(),
                rx,
                Duration::from_secs(config.supervision.poll_interval_secs),
                Duration::from_millis(config.supervision.wifi_grace_ms),
                registry_emitter,
                Arc::clone(&state.reconcile_stop),
            );

            // One sequential pass over the saved auto-connect entries; the
            // first interval tick picks up whatever it reconnected.
            let startup_registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                let trace_id = Uuid::new_v4().to_string();
                run_startup_autoconnect(&startup_registry, &gateway, &trace_id);
            });

            app.manage(state);
            Ok(())
        })
        .on_window_event(|window, event| {
            if let tauri::WindowEvent::Focused(focused) = event {
                if *focused {
                    if let Some(state) = window.app_handle().try_state::<AppState>() {
                        let _ =
                            state.request_tick(app::reconcile::TickTrigger::VisibilityRegained);
                    }
                }
            }
        })
        .invoke_handler(tauri::generate_handler![
            get_config,
            save_app_config,
            reset_config,
            check_adb,
            check_scrcpy,
            list_devices,
            refresh_devices,
            connect_wifi_device,
            disconnect_wifi_device,
            enable_wireless_mode,
            start_mirror,
            stop_mirror,
            restart_mirror,
            remove_device,
            restore_device,
            list_history,
            remove_history_entry,
            set_device_auto_connect,
            clear_history
        ])
        .run(tauri::generate_context!())
        .expect("error while running tauri application");
}

use std::collections::HashMap;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::app::adb::gateway::{AdbGateway, TerminateMode};
use crate::app::error::AppError;
use crate::app::mirror::launch::LaunchConfig;
use crate::app::models::{ExitCause, SessionEvent};

pub type SessionEmitter = Arc<dyn Fn(SessionEvent) + Send + Sync>;

/// Post-mortem hook for recordings: given the expected output file, returns
/// a failure message when the file could not be verified or repaired.
pub type RepairHook = Arc<dyn Fn(&Path, &str) -> Option<String> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct SupervisorTuning {
    pub liveness_poll: Duration,
    pub graceful_timeout: Duration,
}

impl Default for SupervisorTuning {
    fn default() -> Self {
        Self {
            liveness_poll: Duration::from_millis(2_000),
            graceful_timeout: Duration::from_millis(1_500),
        }
    }
}

struct MirrorSession {
    pid: u32,
    child: Arc<Mutex<Child>>,
    recording_path: Option<PathBuf>,
    /// Set by the stop path so the liveness poll yields the exit transition
    /// to it instead of reporting a crash.
    stopping: Arc<AtomicBool>,
}

/// Owns every live mirroring process, keyed by device id. OS handles never
/// leave this module; collaborators interact through start/stop/restart and
/// the emitted lifecycle events.
///
/// Per device id there is at most one session, and a termination is always
/// acknowledged before a subsequent start, enforced by a per-device lock
/// rather than global ordering. Different device ids are independent.
pub struct MirrorSupervisor {
    sessions: Arc<Mutex<HashMap<String, MirrorSession>>>,
    device_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    emitter: SessionEmitter,
    repair: RepairHook,
    tuning: SupervisorTuning,
}

impl MirrorSupervisor {
    pub fn new(emitter: SessionEmitter, repair: RepairHook, tuning: SupervisorTuning) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            device_locks: Mutex::new(HashMap::new()),
            emitter,
            repair,
            tuning,
        }
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.sessions
            .lock()
            .map(|sessions| sessions.contains_key(id))
            .unwrap_or(false)
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.sessions
            .lock()
            .map(|sessions| sessions.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Starting while a session exists for the id is a caller error; the
    /// tear-down-relaunch path is `restart`.
    pub fn start(
        &self,
        gateway: &AdbGateway,
        id: &str,
        config: &LaunchConfig,
        trace_id: &str,
    ) -> Result<u32, AppError> {
        let lock = self.device_lock(id);
        let _guard = lock
            .lock()
            .map_err(|_| AppError::system("Device lock poisoned", trace_id))?;
        self.start_locked(gateway, id, config, trace_id)
    }

    pub fn stop(&self, id: &str, forced: bool, trace_id: &str) -> Result<(), AppError> {
        let lock = self.device_lock(id);
        let _guard = lock
            .lock()
            .map_err(|_| AppError::system("Device lock poisoned", trace_id))?;
        self.stop_locked(id, forced, trace_id)
    }

    /// Full teardown then relaunch with the new configuration. scrcpy has no
    /// live-reconfiguration protocol, so this is the only way settings
    /// changes reach a running session.
    pub fn restart(
        &self,
        gateway: &AdbGateway,
        id: &str,
        config: &LaunchConfig,
        trace_id: &str,
    ) -> Result<u32, AppError> {
        let lock = self.device_lock(id);
        let _guard = lock
            .lock()
            .map_err(|_| AppError::system("Device lock poisoned", trace_id))?;
        // A restart with no live session degenerates to a plain start.
        let _ = self.stop_locked(id, false, trace_id);
        self.start_locked(gateway, id, config, trace_id)
    }

    fn start_locked(
        &self,
        gateway: &AdbGateway,
        id: &str,
        config: &LaunchConfig,
        trace_id: &str,
    ) -> Result<u32, AppError> {
        {
            let sessions = self
                .sessions
                .lock()
                .map_err(|_| AppError::system("Session registry locked", trace_id))?;
            if sessions.contains_key(id) {
                return Err(AppError::validation(
                    "A mirroring session is already active for this device",
                    trace_id,
                ));
            }
        }

        // Spawn failure is surfaced synchronously and never retried here.
        let mut child = gateway.spawn_mirror(config, trace_id)?;
        let pid = child.id();

        // Raw process output goes to the log sink only; state transitions
        // are driven exclusively by exit/liveness signals.
        if let Some(stdout) = child.stdout.take() {
            spawn_output_drain(stdout, id.to_string(), "stdout", trace_id.to_string());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_output_drain(stderr, id.to_string(), "stderr", trace_id.to_string());
        }

        let recording_path = config.recording_path.clone();
        let session = MirrorSession {
            pid,
            child: Arc::new(Mutex::new(child)),
            recording_path: recording_path.clone(),
            stopping: Arc::new(AtomicBool::new(false)),
        };
        {
            let mut sessions = self
                .sessions
                .lock()
                .map_err(|_| AppError::system("Session registry locked", trace_id))?;
            sessions.insert(id.to_string(), session);
        }
        self.spawn_liveness_poll(id.to_string(), pid, trace_id.to_string());

        (self.emitter)(SessionEvent::SessionStarted {
            id: id.to_string(),
            pid,
            recording_path: recording_path.map(|p| p.display().to_string()),
            trace_id: trace_id.to_string(),
        });
        Ok(pid)
    }

    fn stop_locked(&self, id: &str, forced: bool, trace_id: &str) -> Result<(), AppError> {
        let session = {
            let mut sessions = self
                .sessions
                .lock()
                .map_err(|_| AppError::system("Session registry locked", trace_id))?;
            sessions.remove(id).ok_or_else(|| {
                AppError::validation("No active mirroring session for this device", trace_id)
            })?
        };
        session.stopping.store(true, Ordering::Relaxed);

        let mode = if forced {
            TerminateMode::Forced
        } else {
            TerminateMode::Graceful
        };
        {
            let mut child = session
                .child
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            AdbGateway::terminate(&mut child, mode, self.tuning.graceful_timeout, trace_id);
        }

        // Repair can take minutes on a large recording; it must not run
        // under the device lock, or a restart would block behind it.
        let emitter = Arc::clone(&self.emitter);
        let repair = Arc::clone(&self.repair);
        let id = id.to_string();
        let trace_id = trace_id.to_string();
        std::thread::spawn(move || {
            finish_session_with(
                &emitter,
                &repair,
                &id,
                session.pid,
                ExitCause::Stopped,
                session.recording_path.as_deref(),
                &trace_id,
            );
        });
        Ok(())
    }

    /// Safety net for exits the stop path never sees (crash, host-level
    /// kill). The poll and the stop path converge on the map removal: the
    /// first to remove the entry owns the session-ended transition.
    fn spawn_liveness_poll(&self, id: String, pid: u32, trace_id: String) {
        let sessions = Arc::clone(&self.sessions);
        let emitter = Arc::clone(&self.emitter);
        let repair = Arc::clone(&self.repair);
        let interval = self.tuning.liveness_poll;

        std::thread::spawn(move || loop {
            std::thread::sleep(interval);

            let ended = {
                let mut guard = match sessions.lock() {
                    Ok(guard) => guard,
                    Err(_) => return,
                };
                let Some(session) = guard.get(&id) else {
                    // Stopped explicitly, nothing left to watch.
                    return;
                };
                if session.pid != pid {
                    // Superseded by a restart; its own poll took over.
                    return;
                }
                if session.stopping.load(Ordering::Relaxed) {
                    continue;
                }
                let exited = {
                    let mut child = match session.child.lock() {
                        Ok(child) => child,
                        Err(_) => return,
                    };
                    match child.try_wait() {
                        Ok(status) => status.is_some(),
                        Err(err) => {
                            warn!(trace_id = %trace_id, device = %id, error = %err, "failed to poll mirror process");
                            true
                        }
                    }
                };
                if exited {
                    guard.remove(&id)
                } else {
                    None
                }
            };

            if let Some(session) = ended {
                finish_session_with(
                    &emitter,
                    &repair,
                    &id,
                    session.pid,
                    ExitCause::Crashed,
                    session.recording_path.as_deref(),
                    &trace_id,
                );
                return;
            }
        });
    }

    fn device_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut guard = self
            .device_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

fn finish_session_with(
    emitter: &SessionEmitter,
    repair: &RepairHook,
    id: &str,
    pid: u32,
    cause: ExitCause,
    recording_path: Option<&Path>,
    trace_id: &str,
) {
    let repair_error = recording_path.and_then(|path| (repair)(path, trace_id));
    (emitter)(SessionEvent::SessionExited {
        id: id.to_string(),
        pid,
        cause,
        recording_path: recording_path.map(|p| p.display().to_string()),
        repair_error,
        trace_id: trace_id.to_string(),
    });
}

fn spawn_output_drain(
    reader: impl std::io::Read + Send + 'static,
    id: String,
    stream: &'static str,
    trace_id: String,
) {
    std::thread::spawn(move || {
        let reader = std::io::BufReader::new(reader);
        for line in reader.lines() {
            match line {
                Ok(line) => {
                    debug!(trace_id = %trace_id, device = %id, stream = %stream, line = %line, "mirror output")
                }
                Err(_) => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    fn test_supervisor(
        repair: RepairHook,
    ) -> (MirrorSupervisor, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel::<SessionEvent>();
        let emitter: SessionEmitter = Arc::new(move |event| {
            let _ = tx.send(event);
        });
        let tuning = SupervisorTuning {
            liveness_poll: Duration::from_millis(50),
            graceful_timeout: Duration::from_millis(200),
        };
        (MirrorSupervisor::new(emitter, repair, tuning), rx)
    }

    fn no_repair() -> RepairHook {
        Arc::new(|_, _| None)
    }

    fn config_for(program: &str, args: &[&str]) -> LaunchConfig {
        LaunchConfig {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: Vec::new(),
            recording_path: None,
        }
    }

    fn wait_for_exit(rx: &mpsc::Receiver<SessionEvent>) -> SessionEvent {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Ok(event) = rx.recv_timeout(Duration::from_millis(100)) {
                if matches!(event, SessionEvent::SessionExited { .. }) {
                    return event;
                }
            }
        }
        panic!("no exit event within deadline");
    }

    #[cfg(unix)]
    #[test]
    fn at_most_one_session_per_device() {
        let (supervisor, rx) = test_supervisor(no_repair());
        let gateway = AdbGateway::new("adb");
        let config = config_for("sleep", &["30"]);

        supervisor
            .start(&gateway, "ABC123", &config, "t")
            .expect("first start");
        assert!(supervisor.is_active("ABC123"));
        let err = supervisor
            .start(&gateway, "ABC123", &config, "t")
            .expect_err("second start must fail");
        assert_eq!(err.code, "ERR_VALIDATION");

        supervisor.stop("ABC123", true, "t").expect("stop");
        assert!(!supervisor.is_active("ABC123"));
        drop(rx);
    }

    #[cfg(unix)]
    #[test]
    fn stop_emits_a_stopped_exit() {
        let (supervisor, rx) = test_supervisor(no_repair());
        let gateway = AdbGateway::new("adb");
        supervisor
            .start(&gateway, "ABC123", &config_for("sleep", &["30"]), "t")
            .expect("start");

        match rx.recv_timeout(Duration::from_secs(1)).expect("started event") {
            SessionEvent::SessionStarted { id, pid, .. } => {
                assert_eq!(id, "ABC123");
                assert!(pid > 0);
            }
            other => panic!("expected started, got {other:?}"),
        }

        supervisor.stop("ABC123", false, "t").expect("stop");
        let event = wait_for_exit(&rx);
        assert_eq!(event.device_id(), "ABC123");
        match event {
            SessionEvent::SessionExited { cause, .. } => {
                assert_eq!(cause, ExitCause::Stopped);
            }
            other => panic!("expected exited, got {other:?}"),
        }
        // Stop again: nothing to stop.
        assert!(supervisor.stop("ABC123", false, "t").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn liveness_poll_detects_a_crash() {
        let (supervisor, rx) = test_supervisor(no_repair());
        let gateway = AdbGateway::new("adb");
        // `true` exits immediately, simulating a crashed mirror process.
        supervisor
            .start(&gateway, "ABC123", &config_for("true", &[]), "t")
            .expect("start");

        match wait_for_exit(&rx) {
            SessionEvent::SessionExited { cause, .. } => assert_eq!(cause, ExitCause::Crashed),
            other => panic!("expected exited, got {other:?}"),
        }
        assert!(!supervisor.is_active("ABC123"));
    }

    #[cfg(unix)]
    #[test]
    fn restart_tears_down_then_relaunches() {
        let (supervisor, rx) = test_supervisor(no_repair());
        let gateway = AdbGateway::new("adb");
        let first_pid = supervisor
            .start(&gateway, "ABC123", &config_for("sleep", &["30"]), "t")
            .expect("start");

        let second_pid = supervisor
            .restart(&gateway, "ABC123", &config_for("sleep", &["30"]), "t")
            .expect("restart");
        assert_ne!(first_pid, second_pid);
        assert!(supervisor.is_active("ABC123"));

        // started(first) comes first; the stopped exit of the first session
        // and started(second) may land in either order since the exit is
        // reported off the restart path.
        let mut events = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        while events.len() < 3 && Instant::now() < deadline {
            if let Ok(event) = rx.recv_timeout(Duration::from_millis(100)) {
                events.push(event);
            }
        }
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], SessionEvent::SessionStarted { pid, .. } if pid == first_pid));
        assert!(events.iter().any(|event| matches!(
            event,
            SessionEvent::SessionExited { pid, cause: ExitCause::Stopped, .. } if *pid == first_pid
        )));
        assert!(events.iter().any(|event| matches!(
            event,
            SessionEvent::SessionStarted { pid, .. } if *pid == second_pid
        )));

        supervisor.stop("ABC123", true, "t").expect("cleanup");
    }

    #[cfg(unix)]
    #[test]
    fn recording_sessions_run_the_repair_hook_on_exit() {
        let calls: Arc<Mutex<Vec<PathBuf>>> = Arc::new(Mutex::new(Vec::new()));
        let calls_hook = Arc::clone(&calls);
        let repair: RepairHook = Arc::new(move |path, _trace_id| {
            calls_hook
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(path.to_path_buf());
            Some("repair failed".to_string())
        });
        let (supervisor, rx) = test_supervisor(repair);
        let gateway = AdbGateway::new("adb");

        let mut config = config_for("true", &[]);
        config.recording_path = Some(PathBuf::from("/tmp/mirror_test.mp4"));
        supervisor
            .start(&gateway, "ABC123", &config, "t")
            .expect("start");

        match wait_for_exit(&rx) {
            SessionEvent::SessionExited {
                recording_path,
                repair_error,
                ..
            } => {
                assert_eq!(recording_path.as_deref(), Some("/tmp/mirror_test.mp4"));
                assert_eq!(repair_error.as_deref(), Some("repair failed"));
            }
            other => panic!("expected exited, got {other:?}"),
        }
        let calls = calls.lock().unwrap_or_else(|p| p.into_inner());
        assert_eq!(calls.as_slice(), &[PathBuf::from("/tmp/mirror_test.mp4")]);
    }

    #[cfg(unix)]
    #[test]
    fn sessions_on_different_devices_are_independent() {
        let (supervisor, _rx) = test_supervisor(no_repair());
        let gateway = AdbGateway::new("adb");
        supervisor
            .start(&gateway, "A", &config_for("sleep", &["30"]), "t")
            .expect("start A");
        supervisor
            .start(&gateway, "B", &config_for("sleep", &["30"]), "t")
            .expect("start B");
        let mut ids = supervisor.active_ids();
        ids.sort();
        assert_eq!(ids, vec!["A".to_string(), "B".to_string()]);
        supervisor.stop("A", true, "t").expect("stop A");
        supervisor.stop("B", true, "t").expect("stop B");
    }

    #[cfg(unix)]
    #[test]
    fn slow_repair_never_blocks_stop_or_the_next_start() {
        let repair: RepairHook = Arc::new(|_, _| {
            std::thread::sleep(Duration::from_millis(500));
            Some("slow repair".to_string())
        });
        let (supervisor, rx) = test_supervisor(repair);
        let gateway = AdbGateway::new("adb");

        let mut config = config_for("sleep", &["30"]);
        config.recording_path = Some(PathBuf::from("/tmp/mirror_slow.mp4"));
        supervisor
            .start(&gateway, "ABC123", &config, "t")
            .expect("start");

        let before_stop = Instant::now();
        supervisor.stop("ABC123", true, "t").expect("stop");
        assert!(before_stop.elapsed() < Duration::from_millis(400));

        // The device is immediately available for a fresh session.
        supervisor
            .start(&gateway, "ABC123", &config_for("sleep", &["30"]), "t")
            .expect("restart while repair is still running");

        match wait_for_exit(&rx) {
            SessionEvent::SessionExited { repair_error, .. } => {
                assert_eq!(repair_error.as_deref(), Some("slow repair"));
            }
            other => panic!("expected exited, got {other:?}"),
        }
        supervisor.stop("ABC123", true, "t").expect("cleanup");
    }
}

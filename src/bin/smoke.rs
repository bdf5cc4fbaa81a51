use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use mirror_desk_lib::app::adb::gateway::AdbGateway;
use mirror_desk_lib::app::adb::locator::{probe_adb, probe_scrcpy, resolve_program};
use mirror_desk_lib::app::config::load_config;
use mirror_desk_lib::app::mirror::launch::{build_launch_config, SessionOverrides};
use mirror_desk_lib::app::mirror::supervisor::{
    MirrorSupervisor, RepairHook, SessionEmitter, SupervisorTuning,
};
use mirror_desk_lib::app::models::SessionEvent;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Args {
    serial: Option<String>,
    out_dir: Option<PathBuf>,
    json: bool,
    with_mirror: bool,
    mirror_seconds: u64,
}

#[derive(Serialize)]
struct SmokeSummary {
    tool: &'static str,
    status: &'static str,
    trace_id: String,
    serial: Option<String>,
    adb_program: Option<String>,
    out_dir: String,
    artifacts: HashMap<String, String>,
    checks: Vec<SmokeCheck>,
}

#[derive(Serialize)]
struct SmokeCheck {
    name: &'static str,
    status: &'static str, // pass|fail|warn|skip
    duration_ms: u128,
    artifacts: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn parse_args() -> Result<Args, String> {
    let mut serial = std::env::var("ANDROID_SERIAL")
        .ok()
        .filter(|s| !s.trim().is_empty());
    let mut out_dir: Option<PathBuf> = None;
    let mut json = false;
    let mut with_mirror = false;
    let mut mirror_seconds = 3;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--serial" => {
                serial = it
                    .next()
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty());
                if serial.is_none() {
                    return Err("--serial requires a value".to_string());
                }
            }
            "--out" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--out requires a value".to_string())?;
                out_dir = Some(PathBuf::from(value));
            }
            "--json" => {
                json = true;
            }
            "--with-mirror" => {
                with_mirror = true;
            }
            "--mirror-seconds" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--mirror-seconds requires a value".to_string())?;
                mirror_seconds = value
                    .parse()
                    .map_err(|_| "--mirror-seconds must be a number".to_string())?;
            }
            "-h" | "--help" => {
                return Err(
                    "Usage: cargo run --bin smoke -- [--serial SERIAL] [--out DIR] [--json] [--with-mirror] [--mirror-seconds N]\n"
                        .to_string(),
                );
            }
            other => return Err(format!("Unknown arg: {other}")),
        }
    }

    Ok(Args {
        serial,
        out_dir,
        json,
        with_mirror,
        mirror_seconds,
    })
}

fn ensure_dir(path: &Path) -> Result<(), String> {
    fs::create_dir_all(path)
        .map_err(|err| format!("Failed to create dir {}: {err}", path.display()))
}

fn pick_single_device(gateway: &AdbGateway, trace_id: &str) -> Result<String, String> {
    let devices = gateway
        .query_device_list(trace_id)
        .map_err(|err| err.to_string())?;
    let online: Vec<_> = devices
        .into_iter()
        .filter(|d| d.state == "device")
        .collect();
    if online.is_empty() {
        return Err("No online adb devices found.".to_string());
    }
    if online.len() > 1 {
        let ids = online
            .into_iter()
            .map(|d| d.id)
            .collect::<Vec<_>>()
            .join(", ");
        return Err(format!(
            "Multiple online devices found ({ids}). Set ANDROID_SERIAL or pass --serial."
        ));
    }
    Ok(online[0].id.clone())
}

fn run_check<F>(checks: &mut Vec<SmokeCheck>, name: &'static str, f: F) -> Result<(), ()>
where
    F: FnOnce() -> Result<
        (Vec<String>, Option<&'static str>, Option<String>),
        (&'static str, String),
    >,
{
    let start = Instant::now();
    match f() {
        Ok((artifacts, error_code, error)) => {
            checks.push(SmokeCheck {
                name,
                status: if error_code.is_some() || error.is_some() {
                    "warn"
                } else {
                    "pass"
                },
                duration_ms: start.elapsed().as_millis(),
                artifacts,
                error_code,
                error,
            });
            Ok(())
        }
        Err((code, err)) => {
            checks.push(SmokeCheck {
                name,
                status: "fail",
                duration_ms: start.elapsed().as_millis(),
                artifacts: vec![],
                error_code: Some(code),
                error: Some(err),
            });
            Err(())
        }
    }
}

fn run_warn<F>(checks: &mut Vec<SmokeCheck>, name: &'static str, f: F)
where
    F: FnOnce() -> Result<(Vec<String>, Option<String>), (&'static str, String)>,
{
    let start = Instant::now();
    match f() {
        Ok((artifacts, warning)) => {
            checks.push(SmokeCheck {
                name,
                status: if warning.is_some() { "warn" } else { "pass" },
                duration_ms: start.elapsed().as_millis(),
                artifacts,
                error_code: warning.as_ref().map(|_| "WARN"),
                error: warning,
            });
        }
        Err((code, err)) => {
            checks.push(SmokeCheck {
                name,
                status: "warn",
                duration_ms: start.elapsed().as_millis(),
                artifacts: vec![],
                error_code: Some(code),
                error: Some(err),
            });
        }
    }
}

fn main() {
    let args = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };

    let trace_id = Uuid::new_v4().to_string();

    let out_dir = args.out_dir.unwrap_or_else(|| {
        let mut p = std::env::temp_dir();
        p.push(format!("mirror_desk_smoke_{trace_id}"));
        p
    });
    if let Err(err) = ensure_dir(&out_dir) {
        eprintln!("{err}");
        std::process::exit(1);
    }

    let mut artifacts: HashMap<String, String> = HashMap::new();
    let mut checks: Vec<SmokeCheck> = Vec::new();
    let mut status = "pass";

    let config = match load_config() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("Failed to load config: {err}");
            std::process::exit(1);
        }
    };
    let adb_program = resolve_program(&config.adb.command_path, "adb");
    let scrcpy_program = resolve_program(&config.server.scrcpy_command_path, "scrcpy");
    let gateway = AdbGateway::new(adb_program.clone());

    // check_adb (hard requirement)
    if run_check(&mut checks, "check_adb", || {
        let info = probe_adb(&adb_program);
        if !info.available {
            return Err((
                "ERR_CHECK_ADB",
                info.error.unwrap_or_else(|| "adb unavailable".to_string()),
            ));
        }
        let path = out_dir.join("check_adb.txt");
        fs::write(&path, &info.version_output)
            .map_err(|err| ("ERR_IO", format!("Failed to write check_adb output: {err}")))?;
        artifacts.insert("check_adb".to_string(), path.to_string_lossy().to_string());
        Ok((vec![path.to_string_lossy().to_string()], None, None))
    })
    .is_err()
    {
        status = "fail";
    }

    // check_scrcpy (warn if not available)
    run_warn(&mut checks, "check_scrcpy", || {
        let info = probe_scrcpy(&scrcpy_program);
        let path = out_dir.join("check_scrcpy.json");
        let body = serde_json::to_string_pretty(&info)
            .map_err(|err| ("WARN_SCRCPY", format!("Failed to serialize scrcpy info: {err}")))?;
        fs::write(&path, body)
            .map_err(|err| ("WARN_SCRCPY", format!("Failed to write scrcpy info: {err}")))?;
        artifacts.insert(
            "check_scrcpy".to_string(),
            path.to_string_lossy().to_string(),
        );
        if info.available {
            Ok((vec![path.to_string_lossy().to_string()], None))
        } else {
            Ok((
                vec![path.to_string_lossy().to_string()],
                Some("scrcpy not available (optional).".to_string()),
            ))
        }
    });

    // device_list (real adb query through the gateway)
    if run_check(&mut checks, "device_list", || {
        let devices = gateway
            .query_device_list(&trace_id)
            .map_err(|err| ("ERR_DEVICE_LIST", err.to_string()))?;
        let path = out_dir.join("devices.json");
        let body = serde_json::to_string_pretty(&devices)
            .map_err(|err| ("ERR_IO", format!("Failed to serialize devices: {err}")))?;
        fs::write(&path, body)
            .map_err(|err| ("ERR_IO", format!("Failed to write devices: {err}")))?;
        artifacts.insert("devices".to_string(), path.to_string_lossy().to_string());
        Ok((vec![path.to_string_lossy().to_string()], None, None))
    })
    .is_err()
    {
        status = "fail";
    }

    let serial = match args.serial.clone() {
        Some(s) => Some(s),
        None => pick_single_device(&gateway, &trace_id).ok(),
    };

    // Short mirror start/stop cycle through the real supervisor.
    if args.with_mirror {
        let serial = serial.clone();
        if run_check(&mut checks, "mirror_start_stop", || {
            let serial = serial.ok_or_else(|| {
                (
                    "ERR_NO_DEVICE",
                    "No device available for the mirror check.".to_string(),
                )
            })?;
            let (tx, rx) = mpsc::channel::<SessionEvent>();
            let emitter: SessionEmitter = Arc::new(move |event| {
                let _ = tx.send(event);
            });
            let repair: RepairHook = Arc::new(|_, _| None);
            let supervisor =
                MirrorSupervisor::new(emitter, repair, SupervisorTuning::default());

            let launch = build_launch_config(
                &serial,
                &config.display,
                &config.encoding,
                &config.server,
                &config.recording,
                &SessionOverrides::default(),
                &scrcpy_program,
                &adb_program,
                None,
            );
            supervisor
                .start(&gateway, &serial, &launch, &trace_id)
                .map_err(|err| ("ERR_MIRROR_START", err.to_string()))?;
            std::thread::sleep(Duration::from_secs(args.mirror_seconds));
            supervisor
                .stop(&serial, false, &trace_id)
                .map_err(|err| ("ERR_MIRROR_STOP", err.to_string()))?;

            let events: Vec<SessionEvent> = rx.try_iter().collect();
            let path = out_dir.join("mirror_events.json");
            let body = serde_json::to_string_pretty(&events)
                .map_err(|err| ("ERR_IO", format!("Failed to serialize events: {err}")))?;
            fs::write(&path, body)
                .map_err(|err| ("ERR_IO", format!("Failed to write events: {err}")))?;
            artifacts.insert(
                "mirror_events".to_string(),
                path.to_string_lossy().to_string(),
            );

            let started = events
                .iter()
                .any(|e| matches!(e, SessionEvent::SessionStarted { .. }));
            let exited = events
                .iter()
                .any(|e| matches!(e, SessionEvent::SessionExited { .. }));
            if started && exited {
                Ok((vec![path.to_string_lossy().to_string()], None, None))
            } else {
                Err((
                    "ERR_MIRROR_EVENTS",
                    "Mirror session did not emit both lifecycle events.".to_string(),
                ))
            }
        })
        .is_err()
        {
            status = "fail";
        }
    } else {
        checks.push(SmokeCheck {
            name: "mirror_start_stop",
            status: "skip",
            duration_ms: 0,
            artifacts: vec![],
            error_code: None,
            error: None,
        });
    }

    let summary = SmokeSummary {
        tool: "mirror_desk_backend_smoke",
        status,
        trace_id: trace_id.clone(),
        serial,
        adb_program: Some(adb_program),
        out_dir: out_dir.to_string_lossy().to_string(),
        artifacts,
        checks,
    };

    let output = if args.json {
        serde_json::to_string_pretty(&summary).unwrap_or_else(|_| "{}".to_string())
    } else {
        format!(
            "status: {}\ntrace_id: {}\nout: {}\n",
            summary.status, summary.trace_id, summary.out_dir
        )
    };

    println!("{output}");
    if summary.status != "pass" {
        std::process::exit(1);
    }
}

use std::io::Write;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::app::adb::locator::validate_program;
use crate::app::adb::parse::{classify_connect_output, parse_devices_output, parse_route_source_ip};
use crate::app::adb::runner::{run_command, run_command_with_timeout};
use crate::app::error::AppError;
use crate::app::mirror::launch::LaunchConfig;
use crate::app::models::{AdbDevice, ConnectOutcome, WirelessMode};

pub const QUIT_COMMAND: &[u8] = b"q\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateMode {
    Graceful,
    Forced,
}

/// The single owner of external-binary invocations. Everything above this
/// boundary sees structured results; adb/scrcpy exit codes and stdout quirks
/// never leak upward.
#[derive(Debug, Clone)]
pub struct AdbGateway {
    adb_program: String,
}

impl AdbGateway {
    pub fn new(adb_program: impl Into<String>) -> Self {
        Self {
            adb_program: adb_program.into(),
        }
    }

    pub fn adb_program(&self) -> &str {
        &self.adb_program
    }

    pub fn query_device_list(&self, trace_id: &str) -> Result<Vec<AdbDevice>, AppError> {
        let args = vec!["devices".to_string(), "-l".to_string()];
        let output = run_command(&self.adb_program, &args, trace_id)?;
        if !output.succeeded() {
            return Err(AppError::dependency(
                format!("adb devices failed: {}", output.stderr.trim()),
                trace_id,
            ));
        }
        Ok(parse_devices_output(&output.stdout))
    }

    pub fn connect(&self, address: &str, trace_id: &str) -> Result<ConnectOutcome, AppError> {
        let args = vec!["connect".to_string(), address.to_string()];
        let output = run_command(&self.adb_program, &args, trace_id)?;
        Ok(classify_connect_output(&output.stdout, &output.stderr))
    }

    pub fn disconnect(&self, address: &str, trace_id: &str) -> Result<(), AppError> {
        let args = vec!["disconnect".to_string(), address.to_string()];
        let output = run_command(&self.adb_program, &args, trace_id)?;
        if !output.succeeded() {
            return Err(AppError::dependency(
                format!("adb disconnect failed: {}", output.stderr.trim()),
                trace_id,
            ));
        }
        Ok(())
    }

    /// Switches a USB device's debug transport to TCP. The routing-table
    /// probe is best-effort: the transport switch still counts as success
    /// with `ip: None`, and the caller falls back to manual entry.
    pub fn enable_wireless_mode(
        &self,
        serial: &str,
        port: u16,
        trace_id: &str,
    ) -> Result<WirelessMode, AppError> {
        let route_args = vec![
            "-s".to_string(),
            serial.to_string(),
            "shell".to_string(),
            "ip".to_string(),
            "route".to_string(),
        ];
        let ip = match run_command_with_timeout(
            &self.adb_program,
            &route_args,
            Duration::from_secs(5),
            trace_id,
        ) {
            Ok(output) if output.succeeded() => parse_route_source_ip(&output.stdout),
            Ok(_) | Err(_) => None,
        };

        let tcpip_args = vec![
            "-s".to_string(),
            serial.to_string(),
            "tcpip".to_string(),
            port.to_string(),
        ];
        let output = run_command(&self.adb_program, &tcpip_args, trace_id)?;
        if !output.succeeded() {
            return Err(AppError::dependency(
                format!("adb tcpip failed: {}", output.stderr.trim()),
                trace_id,
            ));
        }

        Ok(WirelessMode { ip, port })
    }

    /// Spawns the mirroring binary. Fails synchronously, with nothing
    /// spawned, when an explicit binary path does not exist on disk.
    pub fn spawn_mirror(&self, config: &LaunchConfig, trace_id: &str) -> Result<Child, AppError> {
        validate_program(&config.program).map_err(|err| AppError::dependency(err, trace_id))?;

        let mut command = Command::new(&config.program);
        command
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &config.env {
            command.env(key, value);
        }
        command
            .spawn()
            .map_err(|err| AppError::dependency(format!("Failed to spawn mirror: {err}"), trace_id))
    }

    /// Terminates a supervised child. Graceful mode writes the quit command
    /// to the process's stdin and waits up to `grace` before escalating;
    /// forced mode kills immediately. Either way the child is reaped and
    /// this never blocks past the grace period.
    pub fn terminate(child: &mut Child, mode: TerminateMode, grace: Duration, trace_id: &str) {
        if mode == TerminateMode::Graceful {
            if let Some(stdin) = child.stdin.as_mut() {
                let _ = stdin.write_all(QUIT_COMMAND);
                let _ = stdin.flush();
            }
            let deadline = Instant::now() + grace;
            loop {
                match child.try_wait() {
                    Ok(Some(_)) => return,
                    Ok(None) => {
                        if Instant::now() >= deadline {
                            break;
                        }
                        std::thread::sleep(Duration::from_millis(50));
                    }
                    Err(err) => {
                        warn!(trace_id = %trace_id, error = %err, "failed to poll mirror during shutdown");
                        break;
                    }
                }
            }
        }
        let _ = child.kill();
        let _ = child.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::mirror::launch::LaunchConfig;

    fn config_for(program: &str, args: &[&str]) -> LaunchConfig {
        LaunchConfig {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: Vec::new(),
            recording_path: None,
        }
    }

    #[test]
    fn spawn_fails_synchronously_for_missing_binary_path() {
        let gateway = AdbGateway::new("adb");
        let config = config_for("/this/binary/does/not/exist/scrcpy", &[]);
        let err = gateway
            .spawn_mirror(&config, "t")
            .err()
            .expect("expected spawn failure");
        assert_eq!(err.code, "ERR_DEPENDENCY");
    }

    #[cfg(unix)]
    #[test]
    fn forced_terminate_reaps_the_child() {
        let gateway = AdbGateway::new("adb");
        let config = config_for("sleep", &["30"]);
        let mut child = gateway.spawn_mirror(&config, "t").expect("spawn sleep");
        AdbGateway::terminate(&mut child, TerminateMode::Forced, Duration::from_secs(1), "t");
        assert!(child.try_wait().expect("try_wait").is_some());
    }

    #[cfg(unix)]
    #[test]
    fn graceful_terminate_escalates_within_the_grace_period() {
        let gateway = AdbGateway::new("adb");
        // sleep ignores stdin, so graceful shutdown must escalate to kill.
        let config = config_for("sleep", &["30"]);
        let mut child = gateway.spawn_mirror(&config, "t").expect("spawn sleep");
        let start = Instant::now();
        AdbGateway::terminate(
            &mut child,
            TerminateMode::Graceful,
            Duration::from_millis(200),
            "t",
        );
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(child.try_wait().expect("try_wait").is_some());
    }

    #[cfg(unix)]
    #[test]
    fn graceful_terminate_honors_a_cooperative_child() {
        let gateway = AdbGateway::new("adb");
        // head exits as soon as it has read one line, i.e. on the quit command.
        let config = config_for("head", &["-n", "1"]);
        let mut child = gateway.spawn_mirror(&config, "t").expect("spawn head");
        AdbGateway::terminate(
            &mut child,
            TerminateMode::Graceful,
            Duration::from_secs(5),
            "t",
        );
        assert!(child.try_wait().expect("try_wait").is_some());
    }
}

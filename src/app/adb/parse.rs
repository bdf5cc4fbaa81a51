use regex::Regex;

use crate::app::models::{AdbDevice, ConnectFailure, ConnectOutcome};

pub const UNKNOWN_DEVICE_NAME: &str = "Unknown device";

/// Parses `adb devices -l` output. A line counts as a device entry only when
/// it has at least two whitespace-separated fields and its state field is
/// `device` or `unauthorized`; everything else (header, daemon chatter,
/// `offline` transients) is skipped.
pub fn parse_devices_output(output: &str) -> Vec<AdbDevice> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !line.trim_start().starts_with('*'))
        .filter(|line| !line.to_lowercase().contains("list of devices"))
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 2 {
                return None;
            }
            let state = tokens[1];
            if state != "device" && state != "unauthorized" {
                return None;
            }
            let name = tokens
                .iter()
                .skip(2)
                .find_map(|token| token.strip_prefix("model:"))
                .map(|value| value.replace('_', " "))
                .or_else(|| tokens.get(2).map(|value| value.to_string()))
                .unwrap_or_else(|| UNKNOWN_DEVICE_NAME.to_string());
            Some(AdbDevice {
                id: tokens[0].to_string(),
                state: state.to_string(),
                name,
            })
        })
        .collect()
}

/// Extracts the host-reachable source IP from `adb shell ip route` output.
pub fn parse_route_source_ip(output: &str) -> Option<String> {
    let re = Regex::new(r"\bsrc\s+((?:\d{1,3}\.){3}\d{1,3})").ok()?;
    for line in output.lines() {
        if let Some(caps) = re.captures(line) {
            return Some(caps[1].to_string());
        }
    }
    None
}

/// Classifies `adb connect` output. adb reports success on stdout with exit
/// code 0 even for some failures, so the verdict comes from substring
/// matching rather than the exit code.
pub fn classify_connect_output(stdout: &str, stderr: &str) -> ConnectOutcome {
    let combined = format!("{stdout}\n{stderr}").to_lowercase();
    if combined.contains("already connected") {
        return ConnectOutcome::AlreadyConnected;
    }
    if combined.contains("cannot connect")
        || combined.contains("failed to connect")
        || combined.contains("unable to connect")
    {
        return ConnectOutcome::Failed {
            failure: classify_connect_failure(&combined),
            detail: first_non_empty_line(stdout, stderr),
        };
    }
    if combined.contains("connected") {
        return ConnectOutcome::Connected;
    }
    ConnectOutcome::Failed {
        failure: classify_connect_failure(&combined),
        detail: first_non_empty_line(stdout, stderr),
    }
}

fn classify_connect_failure(lowercase: &str) -> ConnectFailure {
    if lowercase.contains("refused") {
        ConnectFailure::Refused
    } else if lowercase.contains("timed out") || lowercase.contains("timeout") {
        ConnectFailure::Timeout
    } else if lowercase.contains("no route to host") {
        ConnectFailure::NoRoute
    } else {
        ConnectFailure::Other
    }
}

fn first_non_empty_line(stdout: &str, stderr: &str) -> String {
    stderr
        .lines()
        .chain(stdout.lines())
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_devices_output() {
        let output = "List of devices attached\n\
                      0123456789ABCDEF device product:sdk model:Pixel_7 device:panther\n\
                      192.168.1.20:5555 device model:Galaxy_S23\n\
                      emulator-5554 unauthorized transport_id:2\n\
                      deadbeef offline\n\
                      * daemon started successfully *\n";
        let parsed = parse_devices_output(output);
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].id, "0123456789ABCDEF");
        assert_eq!(parsed[0].state, "device");
        assert_eq!(parsed[0].name, "Pixel 7");
        assert_eq!(parsed[1].id, "192.168.1.20:5555");
        assert_eq!(parsed[2].state, "unauthorized");
    }

    #[test]
    fn device_name_falls_back_to_third_field_then_placeholder() {
        let parsed = parse_devices_output("SER123 device transport_id:4\n");
        assert_eq!(parsed[0].name, "transport_id:4");
        let parsed = parse_devices_output("SER123 device\n");
        assert_eq!(parsed[0].name, UNKNOWN_DEVICE_NAME);
    }

    #[test]
    fn skips_short_and_offline_lines() {
        let parsed = parse_devices_output("lonely\nSER offline\nSER2 bootloader\n");
        assert!(parsed.is_empty());
    }

    #[test]
    fn parses_route_source_ip() {
        let output = "192.168.1.0/24 dev wlan0 proto kernel scope link src 192.168.1.42\n";
        assert_eq!(
            parse_route_source_ip(output).as_deref(),
            Some("192.168.1.42")
        );
        assert_eq!(parse_route_source_ip("no route entries"), None);
    }

    #[test]
    fn classifies_connect_success_variants() {
        assert_eq!(
            classify_connect_output("connected to 192.168.1.20:5555", ""),
            ConnectOutcome::Connected
        );
        assert_eq!(
            classify_connect_output("already connected to 192.168.1.20:5555", ""),
            ConnectOutcome::AlreadyConnected
        );
    }

    #[test]
    fn classifies_connect_failures() {
        let refused =
            classify_connect_output("cannot connect to 192.168.1.20:5555: Connection refused", "");
        assert_eq!(
            refused,
            ConnectOutcome::Failed {
                failure: ConnectFailure::Refused,
                detail: "cannot connect to 192.168.1.20:5555: Connection refused".to_string(),
            }
        );

        match classify_connect_output("failed to connect to '192.168.1.20:5555': Operation timed out", "") {
            ConnectOutcome::Failed { failure, .. } => assert_eq!(failure, ConnectFailure::Timeout),
            other => panic!("expected failure, got {other:?}"),
        }
        match classify_connect_output("cannot connect: No route to host", "") {
            ConnectOutcome::Failed { failure, .. } => assert_eq!(failure, ConnectFailure::NoRoute),
            other => panic!("expected failure, got {other:?}"),
        }
        match classify_connect_output("", "something exploded") {
            ConnectOutcome::Failed { failure, detail } => {
                assert_eq!(failure, ConnectFailure::Other);
                assert_eq!(detail, "something exploded");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }
}

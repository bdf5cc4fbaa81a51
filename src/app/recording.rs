use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use crate::app::adb::runner::run_command_with_timeout;

/// Repair strategies in order of preference. Remux rewrites the container
/// index without touching the streams and is fast; re-encode is the slow
/// fallback for payloads the muxer refuses to copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairStrategy {
    Remux,
    Reencode,
}

pub const REPAIR_STRATEGIES: [RepairStrategy; 2] = [RepairStrategy::Remux, RepairStrategy::Reencode];

impl RepairStrategy {
    pub fn args(&self, input: &Path, output: &Path) -> Vec<String> {
        let mut args = vec![
            "-y".to_string(),
            "-i".to_string(),
            input.display().to_string(),
        ];
        match self {
            RepairStrategy::Remux => {
                args.push("-c".to_string());
                args.push("copy".to_string());
            }
            RepairStrategy::Reencode => {
                args.extend(
                    ["-c:v", "libx264", "-preset", "veryfast", "-c:a", "aac"]
                        .iter()
                        .map(|s| s.to_string()),
                );
            }
        }
        args.push(output.display().to_string());
        args
    }

    pub fn timeout(&self) -> Duration {
        match self {
            RepairStrategy::Remux => Duration::from_secs(60),
            RepairStrategy::Reencode => Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardVerdict {
    /// No output file was produced; nothing to repair.
    MissingFile,
    /// The file is large enough that the container was finalized.
    Plausible,
    Repaired(RepairStrategy),
    /// Every strategy failed; the original file was left in place.
    Failed(String),
}

impl GuardVerdict {
    /// The only user-visible case; successful repair stays silent.
    pub fn failure_message(&self) -> Option<String> {
        match self {
            GuardVerdict::Failed(message) => Some(message.clone()),
            _ => None,
        }
    }
}

fn repair_scratch_path(path: &Path) -> PathBuf {
    // Keep the extension so the transcoder can infer the container format.
    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_string())
        .unwrap_or_else(|| "mp4".to_string());
    path.with_extension(format!("repair.{extension}"))
}

/// Post-mortem check of a recording after its session ended. A file below
/// `threshold` bytes means the container index was never written because the
/// process died mid-write; strategies run in order and the first one that
/// produces a valid, non-empty replacement atomically takes the original's
/// place.
///
/// Generic over the strategy runner so the orchestration is testable without
/// a real transcoder.
pub fn inspect_and_repair<F>(path: &Path, threshold: u64, mut run: F) -> GuardVerdict
where
    F: FnMut(RepairStrategy, &Path, &Path) -> Result<(), String>,
{
    let size = match fs::metadata(path) {
        Ok(metadata) => metadata.len(),
        Err(_) => return GuardVerdict::MissingFile,
    };
    if size >= threshold {
        return GuardVerdict::Plausible;
    }

    let scratch = repair_scratch_path(path);
    let mut failures = Vec::new();
    for strategy in REPAIR_STRATEGIES {
        let _ = fs::remove_file(&scratch);
        match run(strategy, path, &scratch) {
            Ok(()) => {
                let produced = fs::metadata(&scratch).map(|m| m.len()).unwrap_or(0);
                if produced == 0 {
                    failures.push(format!("{strategy:?}: produced an empty file"));
                    continue;
                }
                if let Err(err) = fs::rename(&scratch, path) {
                    failures.push(format!("{strategy:?}: failed to replace original: {err}"));
                    continue;
                }
                return GuardVerdict::Repaired(strategy);
            }
            Err(err) => failures.push(format!("{strategy:?}: {err}")),
        }
    }
    let _ = fs::remove_file(&scratch);
    GuardVerdict::Failed(failures.join("; "))
}

/// Production wiring: runs the configured transcoder under each strategy's
/// hard timeout.
pub fn run_repair(
    path: &Path,
    threshold: u64,
    ffmpeg_program: &str,
    trace_id: &str,
) -> GuardVerdict {
    let verdict = inspect_and_repair(path, threshold, |strategy, input, output| {
        let args = strategy.args(input, output);
        let result = run_command_with_timeout(ffmpeg_program, &args, strategy.timeout(), trace_id)
            .map_err(|err| err.to_string())?;
        if result.succeeded() {
            Ok(())
        } else {
            Err(format!(
                "transcoder exited with {:?}: {}",
                result.exit_code,
                result.stderr.lines().last().unwrap_or_default().trim()
            ))
        }
    });
    match &verdict {
        GuardVerdict::Repaired(strategy) => {
            info!(trace_id = %trace_id, path = %path.display(), strategy = ?strategy, "repaired recording");
        }
        GuardVerdict::Failed(message) => {
            warn!(trace_id = %trace_id, path = %path.display(), error = %message, "recording repair failed");
        }
        _ => {}
    }
    verdict
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: u64 = 4096;

    #[test]
    fn missing_file_needs_no_repair() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("absent.mp4");
        let verdict = inspect_and_repair(&path, THRESHOLD, |_, _, _| {
            panic!("no strategy should run for a missing file")
        });
        assert_eq!(verdict, GuardVerdict::MissingFile);
    }

    #[test]
    fn large_file_is_left_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ok.mp4");
        fs::write(&path, vec![0u8; THRESHOLD as usize]).expect("write");
        let verdict = inspect_and_repair(&path, THRESHOLD, |_, _, _| {
            panic!("no strategy should run for a plausible file")
        });
        assert_eq!(verdict, GuardVerdict::Plausible);
    }

    #[test]
    fn first_successful_strategy_wins_and_replaces_the_original() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("broken.mp4");
        fs::write(&path, b"stub").expect("write");

        let mut attempts = Vec::new();
        let verdict = inspect_and_repair(&path, THRESHOLD, |strategy, _input, output| {
            attempts.push(strategy);
            fs::write(output, b"remuxed contents").map_err(|e| e.to_string())
        });
        assert_eq!(verdict, GuardVerdict::Repaired(RepairStrategy::Remux));
        assert_eq!(attempts, vec![RepairStrategy::Remux]);
        assert_eq!(fs::read(&path).expect("read"), b"remuxed contents");
    }

    #[test]
    fn falls_back_to_reencode_when_remux_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("broken.mp4");
        fs::write(&path, b"stub").expect("write");

        let mut attempts = Vec::new();
        let verdict = inspect_and_repair(&path, THRESHOLD, |strategy, _input, output| {
            attempts.push(strategy);
            match strategy {
                RepairStrategy::Remux => Err("moov atom not found".to_string()),
                RepairStrategy::Reencode => {
                    fs::write(output, b"reencoded contents").map_err(|e| e.to_string())
                }
            }
        });
        assert_eq!(verdict, GuardVerdict::Repaired(RepairStrategy::Reencode));
        assert_eq!(attempts, vec![RepairStrategy::Remux, RepairStrategy::Reencode]);
        assert_eq!(fs::read(&path).expect("read"), b"reencoded contents");
    }

    #[test]
    fn empty_strategy_output_counts_as_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("broken.mp4");
        fs::write(&path, b"stub").expect("write");

        let verdict = inspect_and_repair(&path, THRESHOLD, |_, _input, output| {
            fs::write(output, b"").map_err(|e| e.to_string())
        });
        match verdict {
            GuardVerdict::Failed(message) => assert!(message.contains("empty")),
            other => panic!("expected failure, got {other:?}"),
        }
        // Original untouched.
        assert_eq!(fs::read(&path).expect("read"), b"stub");
    }

    #[test]
    fn total_failure_preserves_the_original() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("broken.mp4");
        fs::write(&path, b"stub").expect("write");

        let verdict =
            inspect_and_repair(&path, THRESHOLD, |_, _, _| Err("boom".to_string()));
        match &verdict {
            GuardVerdict::Failed(message) => {
                assert!(message.contains("Remux"));
                assert!(message.contains("Reencode"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(verdict.failure_message().is_some());
        assert_eq!(fs::read(&path).expect("read"), b"stub");
        // No scratch file left behind.
        assert_eq!(fs::read_dir(dir.path()).expect("read_dir").count(), 1);
    }

    #[test]
    fn strategy_args_match_the_transcoder_contract() {
        let input = Path::new("/tmp/in.mp4");
        let output = Path::new("/tmp/out.mp4");
        let remux = RepairStrategy::Remux.args(input, output);
        assert_eq!(remux, vec!["-y", "-i", "/tmp/in.mp4", "-c", "copy", "/tmp/out.mp4"]);
        let reencode = RepairStrategy::Reencode.args(input, output);
        assert!(reencode.contains(&"libx264".to_string()));
        assert!(RepairStrategy::Remux.timeout() < RepairStrategy::Reencode.timeout());
    }
}

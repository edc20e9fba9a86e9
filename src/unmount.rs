/// Unmount invocation: run the configured command through the shell with the
/// mountpoint as its final argument, and report how it went.
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Result of one unmount attempt.
#[derive(Debug)]
pub struct UnmountOutcome {
    /// Exit code (None if killed by signal).
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

impl UnmountOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Errors that prevent the command from running at all.
#[derive(Debug)]
pub enum UnmountError {
    Spawn { source: std::io::Error },
}

impl std::fmt::Display for UnmountError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnmountError::Spawn { source } => {
                write!(f, "failed to spawn unmount command: {}", source)
            }
        }
    }
}

impl std::error::Error for UnmountError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            UnmountError::Spawn { source } => Some(source),
        }
    }
}

/// `sh -c '<command> "$1"' sh <mountpoint>`: the mountpoint travels as a
/// positional parameter so it is never re-parsed by the shell.
fn build_command(command: &str, mountpoint: &Path) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(format!("{command} \"$1\""))
        .arg("sh")
        .arg(mountpoint)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd
}

/// Run the unmount command to completion. No timeout: a hung command holds
/// the caller until it exits.
pub async fn run_unmount(command: &str, mountpoint: &Path) -> Result<UnmountOutcome, UnmountError> {
    tracing::info!(
        command = %command,
        mountpoint = %mountpoint.display(),
        "running unmount command"
    );

    let start = Instant::now();
    let output = build_command(command, mountpoint)
        .output()
        .await
        .map_err(|e| UnmountError::Spawn { source: e })?;
    let outcome = UnmountOutcome {
        exit_code: output.status.code(),
        duration: start.elapsed(),
    };

    if outcome.succeeded() {
        tracing::info!(
            duration_ms = outcome.duration.as_millis() as u64,
            "unmount command succeeded"
        );
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        tracing::warn!(
            exit_code = ?outcome.exit_code,
            stderr = %stderr.trim(),
            "unmount command failed"
        );
    }
    Ok(outcome)
}

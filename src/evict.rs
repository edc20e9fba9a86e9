//! Process eviction: find every process holding the mount and kill it.
//!
//! A sweep enumerates the process table once, builds a fresh [`ProcessRecord`]
//! per process and sends SIGKILL to each one that holds the mount. Processes
//! that cannot be inspected are skipped; nothing is retried.
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use procfs::process::{FDTarget, Process};
use procfs::ProcError;
use std::path::{Path, PathBuf};

/// Snapshot of one process, taken during a sweep and discarded after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: i32,
    pub cwd: PathBuf,
    pub open_paths: Vec<PathBuf>,
    /// Empty unless command-line matching is enabled.
    pub cmdline: Vec<String>,
}

/// Why a process was judged to hold the mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hold {
    WorkingDir,
    OpenFile,
    Cmdline,
}

/// Outcome of one sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EvictionReport {
    pub inspected: usize,
    pub skipped: usize,
    pub terminated: Vec<i32>,
    pub failed: Vec<i32>,
}

/// Source of process snapshots and the means to kill them.
pub trait ProcessTable {
    /// Enumerate every live process once. Per-process failures are returned
    /// in place so the caller can skip them.
    fn processes(
        &self,
        with_cmdline: bool,
    ) -> Result<Vec<Result<ProcessRecord, InspectError>>, InspectError>;

    fn terminate(&self, pid: i32) -> Result<(), TerminateError>;
}

/// `path` is the mountpoint itself or somewhere beneath it.
pub fn is_under(path: &Path, mountpoint: &Path) -> bool {
    path.starts_with(mountpoint)
}

/// Scan argument tokens for a path under the mountpoint, stopping at the
/// token that names this daemon so it never matches its own invocation.
fn cmdline_mentions(cmdline: &[String], mountpoint: &Path, self_name: &str) -> bool {
    for token in cmdline {
        let path = Path::new(token);
        if path.file_name().is_some_and(|name| name == self_name) {
            return false;
        }
        if is_under(path, mountpoint) {
            return true;
        }
    }
    false
}

/// Name this binary was invoked as, used to recognize our own command line.
fn own_name() -> String {
    std::env::args_os()
        .next()
        .and_then(|arg0| {
            Path::new(&arg0)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string())
}

/// Decides which processes hold the mount and runs sweeps.
#[derive(Debug, Clone)]
pub struct Evictor {
    mountpoint: PathBuf,
    match_cmdline: bool,
    self_pid: i32,
    self_name: String,
}

impl Evictor {
    pub fn new(mountpoint: impl Into<PathBuf>, match_cmdline: bool) -> Self {
        Self {
            mountpoint: mountpoint.into(),
            match_cmdline,
            self_pid: std::process::id() as i32,
            self_name: own_name(),
        }
    }

    #[cfg(test)]
    pub fn with_identity(mut self, self_pid: i32, self_name: &str) -> Self {
        self.self_pid = self_pid;
        self.self_name = self_name.to_string();
        self
    }

    /// Which check, if any, ties this process to the mount.
    pub fn holds_mount(&self, record: &ProcessRecord) -> Option<Hold> {
        if record.pid == self.self_pid {
            return None;
        }
        if is_under(&record.cwd, &self.mountpoint) {
            return Some(Hold::WorkingDir);
        }
        if record
            .open_paths
            .iter()
            .any(|p| is_under(p, &self.mountpoint))
        {
            return Some(Hold::OpenFile);
        }
        if self.match_cmdline && cmdline_mentions(&record.cmdline, &self.mountpoint, &self.self_name)
        {
            return Some(Hold::Cmdline);
        }
        None
    }

    /// One best-effort pass over the process table.
    pub fn sweep<T: ProcessTable>(&self, table: &T) -> EvictionReport {
        let mut report = EvictionReport::default();

        let processes = match table.processes(self.match_cmdline) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "failed to enumerate processes, skipping sweep");
                return report;
            }
        };

        for entry in processes {
            let record = match entry {
                Ok(record) => record,
                Err(e) => {
                    tracing::debug!(error = %e, "skipping process");
                    report.skipped += 1;
                    continue;
                }
            };
            report.inspected += 1;

            let Some(hold) = self.holds_mount(&record) else {
                continue;
            };
            tracing::info!(pid = record.pid, reason = ?hold, "killing process holding mount");
            match table.terminate(record.pid) {
                Ok(()) => report.terminated.push(record.pid),
                Err(TerminateError {
                    source: Errno::ESRCH,
                    ..
                }) => {
                    tracing::debug!(pid = record.pid, "process exited before kill");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to kill process");
                    report.failed.push(record.pid);
                }
            }
        }

        tracing::info!(
            mountpoint = %self.mountpoint.display(),
            inspected = report.inspected,
            skipped = report.skipped,
            terminated = report.terminated.len(),
            failed = report.failed.len(),
            "eviction sweep complete"
        );
        report
    }
}

/// The live `/proc` process table.
#[derive(Debug, Default)]
pub struct ProcFs;

impl ProcessTable for ProcFs {
    fn processes(
        &self,
        with_cmdline: bool,
    ) -> Result<Vec<Result<ProcessRecord, InspectError>>, InspectError> {
        let all = procfs::process::all_processes().map_err(|e| InspectError::from_proc(None, e))?;
        Ok(all
            .map(|entry| match entry {
                Ok(process) => inspect(&process, with_cmdline),
                Err(e) => Err(InspectError::from_proc(None, e)),
            })
            .collect())
    }

    fn terminate(&self, pid: i32) -> Result<(), TerminateError> {
        kill(Pid::from_raw(pid), Signal::SIGKILL).map_err(|e| TerminateError { pid, source: e })
    }
}

fn inspect(process: &Process, with_cmdline: bool) -> Result<ProcessRecord, InspectError> {
    let pid = process.pid;
    let err = |e: ProcError| InspectError::from_proc(Some(pid), e);

    let cwd = process.cwd().map_err(err)?;
    // Descriptors closing mid-scan are expected; only path targets matter.
    let open_paths = process
        .fd()
        .map_err(err)?
        .filter_map(|fd| match fd.ok()?.target {
            FDTarget::Path(path) => Some(path),
            _ => None,
        })
        .collect();
    let cmdline = if with_cmdline {
        process.cmdline().map_err(err)?
    } else {
        Vec::new()
    };

    Ok(ProcessRecord {
        pid,
        cwd,
        open_paths,
        cmdline,
    })
}

/// A process that could not be inspected.
#[derive(Debug)]
pub enum InspectError {
    AccessDenied { pid: Option<i32> },
    /// The process exited while it was being read.
    Vanished { pid: Option<i32> },
    Proc { pid: Option<i32>, source: ProcError },
}

impl InspectError {
    fn from_proc(pid: Option<i32>, source: ProcError) -> Self {
        match source {
            ProcError::PermissionDenied(_) => InspectError::AccessDenied { pid },
            ProcError::NotFound(_) => InspectError::Vanished { pid },
            source => InspectError::Proc { pid, source },
        }
    }
}

fn fmt_pid(pid: &Option<i32>) -> String {
    pid.map_or_else(|| "?".to_string(), |p| p.to_string())
}

impl std::fmt::Display for InspectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InspectError::AccessDenied { pid } => {
                write!(f, "access denied inspecting pid {}", fmt_pid(pid))
            }
            InspectError::Vanished { pid } => write!(f, "pid {} exited", fmt_pid(pid)),
            InspectError::Proc { pid, source } => {
                write!(f, "failed to inspect pid {}: {source}", fmt_pid(pid))
            }
        }
    }
}

impl std::error::Error for InspectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InspectError::Proc { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Sending the kill signal failed.
#[derive(Debug)]
pub struct TerminateError {
    pub pid: i32,
    pub source: Errno,
}

impl std::fmt::Display for TerminateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to kill pid {}: {}", self.pid, self.source)
    }
}

impl std::error::Error for TerminateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

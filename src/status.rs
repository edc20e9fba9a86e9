/// Status file: `<state_dir>/<slug>.status`, rewritten as JSON on every state
/// transition so `--status` can report what a running instance is doing. The
/// daemon itself never reads it back.
use crate::evict::EvictionReport;
use crate::orchestrator::DaemonState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// The JSON payload written to the status file.
#[derive(Debug, Clone, Serialize)]
pub struct StatusData {
    pub pid: u32,
    pub mountpoint: String,
    pub state: DaemonState,
    pub timeout_secs: u64,
    /// Completed evict/unmount/remount cycles.
    pub cycles: u64,
    pub last_activity: Option<DateTime<Utc>>,
    pub last_eviction: Option<DateTime<Utc>>,
    pub last_terminated: usize,
    pub last_unmount_exit: Option<i32>,
    pub last_update: DateTime<Utc>,
}

/// The on-disk status file for one mountpoint.
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Replace the file's contents in one step: readers see either the old or
    /// the new JSON, never a partial write.
    pub fn write(&self, data: &StatusData) -> Result<(), StatusError> {
        let json = serde_json::to_vec_pretty(data).map_err(StatusError::Encode)?;
        let staging = self
            .path
            .with_file_name(format!(".status.tmp.{}", std::process::id()));

        std::fs::write(&staging, json).map_err(|e| StatusError::io("write", &staging, e))?;
        std::fs::rename(&staging, &self.path).map_err(|e| {
            let _ = std::fs::remove_file(&staging);
            StatusError::io("replace", &self.path, e)
        })
    }

    /// Raw JSON last written by a running instance.
    pub fn read(&self) -> Result<String, StatusError> {
        std::fs::read_to_string(&self.path).map_err(|e| StatusError::io("read", &self.path, e))
    }

    pub fn remove(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Mutable state tracker that builds StatusData for each update. Without a
/// file it only keeps counters.
pub struct StatusTracker {
    file: Option<StatusFile>,
    pid: u32,
    mountpoint: String,
    timeout_secs: u64,
    cycles: u64,
    last_activity: Option<DateTime<Utc>>,
    last_eviction: Option<DateTime<Utc>>,
    last_terminated: usize,
    last_unmount_exit: Option<i32>,
}

impl StatusTracker {
    pub fn new(status_path: Option<PathBuf>, mountpoint: &Path, timeout_secs: u64) -> Self {
        Self {
            file: status_path.map(StatusFile::new),
            pid: std::process::id(),
            mountpoint: mountpoint.display().to_string(),
            timeout_secs,
            cycles: 0,
            last_activity: None,
            last_eviction: None,
            last_terminated: 0,
            last_unmount_exit: None,
        }
    }

    /// Write the status file with the given state, if one is configured.
    pub fn update(&self, state: DaemonState) {
        let Some(file) = &self.file else {
            return;
        };
        let data = StatusData {
            pid: self.pid,
            mountpoint: self.mountpoint.clone(),
            state,
            timeout_secs: self.timeout_secs,
            cycles: self.cycles,
            last_activity: self.last_activity,
            last_eviction: self.last_eviction,
            last_terminated: self.last_terminated,
            last_unmount_exit: self.last_unmount_exit,
            last_update: Utc::now(),
        };

        if let Err(e) = file.write(&data) {
            tracing::warn!(error = %e, "failed to write status file");
        }
    }

    /// Note activity on the mount; written out with the next transition.
    pub fn record_activity(&mut self) {
        self.last_activity = Some(Utc::now());
    }

    pub fn record_eviction(&mut self, report: &EvictionReport) {
        self.last_eviction = Some(Utc::now());
        self.last_terminated = report.terminated.len();
    }

    pub fn record_unmount(&mut self, exit_code: Option<i32>) {
        self.last_unmount_exit = exit_code;
    }

    pub fn complete_cycle(&mut self) {
        self.cycles += 1;
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn remove(&self) {
        if let Some(file) = &self.file {
            file.remove();
        }
    }
}

#[derive(Debug)]
pub enum StatusError {
    Encode(serde_json::Error),
    Io {
        op: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
}

impl StatusError {
    fn io(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        StatusError::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::Encode(e) => write!(f, "cannot encode status: {e}"),
            StatusError::Io { op, path, source } => {
                write!(f, "cannot {op} status file {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Encode(e) => Some(e),
            StatusError::Io { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample(state: DaemonState) -> StatusData {
        StatusData {
            pid: 12345,
            mountpoint: "/mnt/data".to_string(),
            state,
            timeout_secs: 300,
            cycles: 3,
            last_activity: None,
            last_eviction: Some(Utc::now()),
            last_terminated: 2,
            last_unmount_exit: Some(0),
            last_update: Utc::now(),
        }
    }

    #[test]
    fn test_write_replaces_whole_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mnt-data.status");
        let file = StatusFile::new(path.clone());

        file.write(&sample(DaemonState::Evicting)).unwrap();
        file.write(&sample(DaemonState::WaitingRemount)).unwrap();

        let parsed: serde_json::Value = serde_json::from_str(&file.read().unwrap()).unwrap();
        assert_eq!(parsed["mountpoint"], "/mnt/data");
        assert_eq!(parsed["state"], "waiting_remount");
        assert_eq!(parsed["timeout_secs"], 300);
        assert_eq!(parsed["last_unmount_exit"], 0);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("mnt-data.status")]);
    }

    #[test]
    fn test_states_serialize_snake_case() {
        let states = [
            (DaemonState::WaitingInitialMount, "waiting_initial_mount"),
            (DaemonState::Watching, "watching"),
            (DaemonState::Evicting, "evicting"),
            (DaemonState::Unmounting, "unmounting"),
            (DaemonState::WaitingRemount, "waiting_remount"),
        ];

        for (state, name) in states {
            assert_eq!(serde_json::to_value(state).unwrap(), name);
        }
    }

    #[test]
    fn test_status_tracker_lifecycle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mnt-data.status");
        let mut tracker = StatusTracker::new(Some(path.clone()), Path::new("/mnt/data"), 5);

        tracker.update(DaemonState::WaitingInitialMount);
        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["state"], "waiting_initial_mount");
        assert_eq!(parsed["cycles"], 0);
        assert!(parsed["last_eviction"].is_null());
        assert!(parsed["last_activity"].is_null());

        tracker.record_activity();
        tracker.record_eviction(&EvictionReport {
            terminated: vec![10, 11],
            ..Default::default()
        });
        tracker.update(DaemonState::Unmounting);
        tracker.record_unmount(Some(32));
        tracker.complete_cycle();
        tracker.update(DaemonState::Watching);

        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["state"], "watching");
        assert_eq!(parsed["cycles"], 1);
        assert_eq!(parsed["last_terminated"], 2);
        assert_eq!(parsed["last_unmount_exit"], 32);
        assert!(parsed["last_eviction"].is_string());
        assert!(parsed["last_activity"].is_string());

        tracker.remove();
        assert!(!path.exists());
    }

    #[test]
    fn test_tracker_without_file_only_counts() {
        let mut tracker = StatusTracker::new(None, Path::new("/mnt/data"), 5);
        tracker.update(DaemonState::Watching);
        tracker.complete_cycle();
        assert_eq!(tracker.cycles(), 1);
        tracker.remove();
    }

    #[test]
    fn test_missing_dir_reports_operation() {
        let file = StatusFile::new(PathBuf::from("/nonexistent/dir/x.status"));

        let err = file.write(&sample(DaemonState::Watching)).unwrap_err();
        assert!(matches!(err, StatusError::Io { op: "write", .. }));

        let err = file.read().unwrap_err();
        assert!(err.to_string().starts_with("cannot read status file /nonexistent/dir/x.status"));
    }
}

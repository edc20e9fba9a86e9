use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Seek, Write};
use std::path::{Path, PathBuf};

/// Per-mountpoint files under the configured state directory.
///
/// Several daemons may share one state directory, so every file name is keyed
/// by a slug of the mountpoint (`/mnt/data` → `mnt-data`).
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
    slug: String,
}

impl StateDir {
    pub fn new(root: impl Into<PathBuf>, mountpoint: &Path) -> Self {
        Self {
            root: root.into(),
            slug: slug(mountpoint),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the status file.
    pub fn status(&self) -> PathBuf {
        self.root.join(format!("{}.status", self.slug))
    }

    /// Path to the singleton lock file.
    pub fn lock(&self) -> PathBuf {
        self.root.join(format!("{}.lock", self.slug))
    }

    /// Create the directory if needed.
    pub fn init(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)
    }

    /// Take the exclusive per-mountpoint lock. Held until the returned guard drops.
    pub fn acquire_lock(&self) -> Result<InstanceLock, LockError> {
        let path = self.lock();
        let io_err = |e: std::io::Error| LockError::Io {
            path: path.clone(),
            source: e,
        };
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_err)?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == fs2::lock_contended_error().kind() {
                return Err(LockError::Held { path: path.clone() });
            }
            return Err(io_err(e));
        }

        let mut lock = InstanceLock { file };
        lock.record_pid().map_err(io_err)?;
        Ok(lock)
    }
}

/// Lock guard; the advisory lock is released when the file closes. The file
/// holds the pid of the process owning it.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
}

impl InstanceLock {
    /// Replace the recorded pid with the current one. The lock survives a
    /// fork, so the detached child calls this to claim it.
    pub fn record_pid(&mut self) -> std::io::Result<()> {
        self.file.set_len(0)?;
        self.file.rewind()?;
        writeln!(self.file, "{}", std::process::id())
    }
}

/// File-name form of a mountpoint: `/` separators become `-`, and a literal
/// `-` or `\` is written as `\x2d` or `\x5c`. Distinct mountpoints never
/// share a slug (`/mnt/a-b` is `mnt-a\x2db`, `/mnt/a/b` is `mnt-a-b`).
fn slug(mountpoint: &Path) -> String {
    let path = mountpoint.to_string_lossy();
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return "-".to_string();
    }
    let mut out = String::with_capacity(trimmed.len());
    for c in trimmed.chars() {
        match c {
            '/' => out.push('-'),
            '-' | '\\' => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

/// Errors from taking the instance lock.
#[derive(Debug)]
pub enum LockError {
    Held {
        path: PathBuf,
    },
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::Held { path } => write!(
                f,
                "another instance is watching this mountpoint (lock {} held)",
                path.display()
            ),
            LockError::Io { path, source } => {
                write!(f, "failed to lock {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LockError::Held { .. } => None,
            LockError::Io { source, .. } => Some(source),
        }
    }
}

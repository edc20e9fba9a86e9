//! Mount-table scanning and the remount wait.
//!
//! The table is the kernel's textual list of mounted filesystems: one mount per
//! line, whitespace-separated, mount path in the second column with whitespace
//! and backslashes written as three-digit octal escapes (`\040` for a space).
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use regex::{Captures, Regex};
use std::borrow::Cow;
use std::fs::File;
use std::io::{Read, Seek};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

/// Column holding the mount path.
const MOUNT_PATH_FIELD: usize = 1;

static OCTAL_ESCAPE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\\([0-7]{3})").unwrap());

/// Decode the kernel's octal escapes in a mount-table field.
fn unescape(field: &str) -> Cow<'_, str> {
    OCTAL_ESCAPE.replace_all(field, |caps: &Captures| {
        match u8::from_str_radix(&caps[1], 8) {
            Ok(byte) => char::from(byte).to_string(),
            Err(_) => caps[0].to_string(),
        }
    })
}

/// Iterate the mount paths listed in a mount-table text.
pub fn mount_paths(table: &str) -> impl Iterator<Item = PathBuf> + '_ {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(MOUNT_PATH_FIELD))
        .map(|field| PathBuf::from(unescape(field).as_ref()))
}

/// True if some line's mount path equals `mountpoint`.
pub fn is_listed(table: &str, mountpoint: &Path) -> bool {
    mount_paths(table).any(|p| p == mountpoint)
}

/// A mount-table source and how long to sleep between rescans when the
/// source cannot signal changes.
#[derive(Debug, Clone)]
pub struct MountTable {
    path: PathBuf,
    rescan_interval: Duration,
}

impl MountTable {
    pub fn new(path: impl Into<PathBuf>, rescan_interval: Duration) -> Self {
        Self {
            path: path.into(),
            rescan_interval,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the table once and report whether `mountpoint` is listed.
    pub fn contains(&self, mountpoint: &Path) -> Result<bool, MountTableError> {
        let contents = std::fs::read_to_string(&self.path).map_err(|e| MountTableError::Read {
            path: self.path.clone(),
            source: e,
        })?;
        Ok(is_listed(&contents, mountpoint))
    }

    /// Block the calling thread until `mountpoint` is listed (`listed == true`)
    /// or absent (`listed == false`).
    ///
    /// Read errors are logged and retried after the rescan interval; this
    /// only returns once the wanted state is seen.
    pub fn block_until(&self, mountpoint: &Path, listed: bool) {
        loop {
            match self.scan_until(mountpoint, listed) {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        table = %self.path.display(),
                        "mount table unavailable, retrying"
                    );
                    std::thread::sleep(self.rescan_interval);
                }
            }
        }
    }

    /// Wait on the blocking pool until `mountpoint` is listed.
    pub async fn wait_until_listed(&self, mountpoint: &Path) {
        self.wait_until(mountpoint, true).await
    }

    /// Wait on the blocking pool until `mountpoint` is no longer listed.
    pub async fn wait_until_unlisted(&self, mountpoint: &Path) {
        self.wait_until(mountpoint, false).await
    }

    async fn wait_until(&self, mountpoint: &Path, listed: bool) {
        let table = self.clone();
        let mountpoint = mountpoint.to_path_buf();
        if let Err(e) =
            tokio::task::spawn_blocking(move || table.block_until(&mountpoint, listed)).await
        {
            tracing::error!(error = %e, "mount table wait task failed");
        }
    }

    /// Keep one handle open so the kernel can flag changes on it, and rescan the
    /// whole table from the start after every wake.
    fn scan_until(&self, mountpoint: &Path, listed: bool) -> Result<(), MountTableError> {
        let read_err = |e: std::io::Error| MountTableError::Read {
            path: self.path.clone(),
            source: e,
        };
        let mut file = File::open(&self.path).map_err(read_err)?;
        let mut contents = String::new();
        loop {
            contents.clear();
            file.rewind().map_err(read_err)?;
            file.read_to_string(&mut contents).map_err(read_err)?;
            if is_listed(&contents, mountpoint) == listed {
                return Ok(());
            }
            tracing::debug!(
                mountpoint = %mountpoint.display(),
                want_listed = listed,
                "waiting for mount table change"
            );
            self.wait_for_change(&file)?;
        }
    }

    fn wait_for_change(&self, file: &File) -> Result<(), MountTableError> {
        // POLLPRI only: the mount table always polls readable, the kernel
        // raises PRI when the set of mounts changes.
        let mut fds = [PollFd::new(file.as_fd(), PollFlags::POLLPRI)];
        let millis = i32::try_from(self.rescan_interval.as_millis()).unwrap_or(i32::MAX);
        let timeout = PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX);
        match poll(&mut fds, timeout) {
            Ok(_) | Err(Errno::EINTR) => Ok(()),
            Err(e) => Err(MountTableError::Poll {
                path: self.path.clone(),
                source: e,
            }),
        }
    }
}

/// Errors from reading or waiting on the mount table.
#[derive(Debug)]
pub enum MountTableError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Poll {
        path: PathBuf,
        source: Errno,
    },
}

impl std::fmt::Display for MountTableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MountTableError::Read { path, source } => {
                write!(f, "failed to read mount table {}: {source}", path.display())
            }
            MountTableError::Poll { path, source } => {
                write!(f, "failed to poll mount table {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for MountTableError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MountTableError::Read { source, .. } => Some(source),
            MountTableError::Poll { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::tempdir;

    const TABLE: &str = "\
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0
/dev/sda1 / ext4 rw,relatime 0 0
/dev/sdb1 /mnt/data ext4 rw,relatime 0 0
//nas/share /mnt/my\\040share cifs rw 0 0
";

    #[test]
    fn test_mount_paths_second_column() {
        let paths: Vec<PathBuf> = mount_paths(TABLE).collect();
        assert_eq!(paths.len(), 5);
        assert_eq!(paths[0], PathBuf::from("/sys"));
        assert_eq!(paths[3], PathBuf::from("/mnt/data"));
    }

    #[test]
    fn test_octal_escape_decoded() {
        assert!(is_listed(TABLE, Path::new("/mnt/my share")));
        assert_eq!(unescape(r"a\011b\134c"), "a\tb\\c");
    }

    #[test]
    fn test_is_listed_exact_match_only() {
        assert!(is_listed(TABLE, Path::new("/mnt/data")));
        assert!(!is_listed(TABLE, Path::new("/mnt")));
        assert!(!is_listed(TABLE, Path::new("/mnt/data/sub")));
        assert!(!is_listed(TABLE, Path::new("/mnt/dat")));
    }

    #[test]
    fn test_device_column_not_matched() {
        assert!(!is_listed(TABLE, Path::new("/dev/sdb1")));
    }

    #[test]
    fn test_blank_and_short_lines_ignored() {
        let table = "\n   \nonlyone\n/dev/x /mnt/x ext4 rw 0 0\n";
        assert!(is_listed(table, Path::new("/mnt/x")));
        assert_eq!(mount_paths(table).count(), 1);
    }

    #[test]
    fn test_contains_reads_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mounts");
        std::fs::write(&path, TABLE).unwrap();
        let table = MountTable::new(&path, Duration::from_secs(1));
        assert!(table.contains(Path::new("/mnt/data")).unwrap());
        assert!(!table.contains(Path::new("/mnt/other")).unwrap());
    }

    #[test]
    fn test_contains_missing_table() {
        let table = MountTable::new("/nonexistent/mounts", Duration::from_secs(1));
        let err = table.contains(Path::new("/mnt/data")).unwrap_err();
        assert!(matches!(err, MountTableError::Read { .. }));
        assert!(err.to_string().contains("/nonexistent/mounts"));
    }

    #[test]
    fn test_block_returns_immediately_when_listed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mounts");
        std::fs::write(&path, TABLE).unwrap();
        let table = MountTable::new(&path, Duration::from_secs(30));

        let start = Instant::now();
        table.block_until(Path::new("/mnt/data"), true);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_block_waits_for_remount() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mounts");
        std::fs::write(&path, "/dev/sda1 / ext4 rw 0 0\n").unwrap();
        let table = MountTable::new(&path, Duration::from_millis(20));

        let writer_path = path.clone();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            std::fs::write(
                &writer_path,
                "/dev/sda1 / ext4 rw 0 0\n/dev/sdb1 /mnt/data ext4 rw 0 0\n",
            )
            .unwrap();
        });

        let start = Instant::now();
        table.block_until(Path::new("/mnt/data"), true);
        assert!(start.elapsed() >= Duration::from_millis(150));
        writer.join().unwrap();
    }

    #[test]
    fn test_block_survives_table_appearing_later() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mounts");
        let table = MountTable::new(&path, Duration::from_millis(20));

        let writer_path = path.clone();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            std::fs::write(&writer_path, "/dev/sdb1 /mnt/data ext4 rw 0 0\n").unwrap();
        });

        table.block_until(Path::new("/mnt/data"), true);
        writer.join().unwrap();
    }

    #[test]
    fn test_block_until_unlisted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mounts");
        std::fs::write(&path, TABLE).unwrap();
        let table = MountTable::new(&path, Duration::from_millis(20));

        // Already absent: returns at once.
        table.block_until(Path::new("/mnt/other"), false);

        let writer_path = path.clone();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            std::fs::write(&writer_path, "/dev/sda1 / ext4 rw 0 0\n").unwrap();
        });
        table.block_until(Path::new("/mnt/data"), false);
        assert!(!table.contains(Path::new("/mnt/data")).unwrap());
        writer.join().unwrap();
    }

    #[tokio::test]
    async fn test_wait_until_listed_async() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mounts");
        std::fs::write(&path, "").unwrap();
        let table = MountTable::new(&path, Duration::from_millis(20));

        let writer_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            std::fs::write(&writer_path, "/dev/sdb1 /mnt/data ext4 rw 0 0\n").unwrap();
        });

        tokio::time::timeout(
            Duration::from_secs(5),
            table.wait_until_listed(Path::new("/mnt/data")),
        )
        .await
        .expect("remount not observed");
    }

    #[test]
    #[ignore = "needs /proc/self/mounts"]
    fn test_proc_mounts_lists_root() {
        let table = MountTable::new("/proc/self/mounts", Duration::from_secs(1));
        assert!(table.contains(Path::new("/")).unwrap());
    }
}

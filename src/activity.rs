//! Activity detection: which filesystem notifications count as use of the mount.
use nix::errno::Errno;
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, InotifyEvent, WatchDescriptor};
use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

/// Pending signals between the reader task and the orchestrator.
/// A full channel already guarantees a timer reset, so overflow is dropped.
const SIGNAL_CHANNEL_CAPACITY: usize = 64;

/// Kernel events requested on every watched directory. Creation and
/// move-in are only there to extend the watch to new subdirectories;
/// [`is_activity`] rejects them.
fn watch_mask() -> AddWatchFlags {
    AddWatchFlags::IN_ACCESS
        | AddWatchFlags::IN_MODIFY
        | AddWatchFlags::IN_ATTRIB
        | AddWatchFlags::IN_CLOSE_WRITE
        | AddWatchFlags::IN_CLOSE_NOWRITE
        | AddWatchFlags::IN_DELETE
        | AddWatchFlags::IN_MOVED_FROM
        | AddWatchFlags::IN_CREATE
        | AddWatchFlags::IN_MOVED_TO
        | AddWatchFlags::IN_ONLYDIR
        | AddWatchFlags::IN_DONT_FOLLOW
}

/// What the monitor forwards to the orchestrator.
#[derive(Debug)]
pub enum WatchSignal {
    /// A qualifying event on this path.
    Activity(PathBuf),
    /// The backend reported a problem with the subscription.
    Error(std::io::Error),
}

/// Decide whether a notification indicates the filesystem is in use.
///
/// File reads, writes, attribute changes, deletions and moves out of a
/// directory count. Creation, moves into a directory, bare opens and
/// directory listings do not, so background chatter cannot keep the mount
/// alive forever.
pub fn is_activity(mask: AddWatchFlags) -> bool {
    let read = AddWatchFlags::IN_ACCESS | AddWatchFlags::IN_CLOSE_NOWRITE;
    if mask.intersects(read) {
        return !mask.contains(AddWatchFlags::IN_ISDIR);
    }
    mask.intersects(
        AddWatchFlags::IN_MODIFY
            | AddWatchFlags::IN_CLOSE_WRITE
            | AddWatchFlags::IN_ATTRIB
            | AddWatchFlags::IN_DELETE
            | AddWatchFlags::IN_MOVED_FROM,
    )
}

/// A live recursive subscription. Dropping it tears down the watch.
pub struct Subscription {
    events: mpsc::Receiver<WatchSignal>,
    reader: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Wait for the next signal. `None` once the backend has gone away.
    pub async fn recv(&mut self) -> Option<WatchSignal> {
        self.events.recv().await
    }

    /// Subscription fed by a test harness instead of a backend.
    #[cfg(test)]
    pub fn from_channel(events: mpsc::Receiver<WatchSignal>) -> Self {
        Self {
            events,
            reader: None,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(reader) = &self.reader {
            reader.abort();
        }
    }
}

/// Source of activity subscriptions for a mount tree.
pub trait ActivityMonitor {
    fn subscribe(&mut self, root: &Path) -> Result<Subscription, WatchError>;
}

/// Recursive inotify-backed monitor. Must subscribe from inside the runtime.
#[derive(Debug, Default)]
pub struct InotifyMonitor;

impl ActivityMonitor for InotifyMonitor {
    fn subscribe(&mut self, root: &Path) -> Result<Subscription, WatchError> {
        let tree = WatchedTree::open(root)?;
        tracing::debug!(
            root = %root.display(),
            directories = tree.dirs.len(),
            "recursive watch installed"
        );

        let (tx, rx) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);
        let reader = tokio::spawn(forward_events(tree, tx));
        Ok(Subscription {
            events: rx,
            reader: Some(reader),
        })
    }
}

/// Read kernel events until the root goes away or the subscriber hangs up.
async fn forward_events(mut tree: WatchedTree, tx: mpsc::Sender<WatchSignal>) {
    loop {
        let events = match tree.next_batch().await {
            Ok(events) => events,
            Err(e) => {
                let _ = tx.try_send(WatchSignal::Error(e));
                return;
            }
        };
        for event in events {
            match tree.handle(event) {
                Handled::Signal(signal) => {
                    if let Err(TrySendError::Closed(_)) = tx.try_send(signal) {
                        return;
                    }
                }
                Handled::Ignored => {}
                Handled::RootGone => {
                    tracing::debug!(root = %tree.root.display(), "watched root went away");
                    return;
                }
            }
        }
    }
}

/// Owns the inotify descriptor for tokio's readiness tracking.
struct InotifyFd(Inotify);

impl AsRawFd for InotifyFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_fd().as_raw_fd()
    }
}

enum Handled {
    Signal(WatchSignal),
    Ignored,
    RootGone,
}

/// One inotify instance with a watch on every directory under `root`.
struct WatchedTree {
    fd: AsyncFd<InotifyFd>,
    root: PathBuf,
    root_wd: WatchDescriptor,
    dirs: HashMap<WatchDescriptor, PathBuf>,
}

impl WatchedTree {
    fn open(root: &Path) -> Result<Self, WatchError> {
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)
            .map_err(|e| WatchError::Init { source: e.into() })?;
        let root_wd = inotify
            .add_watch(root, watch_mask())
            .map_err(|e| WatchError::Subscribe {
                path: root.to_path_buf(),
                source: e,
            })?;
        let fd = AsyncFd::new(InotifyFd(inotify)).map_err(|e| WatchError::Init { source: e })?;

        let mut tree = Self {
            fd,
            root: root.to_path_buf(),
            root_wd,
            dirs: HashMap::from([(root_wd, root.to_path_buf())]),
        };
        tree.watch_children(root);
        Ok(tree)
    }

    /// Add watches for every directory below `top`. Directories that vanish
    /// or cannot be read are left unwatched.
    fn watch_children(&mut self, top: &Path) {
        let mut pending = vec![top.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::debug!(dir = %dir.display(), error = %e, "cannot list directory");
                    continue;
                }
            };
            for entry in entries.flatten() {
                if !entry.file_type().is_ok_and(|t| t.is_dir()) {
                    continue;
                }
                let path = entry.path();
                match self.watch_dir(&path) {
                    Ok(()) => pending.push(path),
                    Err(e) => {
                        tracing::debug!(dir = %path.display(), error = %e, "cannot watch directory")
                    }
                }
            }
        }
    }

    fn watch_dir(&mut self, dir: &Path) -> Result<(), Errno> {
        let wd = self.fd.get_ref().0.add_watch(dir, watch_mask())?;
        self.dirs.insert(wd, dir.to_path_buf());
        Ok(())
    }

    async fn next_batch(&self) -> std::io::Result<Vec<InotifyEvent>> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|fd| fd.get_ref().0.read_events().map_err(std::io::Error::from)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    fn handle(&mut self, event: InotifyEvent) -> Handled {
        if event.mask.contains(AddWatchFlags::IN_Q_OVERFLOW) {
            return Handled::Signal(WatchSignal::Error(std::io::Error::other(
                "inotify queue overflowed, events were lost",
            )));
        }
        if event.mask.contains(AddWatchFlags::IN_IGNORED) {
            self.dirs.remove(&event.wd);
            return if event.wd == self.root_wd {
                Handled::RootGone
            } else {
                Handled::Ignored
            };
        }
        let Some(dir) = self.dirs.get(&event.wd) else {
            return Handled::Ignored;
        };
        let path = match &event.name {
            Some(name) => dir.join(name),
            None => dir.clone(),
        };

        let new_dir = event.mask.contains(AddWatchFlags::IN_ISDIR)
            && event
                .mask
                .intersects(AddWatchFlags::IN_CREATE | AddWatchFlags::IN_MOVED_TO);
        if new_dir {
            match self.watch_dir(&path) {
                Ok(()) => self.watch_children(&path),
                Err(e) => tracing::debug!(dir = %path.display(), error = %e, "cannot watch directory"),
            }
        }

        if is_activity(event.mask) {
            Handled::Signal(WatchSignal::Activity(path))
        } else {
            Handled::Ignored
        }
    }
}

/// Errors from installing a subscription.
#[derive(Debug)]
pub enum WatchError {
    /// The notification backend could not be created.
    Init { source: std::io::Error },
    /// The tree could not be watched (typically it vanished).
    Subscribe { path: PathBuf, source: Errno },
}

impl std::fmt::Display for WatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchError::Init { source } => {
                write!(f, "failed to create filesystem watcher: {source}")
            }
            WatchError::Subscribe { path, source } => {
                write!(f, "failed to watch {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for WatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WatchError::Init { source } => Some(source),
            WatchError::Subscribe { source, .. } => Some(source),
        }
    }
}

//! The idle-unmount state machine.
//!
//! ```text
//! WaitingInitialMount ──► Watching ──expiry──► Evicting ──► Unmounting ──► WaitingRemount
//!          ▲                 │  ▲                                              │
//!          └──watch failed───┘  └──────────────────mount is back───────────────┘
//! ```
//!
//! The watch subscription and the inactivity timer are locals of the Watching
//! step, so neither exists in any other state and a second eviction cannot
//! start while one is under way.
use crate::activity::{ActivityMonitor, WatchSignal};
use crate::config::Settings;
use crate::evict::{Evictor, ProcessTable};
use crate::mounts::MountTable;
use crate::status::StatusTracker;
use crate::timer::InactivityTimer;
use crate::unmount::run_unmount;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Pause before waiting for the mount again after a watch could not be installed.
const SUBSCRIBE_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonState {
    WaitingInitialMount,
    Watching,
    Evicting,
    Unmounting,
    WaitingRemount,
}

pub struct Orchestrator<M, P> {
    mountpoint: PathBuf,
    timeout: Duration,
    unmount_command: String,
    mount_table: MountTable,
    evictor: Evictor,
    monitor: M,
    processes: P,
    status: StatusTracker,
    state: DaemonState,
    last_unmount_ok: bool,
}

impl<M: ActivityMonitor, P: ProcessTable> Orchestrator<M, P> {
    pub fn new(settings: &Settings, monitor: M, processes: P, status: StatusTracker) -> Self {
        Self {
            mountpoint: settings.mountpoint.clone(),
            timeout: settings.timeout,
            unmount_command: settings.unmount_command.clone(),
            mount_table: MountTable::new(&settings.mount_table, settings.rescan_interval),
            evictor: Evictor::new(&settings.mountpoint, settings.match_cmdline),
            monitor,
            processes,
            status,
            state: DaemonState::WaitingInitialMount,
            last_unmount_ok: false,
        }
    }

    #[cfg(test)]
    fn with_evictor(mut self, evictor: Evictor) -> Self {
        self.evictor = evictor;
        self
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    pub fn status(&self) -> &StatusTracker {
        &self.status
    }

    /// Drive the state machine forever.
    pub async fn run(&mut self) {
        tracing::info!(
            mountpoint = %self.mountpoint.display(),
            timeout_secs = self.timeout.as_secs(),
            "idle-unmount loop starting"
        );
        self.status.update(self.state);
        loop {
            self.step().await;
        }
    }

    /// Perform the work of the current state and move to the next one.
    pub async fn step(&mut self) -> DaemonState {
        let next = match self.state {
            DaemonState::WaitingInitialMount => self.await_initial_mount().await,
            DaemonState::Watching => self.watch().await,
            DaemonState::Evicting => self.evict(),
            DaemonState::Unmounting => self.unmount().await,
            DaemonState::WaitingRemount => self.await_remount().await,
        };
        tracing::debug!(from = ?self.state, to = ?next, "state transition");
        self.state = next;
        self.status.update(next);
        next
    }

    async fn await_initial_mount(&mut self) -> DaemonState {
        match self.mount_table.contains(&self.mountpoint) {
            Ok(true) => {
                tracing::info!(mountpoint = %self.mountpoint.display(), "already mounted");
            }
            Ok(false) => {
                tracing::info!(mountpoint = %self.mountpoint.display(), "not mounted, waiting");
                self.mount_table.wait_until_listed(&self.mountpoint).await;
            }
            Err(e) => {
                tracing::warn!(
                    table = %self.mount_table.path().display(),
                    error = %e,
                    "cannot read mount table, waiting"
                );
                self.mount_table.wait_until_listed(&self.mountpoint).await;
            }
        }
        DaemonState::Watching
    }

    /// Install a fresh subscription and timer, then dispatch activity until
    /// the timer expires.
    async fn watch(&mut self) -> DaemonState {
        let mut subscription = match self.monitor.subscribe(&self.mountpoint) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to install watch, waiting for mount again");
                tokio::time::sleep(SUBSCRIBE_RETRY_DELAY).await;
                return DaemonState::WaitingInitialMount;
            }
        };
        let mut timer = InactivityTimer::arm(self.timeout);
        tracing::info!(
            mountpoint = %self.mountpoint.display(),
            timeout_secs = timer.timeout().as_secs(),
            "watching for activity"
        );

        let mut stream_open = true;
        loop {
            // Activity already queued when the deadline passes still counts.
            tokio::select! {
                biased;

                signal = subscription.recv(), if stream_open => match signal {
                    Some(WatchSignal::Activity(path)) => {
                        timer.reset();
                        self.status.record_activity();
                        tracing::trace!(
                            path = %path.display(),
                            deadline = ?timer.deadline(),
                            "activity, timer reset"
                        );
                    }
                    Some(WatchSignal::Error(e)) => {
                        tracing::warn!(error = %e, "watch backend error");
                    }
                    None => {
                        tracing::warn!("watch stream closed, relying on inactivity timeout");
                        stream_open = false;
                    }
                },
                () = timer.expired() => {
                    tracing::info!(
                        idle_secs = timer.timeout().as_secs(),
                        "mount idle, evicting"
                    );
                    return DaemonState::Evicting;
                }
            }
        }
    }

    fn evict(&mut self) -> DaemonState {
        let report = self.evictor.sweep(&self.processes);
        self.status.record_eviction(&report);
        DaemonState::Unmounting
    }

    async fn unmount(&mut self) -> DaemonState {
        match run_unmount(&self.unmount_command, &self.mountpoint).await {
            Ok(outcome) => {
                self.last_unmount_ok = outcome.succeeded();
                self.status.record_unmount(outcome.exit_code);
            }
            Err(e) => {
                tracing::warn!(error = %e, "unmount command did not run");
                self.last_unmount_ok = false;
                self.status.record_unmount(None);
            }
        }
        DaemonState::WaitingRemount
    }

    /// After a failed unmount the filesystem may still be listed; wait for it
    /// to go away first so only a real remount resumes watching.
    async fn await_remount(&mut self) -> DaemonState {
        if !self.last_unmount_ok {
            tracing::warn!(
                mountpoint = %self.mountpoint.display(),
                "unmount failed, waiting for the mount to be released elsewhere"
            );
            self.mount_table.wait_until_unlisted(&self.mountpoint).await;
        }
        tracing::info!(mountpoint = %self.mountpoint.display(), "waiting for remount");
        self.mount_table.wait_until_listed(&self.mountpoint).await;
        self.status.complete_cycle();
        tracing::info!(cycles = self.status.cycles(), "mount is back");
        DaemonState::Watching
    }
}

/// Signal handling for shutdown.
///
/// SIGINT and SIGTERM end the daemon from whatever state it is in. The process
/// then exits with the conventional `128 + signal number` status.
use nix::sys::signal::Signal;
use tokio::signal::unix::{signal, SignalKind};

pub struct SignalHandler {
    sigint: tokio::signal::unix::Signal,
    sigterm: tokio::signal::unix::Signal,
}

impl SignalHandler {
    /// Register for SIGINT and SIGTERM. Must be called inside the runtime.
    pub fn install() -> std::io::Result<SignalHandler> {
        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for the next shutdown signal.
    pub async fn recv(&mut self) -> Signal {
        tokio::select! {
            _ = self.sigint.recv() => Signal::SIGINT,
            _ = self.sigterm.recv() => Signal::SIGTERM,
        }
    }
}

/// Exit status for a process ending because of `signal`.
pub fn exit_status(signal: Signal) -> u8 {
    128u8.saturating_add(signal as i32 as u8)
}

/// Inactivity countdown: a single restartable deadline.
///
/// Only one deadline exists per timer; `reset` moves it rather than adding a
/// second one. Expiry is observed by awaiting [`InactivityTimer::expired`] at
/// the caller's dispatch point, never delivered asynchronously.
use std::pin::Pin;
use std::time::Duration;
use tokio::time::{Instant, Sleep};

pub struct InactivityTimer {
    timeout: Duration,
    sleep: Pin<Box<Sleep>>,
}

impl InactivityTimer {
    /// Arm a fresh countdown of `timeout`.
    pub fn arm(timeout: Duration) -> Self {
        Self {
            timeout,
            sleep: Box::pin(tokio::time::sleep(timeout)),
        }
    }

    /// Cancel the pending expiry and restart the full countdown from now.
    pub fn reset(&mut self) {
        let deadline = Instant::now() + self.timeout;
        self.sleep.as_mut().reset(deadline);
    }

    /// Resolves once the deadline passes without a reset.
    pub async fn expired(&mut self) {
        self.sleep.as_mut().await
    }

    pub fn deadline(&self) -> Instant {
        self.sleep.deadline()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

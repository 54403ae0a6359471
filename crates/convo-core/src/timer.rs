// Single-shot debounce timer driven by the event loop.
//
// The timer holds only a deadline. The event loop awaits `expired()` inside
// `tokio::select!` and calls `fire_if_due()` when it resolves, so a timer
// that was reset or cancelled in the meantime never fires stale.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct DebounceTimer {
    delay: Duration,
    deadline: Option<Instant>,
}

impl DebounceTimer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Arm the timer a full delay from now, replacing any earlier deadline.
    pub fn reset(&mut self) {
        self.deadline = Some(Instant::now() + self.delay);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Disarm and report `true` if the deadline has passed. A timer fires at
    /// most once per arming.
    pub fn fire_if_due(&mut self) -> bool {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    /// A future that resolves at the current deadline, or never if the timer
    /// is disarmed. It owns a copy of the deadline and does not borrow the
    /// timer.
    pub fn expired(&self) -> impl Future<Output = ()> + Send + 'static {
        let deadline = self.deadline;
        async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        }
    }
}

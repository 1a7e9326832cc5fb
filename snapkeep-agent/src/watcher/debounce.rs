//! Cancelable one-shot debounce timer.
//!
//! Every `schedule` pushes the deadline to `now + window`, discarding any
//! earlier deadline. The timer fires once per quiet period and is then idle
//! until scheduled again.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct DebounceTimer {
    window: Duration,
    deadline: Option<Instant>,
}

impl DebounceTimer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
        }
    }

    /// Start the timer, or restart it if already pending
    pub fn schedule(&mut self) {
        self.deadline = Some(Instant::now() + self.window);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Consume an expired deadline. Returns `true` exactly once per schedule.
    pub fn fire(&mut self) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= Instant::now() => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// Resolve at `deadline`, or never when there is none.
pub async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

//! Pending countdown and inactivity timers.
//!
//! Each purpose has at most one armed timer. A timer runs as a small tokio
//! task that sleeps until its deadline and then posts a [`TimerFired`] back to
//! the owner's queue. Fires are only honoured by [`TimerScheduler::accept`]
//! when their generation still matches the armed timer, so a fire racing with
//! a cancel or a reschedule is dropped.

use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerPurpose {
    /// Time left to disarm after a pending notification.
    Pending,
    /// Idle time before the screensaver starts.
    Inactivity,
}

impl fmt::Display for TimerPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerPurpose::Pending => f.write_str("pending"),
            TimerPurpose::Inactivity => f.write_str("inactivity"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub purpose: TimerPurpose,
    pub generation: u64,
}

#[derive(Debug)]
struct ArmedTimer {
    generation: u64,
    deadline: Instant,
    token: CancellationToken,
}

#[derive(Debug)]
pub struct TimerScheduler {
    fired_tx: mpsc::UnboundedSender<TimerFired>,
    next_generation: u64,
    armed: HashMap<TimerPurpose, ArmedTimer>,
}

impl TimerScheduler {
    pub fn new(fired_tx: mpsc::UnboundedSender<TimerFired>) -> Self {
        Self {
            fired_tx,
            next_generation: 0,
            armed: HashMap::new(),
        }
    }

    /// Arms a timer for `purpose`, replacing any timer already armed for it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule(&mut self, purpose: TimerPurpose, duration: Duration) -> u64 {
        self.cancel(purpose);

        self.next_generation += 1;
        let generation = self.next_generation;
        let deadline = Instant::now() + duration;
        let token = CancellationToken::new();

        let task_token = token.clone();
        let fired_tx = self.fired_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = task_token.cancelled() => {
                    trace!("{} timer {} cancelled", purpose, generation);
                }
                _ = sleep_until(deadline) => {
                    if fired_tx.send(TimerFired { purpose, generation }).is_err() {
                        debug!("{} timer {} fired after its owner stopped", purpose, generation);
                    }
                }
            }
        });

        debug!("Armed {} timer {} for {:?}", purpose, generation, duration);
        self.armed.insert(
            purpose,
            ArmedTimer {
                generation,
                deadline,
                token,
            },
        );
        generation
    }

    /// Cancels the timer for `purpose`. Returns whether one was armed.
    pub fn cancel(&mut self, purpose: TimerPurpose) -> bool {
        match self.armed.remove(&purpose) {
            Some(timer) => {
                timer.token.cancel();
                debug!("Cancelled {} timer {}", purpose, timer.generation);
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, timer) in self.armed.drain() {
            timer.token.cancel();
        }
    }

    /// Consumes a fire notification. Returns true when it belongs to the
    /// currently armed timer, which is then disarmed.
    pub fn accept(&mut self, fired: TimerFired) -> bool {
        match self.armed.get(&fired.purpose) {
            Some(timer) if timer.generation == fired.generation => {
                self.armed.remove(&fired.purpose);
                true
            }
            _ => {
                debug!(
                    "Dropping stale {} timer fire (generation {})",
                    fired.purpose, fired.generation
                );
                false
            }
        }
    }

    pub fn is_armed(&self, purpose: TimerPurpose) -> bool {
        self.armed.contains_key(&purpose)
    }

    pub fn remaining(&self, purpose: TimerPurpose) -> Option<Duration> {
        self.armed
            .get(&purpose)
            .map(|timer| timer.deadline.saturating_duration_since(Instant::now()))
    }
}

impl Drop for TimerScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

//! Reconnect scheduling.
//!
//! The scheduler owns the [`Backoff`] policy and at most one pending timer.
//! When the timer elapses it calls back into the connection kernel, which
//! decides whether the wake-up is still relevant. A manual disconnect
//! suppresses all scheduling until the next explicit connect.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    backoff::{Backoff, BackoffError},
    config::ReconnectConfig,
};

/// Identifier of a scheduled reconnect timer.
pub type TimerId = u64;

/// Result of asking the scheduler for a reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// A timer was armed.
    Scheduled { timer: TimerId, delay: Duration },
    /// Automatic reconnect is turned off.
    Disabled,
    /// A manual disconnect is in effect.
    Suppressed,
    /// The retry budget just ran out. Reported exactly once.
    Exhausted(BackoffError),
    /// The budget ran out earlier and has not been restored.
    AlreadyExhausted,
}

#[derive(Debug)]
struct PendingTimer {
    id: TimerId,
    cancel: CancellationToken,
}

/// Backoff-driven reconnect timer.
#[derive(Debug)]
pub struct ReconnectScheduler {
    backoff: Backoff,
    enabled: bool,
    manual_disconnect: bool,
    exhausted: bool,
    timer: Option<PendingTimer>,
    next_timer_id: TimerId,
}

impl ReconnectScheduler {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self::with_backoff(Backoff::from_config(config), config.auto_reconnect)
    }

    pub fn with_backoff(backoff: Backoff, enabled: bool) -> Self {
        Self {
            backoff,
            enabled,
            manual_disconnect: false,
            exhausted: false,
            timer: None,
            next_timer_id: 0,
        }
    }

    /// Marks or clears a manual disconnect. Setting it cancels any pending
    /// timer.
    pub fn set_manual_disconnect(&mut self, manual: bool) {
        self.manual_disconnect = manual;
        if manual {
            self.cancel();
        }
    }

    pub fn is_manual_disconnect(&self) -> bool {
        self.manual_disconnect
    }

    /// Arms a single delayed reconnect. `fire` runs on the timer task with the
    /// id of the timer that elapsed; it is never called for a cancelled timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<F>(&mut self, fire: F) -> Schedule
    where
        F: FnOnce(TimerId) + Send + 'static,
    {
        if self.manual_disconnect {
            debug!("Reconnect suppressed by manual disconnect");
            return Schedule::Suppressed;
        }
        if !self.enabled {
            debug!("Automatic reconnect disabled");
            return Schedule::Disabled;
        }
        if self.exhausted {
            return Schedule::AlreadyExhausted;
        }

        self.cancel();
        let delay = match self.backoff.next_delay() {
            Ok(delay) => delay,
            Err(e) => {
                warn!("Reconnect budget exhausted: {}", e);
                self.exhausted = true;
                return Schedule::Exhausted(e);
            }
        };

        self.next_timer_id += 1;
        let id = self.next_timer_id;
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => fire(id),
            }
        });
        self.timer = Some(PendingTimer { id, cancel });

        info!(
            "Reconnect attempt {} scheduled in {:.2} seconds",
            self.backoff.attempt(),
            delay.as_secs_f64()
        );
        Schedule::Scheduled { timer: id, delay }
    }

    /// Claims an elapsed timer. Returns `false` when the timer was superseded
    /// or cancelled, or a manual disconnect happened meanwhile.
    pub fn fire(&mut self, id: TimerId) -> bool {
        match &self.timer {
            Some(timer) if timer.id == id && !self.manual_disconnect => {
                self.timer = None;
                true
            }
            _ => false,
        }
    }

    /// Cancels the pending timer, if any.
    pub fn cancel(&mut self) -> bool {
        match self.timer.take() {
            Some(timer) => {
                timer.cancel.cancel();
                debug!("Pending reconnect {} cancelled", timer.id);
                true
            }
            None => false,
        }
    }

    /// A connection succeeded: start the next outage from the base delay.
    pub fn on_connected(&mut self) {
        self.backoff.reset();
        self.exhausted = false;
    }

    /// An explicit connect was requested: give a spent budget a fresh start.
    pub fn restore_budget(&mut self) {
        if self.exhausted {
            self.backoff.reset();
            self.exhausted = false;
        }
    }

    pub fn attempt(&self) -> u32 {
        self.backoff.attempt()
    }

    pub fn last_delay(&self) -> Option<Duration> {
        self.backoff.last_delay()
    }

    pub fn is_pending(&self) -> bool {
        self.timer.is_some()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

impl Drop for ReconnectScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

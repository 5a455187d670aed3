//! Rate-limited reminders. Reminders are advisory: they never affect the
//! gate decision.

use std::sync::Arc;

use crate::clock::Clock;

/// Allows at most one reminder per `interval_secs`. State lives as long as
/// the throttle and is cleared only by [`ReminderThrottle::reset`].
pub struct ReminderThrottle {
    clock: Arc<dyn Clock>,
    interval_secs: u64,
    enabled: bool,
    last_sent: Option<u64>,
    suppressed: u64,
}

impl ReminderThrottle {
    pub fn new(clock: Arc<dyn Clock>, interval_secs: u64, enabled: bool) -> Self {
        Self {
            clock,
            interval_secs,
            enabled,
            last_sent: None,
            suppressed: 0,
        }
    }

    /// Returns true if a reminder may be shown now, and records it.
    pub fn try_notify(&mut self) -> bool {
        if !self.enabled {
            return false;
        }
        let now = self.clock.now_secs();
        let open = self
            .last_sent
            .is_none_or(|last| now.saturating_sub(last) >= self.interval_secs);
        if open {
            self.last_sent = Some(now);
            self.suppressed = 0;
        } else {
            self.suppressed += 1;
            log::debug!("reminder suppressed ({} in window)", self.suppressed);
        }
        open
    }

    /// Reminders held back since the last one was shown.
    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }

    pub fn reset(&mut self) {
        self.last_sent = None;
        self.suppressed = 0;
    }
}

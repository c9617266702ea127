// Match window arithmetic for reminder polling ticks

use crate::models::ReminderClass;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::fmt;

/// Half-open interval `[start, end)` of event start instants due on one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MatchWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl MatchWindow {
    /// `[now + lead, now + lead + cadence)`
    pub fn for_tick(now: DateTime<Utc>, class: &ReminderClass) -> Self {
        let start = now + class.lead();
        Self {
            start,
            end: start + class.poll_cadence(),
        }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant < self.end
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

impl fmt::Display for MatchWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// True when a reminder due at `send_at` is discovered more than `tolerance` late
pub fn is_stale(send_at: DateTime<Utc>, now: DateTime<Utc>, tolerance: Duration) -> bool {
    now - send_at > tolerance
}

/// Carries the end of the last successfully queried window between ticks so
/// consecutive windows neither overlap nor leave gaps under tick jitter.
#[derive(Debug, Clone, Default)]
pub struct WindowTracker {
    last_end: Option<DateTime<Utc>>,
}

impl WindowTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_end(&self) -> Option<DateTime<Utc>> {
        self.last_end
    }

    /// Window for a tick at `now`. Starts where the last committed window
    /// ended, but never earlier than `now + lead - tolerance`.
    ///
    /// With nothing committed yet (a fresh process) the window starts at that
    /// floor, picking up reminders whose send instant passed while no process
    /// was polling. The ledger keeps already-sent ones from going out twice.
    pub fn next_window(&self, now: DateTime<Utc>, class: &ReminderClass) -> MatchWindow {
        let formula = MatchWindow::for_tick(now, class);
        let floor = now + class.lead() - class.tolerance();
        let start = match self.last_end {
            None => floor,
            Some(last_end) => last_end.max(floor),
        };
        MatchWindow {
            start,
            end: formula.end.max(start),
        }
    }

    /// Mark a window as covered. Only called after the store query succeeded.
    pub fn commit(&mut self, window: &MatchWindow) {
        self.last_end = Some(match self.last_end {
            Some(last_end) => last_end.max(window.end),
            None => window.end,
        });
    }
}

/// Delay until the next multiple of `cadence` since the epoch, so ticks land
/// on round instants
pub fn start_delay(now: DateTime<Utc>, cadence: Duration) -> std::time::Duration {
    let cadence_ms = cadence.num_milliseconds();
    if cadence_ms <= 0 {
        return std::time::Duration::ZERO;
    }
    let into_period = now.timestamp_millis().rem_euclid(cadence_ms);
    if into_period == 0 {
        std::time::Duration::ZERO
    } else {
        std::time::Duration::from_millis((cadence_ms - into_period) as u64)
    }
}

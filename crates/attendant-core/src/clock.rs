//! Attendance session countdown: Active → Closing (grace) → Closed.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Grace period after the nominal end during which closure is pending.
pub const GRACE_PERIOD_SECS: i64 = 30;

/// Time bounds of one attendance session. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionWindow {
    pub session_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockState {
    Active,
    Closing,
    Closed,
}

/// Pure transition: where `now` falls relative to `end` and `end + grace`.
pub fn transition(now: DateTime<Utc>, end: DateTime<Utc>, grace: Duration) -> ClockState {
    if now < end {
        ClockState::Active
    } else if now < end + grace {
        ClockState::Closing
    } else {
        ClockState::Closed
    }
}

/// Countdown text for the given instant.
pub fn status_text(now: DateTime<Utc>, end: DateTime<Utc>, grace: Duration) -> String {
    match transition(now, end, grace) {
        ClockState::Active => {
            let secs = (end - now).num_seconds();
            format!("Attendance closes in {}:{:02}", secs / 60, secs % 60)
        }
        ClockState::Closing => {
            let secs = (end + grace - now).num_seconds();
            format!("Closing in {secs}s")
        }
        ClockState::Closed => "Attendance Session Closed".to_string(),
    }
}

/// Change reported by [`SessionClock::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockEvent {
    EnteredClosing,
    EnteredClosed,
}

/// Monotonic session clock: once a state is reached it is never left for an
/// earlier one, even if a later clock sample is behind an earlier one.
#[derive(Debug, Clone)]
pub struct SessionClock {
    window: SessionWindow,
    grace: Duration,
    state: ClockState,
}

impl SessionClock {
    pub fn new(window: SessionWindow, grace: Duration) -> Self {
        Self {
            window,
            grace,
            state: ClockState::Active,
        }
    }

    pub fn state(&self) -> ClockState {
        self.state
    }

    pub fn window(&self) -> &SessionWindow {
        &self.window
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Evaluate one clock sample. Returns the events crossed, in order.
    pub fn advance(&mut self, now: DateTime<Utc>) -> Vec<ClockEvent> {
        let next = transition(now, self.window.end_time, self.grace);
        if next <= self.state {
            return Vec::new();
        }
        let mut events = Vec::new();
        if self.state == ClockState::Active {
            events.push(ClockEvent::EnteredClosing);
        }
        if next == ClockState::Closed {
            events.push(ClockEvent::EnteredClosed);
        }
        self.state = next;
        events
    }

    /// Countdown text consistent with the tracked (monotonic) state.
    pub fn status_text(&self, now: DateTime<Utc>) -> String {
        match self.state {
            ClockState::Closed => "Attendance Session Closed".to_string(),
            ClockState::Closing if now < self.window.end_time => {
                format!("Closing in {}s", self.grace.num_seconds())
            }
            _ => status_text(now, self.window.end_time, self.grace),
        }
    }
}

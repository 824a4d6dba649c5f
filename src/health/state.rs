//! Backend health states.
//!
//! A backend starts `Unknown`, becomes `Up` after a successful connect and
//! `Down` after a failed one. `Down` is sticky until the cooldown elapses,
//! then the backend drops back to `Unknown` and is tried again.

use std::fmt;
use std::time::{Duration, Instant};

/// How long a DOWN backend is skipped before it is tried again
pub const DEFAULT_DOWN_COOLDOWN: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendState {
    #[default]
    Unknown,
    Up,
    Down,
}

impl BackendState {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendState::Unknown => "unknown",
            BackendState::Up => "up",
            BackendState::Down => "down",
        }
    }

    /// Gauge value exported per backend
    pub fn as_metric(self) -> i64 {
        match self {
            BackendState::Unknown => 0,
            BackendState::Up => 1,
            BackendState::Down => -1,
        }
    }
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state and when it was entered
#[derive(Debug, Clone, Copy)]
pub struct BackendStatus {
    pub state: BackendState,
    pub since: Instant,
}

impl BackendStatus {
    pub fn new(now: Instant) -> Self {
        Self {
            state: BackendState::Unknown,
            since: now,
        }
    }

    /// Returns true if the state changed
    pub fn set(&mut self, state: BackendState, now: Instant) -> bool {
        if self.state == state {
            return false;
        }
        self.state = state;
        self.since = now;
        true
    }

    /// Reset a DOWN backend to UNKNOWN once `cooldown` has passed.
    ///
    /// Returns true if the backend was woken.
    pub fn wake_if_cooled(&mut self, now: Instant, cooldown: Duration) -> bool {
        if self.state != BackendState::Down {
            return false;
        }
        if now.saturating_duration_since(self.since) < cooldown {
            return false;
        }
        self.set(BackendState::Unknown, now)
    }
}

//! Idle detection: turns the host's input-idleness signal into timestamped
//! idle/active transitions.

#[cfg(target_os = "linux")]
mod linux;

use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

/// A change in the user's input activity.
///
/// `Instant`s are monotonic and drive the accounting; the wall-clock times are
/// only used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityEvent {
    /// No input since `since`.
    Idle { since: Instant, wall: DateTime<Utc> },
    /// Input resumed at `at`.
    Active { at: Instant, wall: DateTime<Utc> },
}

impl ActivityEvent {
    /// Build an idle event for a user who has not touched input for `idle_for`.
    pub fn idle_for(idle_for: Duration) -> Self {
        let now = Instant::now();
        let since = now.checked_sub(idle_for).unwrap_or(now);
        let wall = Utc::now() - chrono::Duration::from_std(idle_for).unwrap_or_default();
        ActivityEvent::Idle { since, wall }
    }

    /// Build an active event stamped now.
    pub fn active_now() -> Self {
        ActivityEvent::Active {
            at: Instant::now(),
            wall: Utc::now(),
        }
    }

    #[cfg(test)]
    pub fn is_idle(&self) -> bool {
        matches!(self, ActivityEvent::Idle { .. })
    }
}

#[cfg(target_os = "linux")]
pub use linux::IdleDetector;

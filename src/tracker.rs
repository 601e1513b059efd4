//! Cumulative activity accounting across independently configured tracking periods.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Configuration for one tracking period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodConfig {
    /// Name of the period (e.g. "micro", "normal", "workday").
    pub name: String,
    /// How many seconds a user can work before needing a break.
    pub limit_seconds: u64,
    /// Idle seconds that clear the accumulator while still under the limit.
    /// Must be less than `break_seconds`, or 0 to disable.
    #[serde(default)]
    pub reset_seconds: u64,
    /// Idle seconds that always clear the accumulator.
    pub break_seconds: u64,
}

impl PeriodConfig {
    pub fn new(name: impl Into<String>, limit_seconds: u64, reset_seconds: u64, break_seconds: u64) -> Self {
        Self {
            name: name.into(),
            limit_seconds,
            reset_seconds,
            break_seconds,
        }
    }
}

/// Default period table: micro pauses, regular breaks, and the whole workday.
pub fn default_periods() -> Vec<PeriodConfig> {
    vec![
        PeriodConfig::new("micro", 3 * 60, 15, 30),
        PeriodConfig::new("normal", 45 * 60, 0, 10 * 60),
        PeriodConfig::new("workday", 4 * 60 * 60, 0, 8 * 60 * 60),
    ]
}

/// Current state of a tracked period.
#[derive(Debug, Clone)]
pub struct TrackingPeriod {
    config: PeriodConfig,
    active_seconds: u64,
}

impl TrackingPeriod {
    fn new(config: PeriodConfig) -> Self {
        Self {
            config,
            active_seconds: 0,
        }
    }

    #[cfg(test)]
    pub fn active_seconds(&self) -> u64 {
        self.active_seconds
    }

    /// Safe until accumulation strictly exceeds the limit.
    pub fn is_safe(&self) -> bool {
        self.active_seconds <= self.config.limit_seconds
    }

    fn apply_idle(&mut self, idle_seconds: u64) {
        if self.active_seconds == 0 {
            return;
        }

        let config = &self.config;
        if config.reset_seconds > 0
            && self.active_seconds < config.limit_seconds
            && idle_seconds > config.reset_seconds
        {
            self.active_seconds = 0;
        } else if idle_seconds > config.break_seconds {
            debug!(
                "Break satisfied for '{}' period after {}s idle ({}s accumulated)",
                config.name, idle_seconds, self.active_seconds
            );
            self.active_seconds = 0;
        }
    }
}

/// Point-in-time view of one period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodSnapshot {
    pub name: String,
    pub safe: bool,
    pub active_seconds: u64,
    pub limit_seconds: u64,
}

/// Holds every tracking period and applies idle/active observations to them.
///
/// The tracker has no notion of wall-clock time: callers translate their own
/// clock readings into deltas (see [`crate::driver::ActivityClock`]).
#[derive(Debug, Clone)]
pub struct Tracker {
    periods: Vec<TrackingPeriod>,
}

impl Tracker {
    pub fn new(configs: impl IntoIterator<Item = PeriodConfig>) -> Self {
        Self {
            periods: configs.into_iter().map(TrackingPeriod::new).collect(),
        }
    }

    #[cfg(test)]
    pub fn periods(&self) -> &[TrackingPeriod] {
        &self.periods
    }

    /// Receives the total number of idle seconds in the current stretch of
    /// inactivity. Periods with nothing accumulated are left alone.
    pub fn provide_idle_seconds(&mut self, idle_seconds: u64) {
        for period in &mut self.periods {
            period.apply_idle(idle_seconds);
        }
    }

    /// Receives an increment of active time. Never pass a running total here:
    /// each call adds to every period.
    pub fn provide_active_seconds(&mut self, active_seconds: u64) {
        for period in &mut self.periods {
            period.active_seconds = period.active_seconds.saturating_add(active_seconds);
        }
    }

    /// Snapshot of every period in configuration order.
    pub fn snapshot(&self) -> Vec<PeriodSnapshot> {
        self.periods
            .iter()
            .map(|period| PeriodSnapshot {
                name: period.config.name.clone(),
                safe: period.is_safe(),
                active_seconds: period.active_seconds,
                limit_seconds: period.config.limit_seconds,
            })
            .collect()
    }

    /// Debug dump of every period's standing.
    pub fn log_status(&self) {
        for period in &self.periods {
            let standing = if period.is_safe() { "SAFE" } else { "BREAK REQUIRED" };
            debug!(
                "{:>5}/{:>5} ('{}' period) [{}]",
                period.active_seconds, period.config.limit_seconds, period.config.name, standing
            );
        }
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new(default_periods())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn micro() -> Tracker {
        Tracker::new(vec![PeriodConfig::new("micro", 180, 15, 30)])
    }

    fn active(tracker: &Tracker) -> Vec<u64> {
        tracker.periods().iter().map(|p| p.active_seconds()).collect()
    }

    #[test]
    fn active_deltas_sum_independent_of_chunking() {
        let mut chunked = Tracker::default();
        chunked.provide_active_seconds(1);
        chunked.provide_active_seconds(1);
        chunked.provide_active_seconds(1);

        let mut lump = Tracker::default();
        lump.provide_active_seconds(3);

        assert_eq!(active(&chunked), vec![3, 3, 3]);
        assert_eq!(active(&chunked), active(&lump));
    }

    #[test]
    fn short_idle_resets_while_under_limit() {
        let mut tracker = micro();
        tracker.provide_active_seconds(100);
        tracker.provide_idle_seconds(20);
        assert_eq!(active(&tracker), vec![0]);
    }

    #[test]
    fn short_idle_keeps_accumulation_once_over_limit() {
        let mut tracker = micro();
        tracker.provide_active_seconds(200);

        tracker.provide_idle_seconds(20);
        assert_eq!(active(&tracker), vec![200]);

        tracker.provide_idle_seconds(30);
        assert_eq!(active(&tracker), vec![200], "break threshold is strict");

        tracker.provide_idle_seconds(31);
        assert_eq!(active(&tracker), vec![0]);
    }

    #[test]
    fn idle_at_reset_threshold_is_not_enough() {
        let mut tracker = micro();
        tracker.provide_active_seconds(100);
        tracker.provide_idle_seconds(15);
        assert_eq!(active(&tracker), vec![100]);
    }

    #[test]
    fn zero_reset_only_honours_break() {
        let mut tracker = Tracker::new(vec![PeriodConfig::new("normal", 2700, 0, 600)]);
        tracker.provide_active_seconds(60);

        tracker.provide_idle_seconds(1);
        tracker.provide_idle_seconds(599);
        tracker.provide_idle_seconds(600);
        assert_eq!(active(&tracker), vec![60]);

        tracker.provide_idle_seconds(601);
        assert_eq!(active(&tracker), vec![0]);
    }

    #[test]
    fn idle_is_noop_for_empty_periods() {
        let mut tracker = Tracker::default();
        tracker.provide_idle_seconds(u64::MAX);
        assert_eq!(active(&tracker), vec![0, 0, 0]);
    }

    #[test]
    fn huge_idle_lump_clears_everything() {
        let mut tracker = Tracker::default();
        tracker.provide_active_seconds(5 * 60 * 60);
        tracker.provide_idle_seconds(9 * 60 * 60);
        assert_eq!(active(&tracker), vec![0, 0, 0]);
    }

    #[test]
    fn periods_reset_independently() {
        let mut tracker = Tracker::default();
        tracker.provide_active_seconds(100);
        tracker.provide_idle_seconds(20);
        assert_eq!(active(&tracker), vec![0, 100, 100]);
    }

    #[test]
    fn limit_equality_is_safe() {
        let mut tracker = micro();
        tracker.provide_active_seconds(180);
        assert!(tracker.snapshot()[0].safe);

        tracker.provide_active_seconds(1);
        assert!(!tracker.snapshot()[0].safe);
    }

    #[test]
    fn snapshot_order_matches_configuration() {
        let mut tracker = Tracker::default();
        tracker.provide_active_seconds(42);

        let first = tracker.snapshot();
        let second = tracker.snapshot();
        let names: Vec<_> = first.iter().map(|s| s.name.as_str()).collect();

        assert_eq!(names, vec!["micro", "normal", "workday"]);
        assert_eq!(first, second);
        assert_eq!(first[1].limit_seconds, 2700);
        assert_eq!(first[1].active_seconds, 42);
    }
}

//! Driver loop: feeds elapsed idle/active time into the tracker and runs one
//! server pass per tick.

use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::idle::ActivityEvent;
use crate::server::{Listener, QueryServer, ServerStats};
use crate::tracker::Tracker;

/// What the driver currently believes the user is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserState {
    /// No report from the idle source yet.
    Unknown,
    /// Idle since the given instant.
    Idle(Instant),
    /// Active since the given instant.
    Active(Instant),
}

/// Converts monotonic activity transitions into tracker deltas.
///
/// Idle time is reported as the running total of the current idle stretch;
/// active time is reported in whole-second increments, keeping any
/// sub-second remainder for the next tick.
#[derive(Debug, Clone)]
pub struct ActivityClock {
    state: UserState,
    /// Active time up to this instant has already been reported.
    accounted_until: Option<Instant>,
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            state: UserState::Unknown,
            accounted_until: None,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> UserState {
        self.state
    }

    /// Record a transition from the idle source.
    pub fn observe(&mut self, event: ActivityEvent) {
        match event {
            ActivityEvent::Idle { since, wall } => {
                info!("User idle since {}", wall);
                self.state = UserState::Idle(since);
            }
            ActivityEvent::Active { at, wall } => {
                if !matches!(self.state, UserState::Active(_)) {
                    info!("User activity resumed at {}", wall);
                    self.state = UserState::Active(at);
                    self.accounted_until = None;
                }
            }
        }
    }

    /// Report time elapsed up to `now` to the tracker.
    pub fn advance(&mut self, now: Instant, tracker: &mut Tracker) {
        match self.state {
            UserState::Unknown => {}
            UserState::Idle(since) => {
                tracker.provide_idle_seconds(now.saturating_duration_since(since).as_secs());
            }
            UserState::Active(since) => {
                let from = self.accounted_until.unwrap_or(since);
                let elapsed = now.saturating_duration_since(from).as_secs();
                if elapsed > 0 {
                    tracker.provide_active_seconds(elapsed);
                    self.accounted_until = Some(from + Duration::from_secs(elapsed));
                }
            }
        }
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the daemon mutates, owned in one place and passed explicitly.
pub struct Daemon<L: Listener> {
    tracker: Tracker,
    server: QueryServer<L>,
    clock: ActivityClock,
}

impl<L: Listener> Daemon<L> {
    pub fn new(tracker: Tracker, server: QueryServer<L>) -> Self {
        Self {
            tracker,
            server,
            clock: ActivityClock::new(),
        }
    }

    /// Feed a transition from the idle source.
    pub fn observe(&mut self, event: ActivityEvent) {
        self.clock.observe(event);
        self.tracker.log_status();
    }

    /// Account elapsed time, then run one non-blocking server pass.
    pub fn tick(&mut self, now: Instant) {
        self.clock.advance(now, &mut self.tracker);
        self.server.run_pass(&self.tracker);
    }

    /// Close every client connection and release the listener.
    pub fn shutdown(mut self) {
        self.server.shutdown();
        let ServerStats {
            accepted,
            closed,
            rejected_full,
            status_requests,
            info_requests,
            unknown_commands,
            deferred_dispatches,
            dropped_responses,
            overflow_evictions,
            io_errors,
        } = self.server.stats();
        info!(
            "Served {} status requests over {} connections ({} closed)",
            status_requests, accepted, closed
        );
        debug!(
            "Server counters: rejected_full={} info={} unknown={} deferred={} dropped={} overflow_evictions={} io_errors={}",
            rejected_full, info_requests, unknown_commands, deferred_dispatches, dropped_responses, overflow_evictions, io_errors
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{SocketEndpoint, DEFAULT_MAX_BUFFER, DEFAULT_MAX_CLIENTS};
    use crate::tracker::PeriodConfig;
    use chrono::Utc;
    use std::io::{BufRead, BufReader, Write};
    use std::os::unix::net::UnixStream;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn active(at: Instant) -> ActivityEvent {
        ActivityEvent::Active { at, wall: Utc::now() }
    }

    fn idle(since: Instant) -> ActivityEvent {
        ActivityEvent::Idle { since, wall: Utc::now() }
    }

    fn micro() -> Tracker {
        Tracker::new(vec![PeriodConfig::new("micro", 180, 15, 30)])
    }

    fn accumulated(tracker: &Tracker) -> u64 {
        tracker.periods()[0].active_seconds()
    }

    #[test]
    fn unknown_state_reports_nothing() {
        let t0 = Instant::now();
        let mut clock = ActivityClock::new();
        let mut tracker = micro();
        clock.advance(t0 + secs(100), &mut tracker);
        assert_eq!(accumulated(&tracker), 0);
        assert_eq!(clock.state(), UserState::Unknown);
    }

    #[test]
    fn active_time_reported_incrementally() {
        let t0 = Instant::now();
        let mut clock = ActivityClock::new();
        let mut tracker = micro();
        clock.observe(active(t0));

        clock.advance(t0 + Duration::from_millis(400), &mut tracker);
        assert_eq!(accumulated(&tracker), 0);

        clock.advance(t0 + Duration::from_millis(1200), &mut tracker);
        assert_eq!(accumulated(&tracker), 1);

        // The 200ms remainder carries into the next report.
        clock.advance(t0 + Duration::from_millis(2000), &mut tracker);
        assert_eq!(accumulated(&tracker), 2);

        clock.advance(t0 + secs(10), &mut tracker);
        clock.advance(t0 + secs(10), &mut tracker);
        assert_eq!(accumulated(&tracker), 10);
    }

    #[test]
    fn repeated_active_event_does_not_restart_accounting() {
        let t0 = Instant::now();
        let mut clock = ActivityClock::new();
        let mut tracker = micro();
        clock.observe(active(t0));
        clock.advance(t0 + secs(5), &mut tracker);

        clock.observe(active(t0 + secs(5)));
        clock.advance(t0 + secs(6), &mut tracker);
        assert_eq!(accumulated(&tracker), 6);
    }

    #[test]
    fn idle_reports_total_idle_duration() {
        let t0 = Instant::now();
        let mut clock = ActivityClock::new();
        let mut tracker = micro();
        clock.observe(active(t0));
        clock.advance(t0 + secs(100), &mut tracker);
        assert_eq!(accumulated(&tracker), 100);

        clock.observe(idle(t0 + secs(100)));
        clock.advance(t0 + secs(110), &mut tracker);
        assert_eq!(accumulated(&tracker), 100);

        clock.advance(t0 + secs(116), &mut tracker);
        assert_eq!(accumulated(&tracker), 0);
    }

    #[test]
    fn resumed_activity_starts_from_resume_instant() {
        let t0 = Instant::now();
        let mut clock = ActivityClock::new();
        let mut tracker = micro();
        clock.observe(active(t0));
        clock.advance(t0 + secs(20), &mut tracker);
        clock.observe(idle(t0 + secs(20)));
        clock.advance(t0 + secs(25), &mut tracker);

        clock.observe(active(t0 + secs(25)));
        clock.advance(t0 + secs(28), &mut tracker);
        assert_eq!(accumulated(&tracker), 23);
    }

    #[test]
    fn tick_accounts_then_serves() {
        let tmp = tempfile::tempdir().unwrap();
        let endpoint = SocketEndpoint::bind(tmp.path(), "socket.sock", 1).unwrap();
        let server = QueryServer::new(endpoint, DEFAULT_MAX_CLIENTS, DEFAULT_MAX_BUFFER);
        let mut daemon = Daemon::new(micro(), server);

        let t0 = Instant::now();
        daemon.observe(active(t0));

        let mut client = UnixStream::connect(daemon.server.listener().path()).unwrap();
        client.set_read_timeout(Some(secs(5))).unwrap();
        daemon.tick(t0 + secs(1));
        client.write_all(b"status\n").unwrap();
        daemon.tick(t0 + secs(181));
        daemon.tick(t0 + secs(181));

        let mut line = String::new();
        BufReader::new(&client).read_line(&mut line).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["periods"][0]["accumulated_seconds"], 181);
        assert_eq!(value["periods"][0]["safe"], false);

        let path = daemon.server.listener().path().to_path_buf();
        daemon.shutdown();
        assert!(!path.exists());
    }
}

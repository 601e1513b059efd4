//! Idle detection for Linux using X11 XScreenSaver extension.

use anyhow::{bail, Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use x11rb::connection::Connection;
use x11rb::protocol::screensaver::ConnectionExt as ScreensaverConnectionExt;
use x11rb::rust_connection::RustConnection;

use super::ActivityEvent;

/// Idle detector polling the X11 XScreenSaver extension.
///
/// The detector holds the only broadcast sender until [`IdleDetector::start`]
/// hands it to the monitor thread. Once that thread exits, for whatever
/// reason, subscribers observe `RecvError::Closed`.
pub struct IdleDetector {
    /// Input-free time after which the user counts as idle.
    timeout: Duration,
    /// Polling interval.
    check_interval: Duration,
    /// Whether the monitor thread should keep running.
    running: Arc<AtomicBool>,
    /// Broadcast sender for state changes, taken by the monitor thread.
    state_tx: Option<broadcast::Sender<ActivityEvent>>,
    monitor_handle: Option<JoinHandle<()>>,
}

impl IdleDetector {
    /// Create a new idle detector, checking that the screensaver extension is usable.
    pub fn new(timeout: Duration, check_interval: Duration) -> Result<Self> {
        let (conn, screen_num) = RustConnection::connect(None)
            .context("Failed to connect to X11 display. Is DISPLAY set?")?;

        let screen = &conn.setup().roots[screen_num];

        conn.screensaver_query_info(screen.root)
            .context("XScreenSaver extension not available")?
            .reply()
            .context("Failed to query XScreenSaver info")?;

        drop(conn);

        Ok(Self::with_intervals(timeout, check_interval))
    }

    fn with_intervals(timeout: Duration, check_interval: Duration) -> Self {
        let (state_tx, _) = broadcast::channel(16);
        Self {
            timeout,
            check_interval,
            running: Arc::new(AtomicBool::new(false)),
            state_tx: Some(state_tx),
            monitor_handle: None,
        }
    }

    /// Subscribe to activity transitions. Only possible before [`start`](Self::start).
    pub fn subscribe(&self) -> Result<broadcast::Receiver<ActivityEvent>> {
        match &self.state_tx {
            Some(state_tx) => Ok(state_tx.subscribe()),
            None => bail!("Idle detector already started"),
        }
    }

    /// Start the monitor thread. The first poll always reports the current state.
    pub fn start(&mut self) -> Result<()> {
        info!("Starting idle detector with timeout {:?}", self.timeout);

        let timeout = self.timeout;
        let check_interval = self.check_interval;
        self.spawn_monitor(move |running, state_tx| {
            run_idle_monitor(running, timeout, check_interval, state_tx);
        })
    }

    fn spawn_monitor<F>(&mut self, monitor: F) -> Result<()>
    where
        F: FnOnce(Arc<AtomicBool>, broadcast::Sender<ActivityEvent>) + Send + 'static,
    {
        let Some(state_tx) = self.state_tx.take() else {
            return Ok(());
        };

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let handle = thread::Builder::new()
            .name("idle-monitor".to_string())
            .spawn(move || monitor(running, state_tx))
            .context("Failed to spawn idle monitor thread")?;
        self.monitor_handle = Some(handle);

        Ok(())
    }

    /// Stop the monitor thread.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.monitor_handle.take() {
            if handle.join().is_err() {
                error!("Idle monitor thread panicked");
            }
        }
        info!("Idle detector stopped");
    }
}

/// Get the time since the last user input from the XScreenSaver extension.
fn query_idle_time(conn: &RustConnection, root: u32) -> Option<Duration> {
    let reply = conn.screensaver_query_info(root).ok()?.reply().ok()?;
    Some(Duration::from_millis(reply.ms_since_user_input as u64))
}

/// Turns raw idle-time readings into idle/active transitions.
#[derive(Debug, Default)]
struct TransitionFilter {
    was_idle: Option<bool>,
    /// Last query failed; further failures are only logged at debug level.
    failing: bool,
}

impl TransitionFilter {
    /// Returns an event when the reading flips the user's state. The first
    /// successful reading always does.
    fn observe(&mut self, reading: Option<Duration>, timeout: Duration) -> Option<ActivityEvent> {
        let Some(idle_time) = reading else {
            if self.failing {
                debug!("X11 idle time still unavailable");
            } else {
                warn!("Failed to query X11 idle time");
                self.failing = true;
            }
            return None;
        };

        if self.failing {
            info!("X11 idle time available again");
            self.failing = false;
        }

        let is_idle = idle_time >= timeout;
        if self.was_idle == Some(is_idle) {
            return None;
        }
        self.was_idle = Some(is_idle);

        if is_idle {
            debug!("User became idle (idle for {:?})", idle_time);
            Some(ActivityEvent::idle_for(idle_time))
        } else {
            debug!("User became active");
            Some(ActivityEvent::active_now())
        }
    }
}

/// Poll idle time and broadcast each idle/active transition.
fn run_idle_monitor(
    running: Arc<AtomicBool>,
    timeout: Duration,
    check_interval: Duration,
    state_tx: broadcast::Sender<ActivityEvent>,
) {
    let (conn, screen_num) = match RustConnection::connect(None) {
        Ok(connected) => connected,
        Err(err) => {
            error!("Idle monitor could not connect to X11: {}", err);
            return;
        }
    };
    let root = conn.setup().roots[screen_num].root;

    info!("Starting idle monitor using X11 XScreenSaver");

    let mut filter = TransitionFilter::default();

    while running.load(Ordering::SeqCst) {
        if let Some(event) = filter.observe(query_idle_time(&conn, root), timeout) {
            if state_tx.send(event).is_err() {
                debug!("No activity subscribers left");
            }
        }

        thread::sleep(check_interval);
    }

    debug!("Idle monitor thread exiting");
}

impl Drop for IdleDetector {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    fn detector() -> IdleDetector {
        IdleDetector::with_intervals(Duration::from_secs(1), Duration::from_millis(10))
    }

    #[test]
    fn monitor_exit_closes_the_channel() {
        let mut detector = detector();
        let mut rx = detector.subscribe().unwrap();

        detector
            .spawn_monitor(|_running, state_tx| {
                state_tx.send(ActivityEvent::active_now()).unwrap();
            })
            .unwrap();

        let first = tokio_test::block_on(rx.recv()).unwrap();
        assert!(matches!(first, ActivityEvent::Active { .. }));
        assert!(matches!(tokio_test::block_on(rx.recv()), Err(RecvError::Closed)));
        detector.stop();
    }

    #[test]
    fn subscribing_after_start_is_rejected() {
        let mut detector = detector();
        let _rx = detector.subscribe().unwrap();
        detector.spawn_monitor(|_running, _state_tx| {}).unwrap();

        assert!(detector.subscribe().is_err());
        // A second start is a no-op.
        assert!(detector.spawn_monitor(|_running, _state_tx| {}).is_ok());
        detector.stop();
    }

    #[test]
    fn stop_survives_a_panicking_monitor() {
        let mut detector = detector();
        let mut rx = detector.subscribe().unwrap();
        detector
            .spawn_monitor(|_running, _state_tx| panic!("monitor failure"))
            .unwrap();

        assert!(matches!(tokio_test::block_on(rx.recv()), Err(RecvError::Closed)));
        detector.stop();
        assert!(detector.monitor_handle.is_none());
    }

    #[test]
    fn first_reading_always_reports() {
        let timeout = Duration::from_secs(1);
        let mut filter = TransitionFilter::default();

        let first = filter.observe(Some(Duration::ZERO), timeout);
        assert!(matches!(first, Some(ActivityEvent::Active { .. })));
        assert!(filter.observe(Some(Duration::from_millis(200)), timeout).is_none());

        let idle = filter.observe(Some(Duration::from_secs(3)), timeout);
        assert!(matches!(idle, Some(ActivityEvent::Idle { .. })));
        assert!(filter.observe(Some(Duration::from_secs(4)), timeout).is_none());
    }

    #[test]
    fn query_failures_are_reported_once_and_keep_state() {
        let timeout = Duration::from_secs(1);
        let mut filter = TransitionFilter::default();
        filter.observe(Some(Duration::ZERO), timeout);

        assert!(filter.observe(None, timeout).is_none());
        assert!(filter.failing);
        assert!(filter.observe(None, timeout).is_none());
        assert!(filter.failing);

        // Recovery with an unchanged state emits nothing.
        assert!(filter.observe(Some(Duration::ZERO), timeout).is_none());
        assert!(!filter.failing);
    }
}

//! Session aging: accrues active time for running apps and closes sessions
//! that have outlived the inactivity timeout.

use chrono::{DateTime, Utc};
use iconwear_protocol::Notification;
use serde::Deserialize;
use std::io;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::engine::WearEngine;
use crate::store::WearStore;

pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_INACTIVITY_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct MonitorSettings {
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            tick_interval_secs: DEFAULT_TICK_INTERVAL_SECS,
            inactivity_timeout_secs: DEFAULT_INACTIVITY_TIMEOUT_SECS,
        }
    }
}

fn default_tick_interval_secs() -> u64 {
    DEFAULT_TICK_INTERVAL_SECS
}

fn default_inactivity_timeout_secs() -> u64 {
    DEFAULT_INACTIVITY_TIMEOUT_SECS
}

impl MonitorSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub accrued: Vec<String>,
    pub expired: Vec<String>,
    pub notifications: Vec<Notification>,
}

/// Runs one monitor pass over the active sessions.
///
/// Accrual is the tick period, not the session's lifetime. A session whose age
/// exceeds the timeout is removed without accruing for this tick.
pub fn run_tick(
    store: &mut WearStore,
    now: DateTime<Utc>,
    settings: &MonitorSettings,
) -> TickReport {
    let timeout = i64::try_from(settings.inactivity_timeout_secs).unwrap_or(i64::MAX);
    let mut report = TickReport::default();

    for session in store.active_sessions() {
        let elapsed = now.signed_duration_since(session.opened_at).num_seconds();
        if elapsed > timeout {
            tracing::info!(
                app_id = %session.app_id,
                elapsed_secs = elapsed,
                "Session closed by inactivity timeout"
            );
            store.end_session(&session.app_id);
            report.expired.push(session.app_id);
            continue;
        }

        let notifications = store.accrue_active(&session.app_id, settings.tick_interval_secs);
        report.notifications.extend(notifications);
        report.accrued.push(session.app_id);
    }

    report
}

/// Background thread driving [`WearEngine::tick`] at a fixed interval.
pub struct MonitorHandle {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

impl MonitorHandle {
    /// Signals the thread and waits for the in-flight tick, if any, to finish.
    pub fn stop(self) {
        let _ = self.stop.send(());
        if self.thread.join().is_err() {
            tracing::warn!("Session monitor thread panicked");
        }
    }
}

pub fn spawn_session_monitor(
    engine: Arc<WearEngine>,
    interval: Duration,
) -> io::Result<MonitorHandle> {
    let (stop, stop_rx) = mpsc::channel::<()>();
    let thread = thread::Builder::new()
        .name("wear-monitor".to_string())
        .spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => engine.tick(),
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    tracing::debug!("Session monitor stopping");
                    break;
                }
            }
        })?;
    Ok(MonitorHandle { stop, thread })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wear::WearWeights;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        t0() + ChronoDuration::seconds(secs)
    }

    #[test]
    fn accrues_tick_period_per_active_session() {
        let mut store = WearStore::new(WearWeights::default());
        let settings = MonitorSettings::default();
        store.record_launch("A", t0());
        store.record_launch("B", at(10));

        let report = run_tick(&mut store, at(30), &settings);
        assert_eq!(report.accrued, vec!["A".to_string(), "B".to_string()]);
        assert!(report.expired.is_empty());
        assert_eq!(store.get("A").active_seconds, 30);
        assert_eq!(store.get("B").active_seconds, 30);
    }

    #[test]
    fn short_activity_does_not_move_the_level() {
        let mut store = WearStore::new(WearWeights::default());
        let settings = MonitorSettings::default();
        store.record_launch("A", t0());
        for tick in 1..=3 {
            let report = run_tick(&mut store, at(tick * 30), &settings);
            assert!(report.notifications.is_empty());
        }
        assert_eq!(store.get("A").active_seconds, 90);
        assert_eq!(store.get("A").wear_level, 1);
    }

    #[test]
    fn long_activity_adds_time_component() {
        let mut store = WearStore::new(WearWeights::default());
        let settings = MonitorSettings {
            tick_interval_secs: 30,
            inactivity_timeout_secs: 40_000,
        };
        store.record_launch("A", t0());
        for tick in 1..=1000 {
            run_tick(&mut store, at(tick * 30), &settings);
        }
        assert_eq!(store.get("A").active_seconds, 30_000);
        assert_eq!(store.get("A").wear_level, 6);
    }

    #[test]
    fn expires_session_within_one_tick_of_timeout() {
        let mut store = WearStore::new(WearWeights::default());
        let settings = MonitorSettings::default();
        store.record_launch("A", t0());

        for tick in 1..=10 {
            let report = run_tick(&mut store, at(tick * 30), &settings);
            assert!(report.expired.is_empty(), "expired early at tick {}", tick);
        }
        assert_eq!(store.get("A").active_seconds, 300);

        let report = run_tick(&mut store, at(330), &settings);
        assert_eq!(report.expired, vec!["A".to_string()]);
        assert!(report.accrued.is_empty());
        assert!(!store.is_active("A"));
        assert_eq!(store.get("A").active_seconds, 300);

        let report = run_tick(&mut store, at(360), &settings);
        assert_eq!(report, TickReport::default());
        assert_eq!(store.get("A").active_seconds, 300);
    }

    #[test]
    fn relaunch_after_expiry_opens_a_fresh_session() {
        let mut store = WearStore::new(WearWeights::default());
        let settings = MonitorSettings::default();
        store.record_launch("A", t0());
        run_tick(&mut store, at(400), &settings);
        assert!(!store.is_active("A"));

        store.record_launch("A", at(500));
        let report = run_tick(&mut store, at(530), &settings);
        assert_eq!(report.accrued, vec!["A".to_string()]);
        assert_eq!(store.get("A").launches, 2);
    }

    #[test]
    fn sessions_are_processed_independently() {
        let mut store = WearStore::new(WearWeights::default());
        let settings = MonitorSettings::default();
        store.record_launch("old", t0());
        store.record_launch("new", at(290));

        let report = run_tick(&mut store, at(301), &settings);
        assert_eq!(report.expired, vec!["old".to_string()]);
        assert_eq!(report.accrued, vec!["new".to_string()]);
    }

    #[test]
    fn monitor_thread_stops_on_request() {
        let engine = Arc::new(crate::engine::tests::memory_engine(MonitorSettings::default()));
        let handle =
            spawn_session_monitor(Arc::clone(&engine), Duration::from_millis(5)).expect("spawn");
        std::thread::sleep(Duration::from_millis(20));
        handle.stop();
    }
}

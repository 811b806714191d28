//! The usage-wear engine shared by every daemon thread.
//!
//! All reads and writes go through one mutex around the [`WearStore`]. IPC
//! handler threads, the session monitor and the shutdown path each call in
//! independently. Persistence snapshots under that lock and writes after
//! releasing it; a separate persist lock keeps concurrent writers ordered so an
//! older snapshot can never land after a newer one.

use chrono::{DateTime, SecondsFormat, Utc};
use iconwear_protocol::{Notification, WearMetrics};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::DaemonConfig;
use crate::monitor::{run_tick, MonitorSettings};
use crate::notify::NotificationSink;
use crate::persist::{encode_snapshot, load_records, MemoryBackend, WearBackend};
use crate::store::WearStore;

struct StoreCell {
    store: WearStore,
    // Bumped on every mutation; compared against the last persisted value.
    generation: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PersistStatus {
    pub persisted_generation: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub failures: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub backend: String,
    pub tracked_apps: usize,
    pub active_sessions: usize,
    pub tick_interval_secs: u64,
    pub inactivity_timeout_secs: u64,
    pub dirty: bool,
    pub persist: PersistStatus,
}

pub struct WearEngine {
    state: Mutex<StoreCell>,
    persist_state: Mutex<PersistStatus>,
    backend: Box<dyn WearBackend>,
    sink: Arc<dyn NotificationSink>,
    monitor: MonitorSettings,
}

impl WearEngine {
    /// Builds the engine and loads persisted history before any event is handled.
    ///
    /// If the backend cannot be read the engine starts empty and keeps its
    /// state in memory for this run, so a later full rewrite cannot wipe the
    /// history that failed to load.
    pub fn start(
        config: DaemonConfig,
        backend: Box<dyn WearBackend>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let (records, backend) = match load_records(backend.as_ref(), &config.wear) {
            Ok(records) => {
                tracing::info!(
                    backend = %backend.describe(),
                    apps = records.len(),
                    "Loaded persisted wear levels"
                );
                (records, backend)
            }
            Err(err) => {
                tracing::warn!(
                    backend = %backend.describe(),
                    error = %err,
                    "Failed to load wear levels; starting empty with in-memory persistence"
                );
                let fallback: Box<dyn WearBackend> = Box::new(MemoryBackend::default());
                (Default::default(), fallback)
            }
        };

        Self {
            state: Mutex::new(StoreCell {
                store: WearStore::from_records(config.wear, records),
                generation: 0,
            }),
            persist_state: Mutex::new(PersistStatus::default()),
            backend,
            sink,
            monitor: config.monitor,
        }
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        self.monitor
    }

    pub fn on_launch(&self, app_id: &str) {
        self.on_launch_at(app_id, Utc::now());
    }

    pub fn on_launch_at(&self, app_id: &str, now: DateTime<Utc>) {
        {
            let mut cell = self.lock_state();
            let notifications = cell.store.record_launch(app_id, now);
            cell.generation += 1;
            let record = cell.store.get(app_id);
            tracing::info!(
                app_id = %app_id,
                launches = record.launches,
                wear_level = record.wear_level,
                "Launch recorded"
            );
            self.publish_all(&notifications);
        }
        self.persist();
    }

    pub fn tick(&self) {
        self.tick_at(Utc::now());
    }

    pub fn tick_at(&self, now: DateTime<Utc>) {
        let expired = {
            let mut cell = self.lock_state();
            let report = run_tick(&mut cell.store, now, &self.monitor);
            if !report.accrued.is_empty() || !report.expired.is_empty() {
                cell.generation += 1;
            }
            tracing::debug!(
                accrued = report.accrued.len(),
                expired = report.expired.len(),
                changed = report.notifications.len(),
                "Session monitor tick"
            );
            self.publish_all(&report.notifications);
            report.expired.len()
        };

        if expired > 0 {
            self.persist();
        }
    }

    pub fn reset_wear_level(&self, app_id: &str) {
        self.reset_wear_level_at(app_id, Utc::now());
    }

    pub fn reset_wear_level_at(&self, app_id: &str, now: DateTime<Utc>) {
        {
            let mut cell = self.lock_state();
            let notifications = cell.store.reset(app_id, now);
            cell.generation += 1;
            tracing::info!(
                app_id = %app_id,
                reconstructions = cell.store.get(app_id).reconstructions,
                "Wear level reset"
            );
            self.publish_all(&notifications);
        }
        self.persist();
    }

    pub fn get_wear_level(&self, app_id: &str) -> u32 {
        self.lock_state().store.get(app_id).wear_level
    }

    pub fn get_reconstructions(&self, app_id: &str) -> u64 {
        self.lock_state().store.get(app_id).reconstructions
    }

    pub fn get_metrics(&self, app_id: &str) -> WearMetrics {
        self.lock_state().store.get(app_id).metrics(app_id)
    }

    pub fn list_metrics(&self) -> Vec<WearMetrics> {
        let snapshot = self.lock_state().store.snapshot();
        snapshot
            .iter()
            .map(|(app_id, record)| record.metrics(app_id))
            .collect()
    }

    #[cfg(test)]
    pub fn is_active(&self, app_id: &str) -> bool {
        self.lock_state().store.is_active(app_id)
    }

    /// Writes the full snapshot. Failures are logged and leave the state dirty.
    pub fn persist(&self) -> bool {
        let mut status = match self.persist_state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let (snapshot, generation) = {
            let cell = self.lock_state();
            (cell.store.snapshot(), cell.generation)
        };

        let groups = encode_snapshot(&snapshot);
        match self.backend.replace_all(&groups) {
            Ok(()) => {
                status.persisted_generation = generation;
                status.last_success_at =
                    Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
                status.last_error = None;
                tracing::debug!(apps = groups.len(), generation, "Persisted wear snapshot");
                true
            }
            Err(err) => {
                status.failures += 1;
                status.last_error = Some(err.to_string());
                tracing::warn!(
                    error = %err,
                    backend = %self.backend.describe(),
                    "Failed to persist wear snapshot"
                );
                false
            }
        }
    }

    pub fn is_dirty(&self) -> bool {
        let persisted = self.persist_status().persisted_generation;
        self.lock_state().generation > persisted
    }

    /// Final write on shutdown; skipped when nothing changed since the last save.
    pub fn shutdown(&self) {
        if self.is_dirty() {
            if self.persist() {
                tracing::info!("Final wear snapshot persisted");
            }
        } else {
            tracing::debug!("Wear state clean at shutdown; skipping final persist");
        }
    }

    pub fn persist_status(&self) -> PersistStatus {
        match self.persist_state.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn health(&self) -> EngineHealth {
        let persist = self.persist_status();
        let cell = self.lock_state();
        EngineHealth {
            backend: self.backend.describe(),
            tracked_apps: cell.store.record_count(),
            active_sessions: cell.store.session_count(),
            tick_interval_secs: self.monitor.tick_interval_secs,
            inactivity_timeout_secs: self.monitor.inactivity_timeout_secs,
            dirty: cell.generation > persist.persisted_generation,
            persist,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, StoreCell> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Wear state lock poisoned; continuing with last state");
                poisoned.into_inner()
            }
        }
    }

    // Called with the state lock held so notifications for one app stay ordered.
    fn publish_all(&self, notifications: &[Notification]) {
        for notification in notifications {
            self.sink.publish(notification);
        }
    }
}

//! In-memory wear state: per-app records plus the set of active sessions.
//!
//! The store does no locking and no I/O. The engine wraps it in a
//! mutex, and every mutation hands back the notifications it produced so the
//! caller decides when to publish them.

use chrono::{DateTime, SecondsFormat, Utc};
use iconwear_protocol::{Notification, WearMetrics};
use std::collections::{BTreeMap, HashMap};

use crate::wear::WearWeights;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WearRecord {
    pub wear_level: u32,
    pub launches: u64,
    pub active_seconds: u64,
    pub reconstructions: u64,
    pub last_open_time: Option<DateTime<Utc>>,
    pub last_reset_time: Option<DateTime<Utc>>,
}

impl WearRecord {
    pub fn metrics(&self, app_id: &str) -> WearMetrics {
        WearMetrics {
            app_id: app_id.to_string(),
            wear_level: self.wear_level,
            launches: self.launches,
            active_minutes: self.active_seconds / 60,
            reconstructions: self.reconstructions,
            last_open_time: self.last_open_time.map(format_timestamp),
            last_reset_time: self.last_reset_time.map(format_timestamp),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSession {
    pub app_id: String,
    pub opened_at: DateTime<Utc>,
}

pub struct WearStore {
    weights: WearWeights,
    records: HashMap<String, WearRecord>,
    sessions: HashMap<String, ActiveSession>,
}

impl WearStore {
    #[cfg(test)]
    pub fn new(weights: WearWeights) -> Self {
        Self::from_records(weights, BTreeMap::new())
    }

    pub fn from_records(weights: WearWeights, records: BTreeMap<String, WearRecord>) -> Self {
        Self {
            weights,
            records: records.into_iter().collect(),
            sessions: HashMap::new(),
        }
    }

    /// Returns a copy of the record, or the zero record for unknown apps.
    pub fn get(&self, app_id: &str) -> WearRecord {
        self.records.get(app_id).cloned().unwrap_or_default()
    }

    pub fn record_launch(&mut self, app_id: &str, now: DateTime<Utc>) -> Vec<Notification> {
        self.sessions
            .entry(app_id.to_string())
            .or_insert_with(|| ActiveSession {
                app_id: app_id.to_string(),
                opened_at: now,
            });

        let record = self.records.entry(app_id.to_string()).or_default();
        record.launches = record.launches.saturating_add(1);
        record.last_open_time = Some(now);
        self.recompute(app_id).into_iter().collect()
    }

    pub fn accrue_active(&mut self, app_id: &str, delta_seconds: u64) -> Vec<Notification> {
        let record = self.records.entry(app_id.to_string()).or_default();
        record.active_seconds = record.active_seconds.saturating_add(delta_seconds);
        self.recompute(app_id).into_iter().collect()
    }

    /// Zeroes the visible wear while keeping the launch and time history.
    pub fn reset(&mut self, app_id: &str, now: DateTime<Utc>) -> Vec<Notification> {
        let record = self.records.entry(app_id.to_string()).or_default();
        record.wear_level = 0;
        record.reconstructions = record.reconstructions.saturating_add(1);
        record.last_reset_time = Some(now);
        vec![
            Notification::WearLevelChanged {
                app_id: app_id.to_string(),
                new_level: 0,
            },
            Notification::WearLevelReset {
                app_id: app_id.to_string(),
            },
        ]
    }

    pub fn active_sessions(&self) -> Vec<ActiveSession> {
        let mut sessions: Vec<ActiveSession> = self.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.app_id.cmp(&b.app_id));
        sessions
    }

    #[cfg(test)]
    pub fn is_active(&self, app_id: &str) -> bool {
        self.sessions.contains_key(app_id)
    }

    pub fn end_session(&mut self, app_id: &str) -> Option<ActiveSession> {
        self.sessions.remove(app_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn snapshot(&self) -> BTreeMap<String, WearRecord> {
        self.records
            .iter()
            .map(|(app_id, record)| (app_id.clone(), record.clone()))
            .collect()
    }

    fn recompute(&mut self, app_id: &str) -> Option<Notification> {
        let record = self.records.get_mut(app_id)?;
        let level = self.weights.compute(
            i64::try_from(record.launches).unwrap_or(i64::MAX),
            i64::try_from(record.active_seconds).unwrap_or(i64::MAX),
        );
        if level == record.wear_level {
            return None;
        }
        record.wear_level = level;
        Some(Notification::WearLevelChanged {
            app_id: app_id.to_string(),
            new_level: level,
        })
    }
}

pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

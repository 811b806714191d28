//! Persistence adapter between wear records and key-value field groups.
//!
//! Backends store one group per app id, each group a small map of named string
//! fields. Decoding is forgiving: a bad field falls back to its default and a
//! bad group never aborts the load.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::PersistError;
use crate::store::{format_timestamp, WearRecord};
use crate::wear::WearWeights;

pub const FIELD_WEAR_LEVEL: &str = "wearLevel";
pub const FIELD_LAUNCHES: &str = "launches";
pub const FIELD_ACTIVE_SECONDS: &str = "activeTimeSeconds";
pub const FIELD_RECONSTRUCTIONS: &str = "reconstructions";
pub const FIELD_LAST_OPEN: &str = "lastOpenTime";
pub const FIELD_LAST_RESET: &str = "lastResetTime";

/// field name -> raw value
pub type FieldGroup = BTreeMap<String, String>;
/// app id -> fields
pub type FieldGroups = BTreeMap<String, FieldGroup>;

/// Key-value store holding the wear namespace.
///
/// `replace_all` must clear every existing group before writing the new ones,
/// so apps dropped from the snapshot do not linger.
pub trait WearBackend: Send + Sync {
    fn load_groups(&self) -> Result<FieldGroups, PersistError>;
    fn replace_all(&self, groups: &FieldGroups) -> Result<(), PersistError>;
    fn describe(&self) -> String;
}

pub fn encode_record(record: &WearRecord) -> FieldGroup {
    let mut group = FieldGroup::new();
    group.insert(FIELD_WEAR_LEVEL.to_string(), record.wear_level.to_string());
    group.insert(FIELD_LAUNCHES.to_string(), record.launches.to_string());
    group.insert(
        FIELD_ACTIVE_SECONDS.to_string(),
        record.active_seconds.to_string(),
    );
    group.insert(
        FIELD_RECONSTRUCTIONS.to_string(),
        record.reconstructions.to_string(),
    );
    if let Some(value) = record.last_open_time {
        group.insert(FIELD_LAST_OPEN.to_string(), format_timestamp(value));
    }
    if let Some(value) = record.last_reset_time {
        group.insert(FIELD_LAST_RESET.to_string(), format_timestamp(value));
    }
    group
}

pub fn encode_snapshot(snapshot: &BTreeMap<String, WearRecord>) -> FieldGroups {
    snapshot
        .iter()
        .map(|(app_id, record)| (app_id.clone(), encode_record(record)))
        .collect()
}

/// Decodes one group, returning the names of fields that had to be defaulted.
pub fn decode_record(
    group: &FieldGroup,
    weights: &WearWeights,
) -> (WearRecord, Vec<&'static str>) {
    let mut repaired = Vec::new();

    let launches = read_counter(group, FIELD_LAUNCHES, &mut repaired);
    let active_seconds = read_counter(group, FIELD_ACTIVE_SECONDS, &mut repaired);
    let reconstructions = read_counter(group, FIELD_RECONSTRUCTIONS, &mut repaired);
    let last_open_time = read_timestamp(group, FIELD_LAST_OPEN, &mut repaired);
    let last_reset_time = read_timestamp(group, FIELD_LAST_RESET, &mut repaired);

    let wear_level = match group
        .get(FIELD_WEAR_LEVEL)
        .and_then(|raw| raw.trim().parse::<i64>().ok())
    {
        Some(level) if level >= 0 => u32::try_from(level)
            .unwrap_or(weights.max_wear)
            .min(weights.max_wear),
        _ => {
            repaired.push(FIELD_WEAR_LEVEL);
            weights.compute(
                i64::try_from(launches).unwrap_or(i64::MAX),
                i64::try_from(active_seconds).unwrap_or(i64::MAX),
            )
        }
    };

    let record = WearRecord {
        wear_level,
        launches,
        active_seconds,
        reconstructions,
        last_open_time,
        last_reset_time,
    };
    (record, repaired)
}

/// Reads every record from the backend, repairing malformed fields as it goes.
pub fn load_records(
    backend: &dyn WearBackend,
    weights: &WearWeights,
) -> Result<BTreeMap<String, WearRecord>, PersistError> {
    let groups = backend.load_groups()?;
    let mut records = BTreeMap::new();

    for (app_id, group) in groups {
        if app_id.trim().is_empty() {
            tracing::warn!("Skipping persisted wear group with empty app id");
            continue;
        }
        let (record, repaired) = decode_record(&group, weights);
        if !repaired.is_empty() {
            tracing::warn!(
                app_id = %app_id,
                fields = ?repaired,
                "Repaired malformed persisted wear fields"
            );
        }
        records.insert(app_id, record);
    }

    Ok(records)
}

fn read_counter(
    group: &FieldGroup,
    field: &'static str,
    repaired: &mut Vec<&'static str>,
) -> u64 {
    match group.get(field) {
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(value) => value,
            Err(_) => {
                repaired.push(field);
                0
            }
        },
        None => {
            repaired.push(field);
            0
        }
    }
}

fn read_timestamp(
    group: &FieldGroup,
    field: &'static str,
    repaired: &mut Vec<&'static str>,
) -> Option<DateTime<Utc>> {
    let raw = group.get(field)?;
    match DateTime::parse_from_rfc3339(raw.trim()) {
        Ok(value) => Some(value.with_timezone(&Utc)),
        Err(_) => {
            repaired.push(field);
            None
        }
    }
}

/// Process-local backend. Used when the on-disk store cannot be read at
/// startup, and by tests.
#[derive(Default)]
pub struct MemoryBackend {
    groups: Mutex<FieldGroups>,
    failing: Mutex<bool>,
}

impl MemoryBackend {
    #[cfg(test)]
    pub fn with_groups(groups: FieldGroups) -> Self {
        Self {
            groups: Mutex::new(groups),
            failing: Mutex::new(false),
        }
    }

    #[cfg(test)]
    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut flag) = self.failing.lock() {
            *flag = failing;
        }
    }

    #[cfg(test)]
    pub fn groups(&self) -> FieldGroups {
        self.groups
            .lock()
            .map(|groups| groups.clone())
            .unwrap_or_default()
    }

    fn check_available(&self) -> Result<(), PersistError> {
        match self.failing.lock() {
            Ok(flag) if *flag => Err(PersistError::Unavailable(
                "memory backend marked failing".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

impl WearBackend for MemoryBackend {
    fn load_groups(&self) -> Result<FieldGroups, PersistError> {
        self.check_available()?;
        self.groups
            .lock()
            .map(|groups| groups.clone())
            .map_err(|_| PersistError::Unavailable("memory backend poisoned".to_string()))
    }

    fn replace_all(&self, groups: &FieldGroups) -> Result<(), PersistError> {
        self.check_available()?;
        let mut stored = self
            .groups
            .lock()
            .map_err(|_| PersistError::Unavailable("memory backend poisoned".to_string()))?;
        stored.clear();
        stored.extend(groups.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

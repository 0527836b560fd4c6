//! Persisted aggregates of earlier runs.
//!
//! The history file is a JSON array of versioned aggregates. Re-running a
//! period appends a new version instead of overwriting the old one, so a
//! published report can always be traced back to the numbers it used.

use crate::error::Result;
use crate::models::PeriodAggregate;
use crate::period::Period;
use crate::report::write_atomically;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

/// One stored version of a unit's aggregate for one period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub version: u32,
    pub recorded_at: DateTime<Utc>,
    pub aggregate: PeriodAggregate,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateHistory {
    entries: Vec<HistoryEntry>,
    /// Stored entries this version cannot read; written back untouched.
    unreadable: Vec<Value>,
}

impl AggregateHistory {
    /// Load a history file. A missing file is an empty history; entries
    /// that do not parse are skipped with a warning but kept for `save`.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No history at {}, starting empty", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let values: Vec<Value> = serde_json::from_str(&content)?;

        let mut entries = Vec::with_capacity(values.len());
        let mut unreadable = Vec::new();
        for (index, value) in values.into_iter().enumerate() {
            match HistoryEntry::deserialize(&value) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    warn!("Skipping history entry {} in {}: {}", index, path.display(), e);
                    unreadable.push(value);
                }
            }
        }

        debug!("Loaded {} history entries from {}", entries.len(), path.display());
        Ok(Self { entries, unreadable })
    }

    /// Write every entry back, unreadable ones included.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut values = Vec::with_capacity(self.entries.len() + self.unreadable.len());
        for entry in &self.entries {
            values.push(serde_json::to_value(entry)?);
        }
        values.extend(self.unreadable.iter().cloned());

        let json = serde_json::to_string_pretty(&values)?;
        write_atomically(path, json.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries kept from the file but not understood.
    pub fn unreadable(&self) -> usize {
        self.unreadable.len()
    }

    /// Append `aggregate` as the next version for its unit and period.
    pub fn record(&mut self, aggregate: PeriodAggregate, recorded_at: DateTime<Utc>) -> u32 {
        let version = self
            .versions(&aggregate.geo_unit_id, &aggregate.period)
            .last()
            .map_or(1, |entry| entry.version + 1);

        self.entries.push(HistoryEntry {
            version,
            recorded_at,
            aggregate,
        });
        version
    }

    /// All versions for a unit and period, oldest first.
    pub fn versions(&self, geo_unit_id: &str, period: &Period) -> Vec<&HistoryEntry> {
        let mut found: Vec<&HistoryEntry> = self
            .entries
            .iter()
            .filter(|e| e.aggregate.geo_unit_id == geo_unit_id && e.aggregate.period == *period)
            .collect();
        found.sort_by_key(|e| e.version);
        found
    }

    pub fn latest(&self, geo_unit_id: &str, period: &Period) -> Option<&PeriodAggregate> {
        self.versions(geo_unit_id, period)
            .last()
            .map(|entry| &entry.aggregate)
    }

    /// Latest version of every aggregate of `before`'s granularity that
    /// precedes it, in chronological order.
    pub fn latest_before(&self, before: &Period) -> Vec<&PeriodAggregate> {
        let mut latest: BTreeMap<(Period, &str), &HistoryEntry> = BTreeMap::new();

        for entry in &self.entries {
            let period = entry.aggregate.period;
            if period.granularity() != before.granularity() || period >= *before {
                continue;
            }
            let key = (period, entry.aggregate.geo_unit_id.as_str());
            match latest.get(&key) {
                Some(existing) if existing.version >= entry.version => {}
                _ => {
                    latest.insert(key, entry);
                }
            }
        }

        latest.into_values().map(|entry| &entry.aggregate).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geography::tests::sample_index;

    fn aggregate(id: &str, period: Period, malaria: u64) -> PeriodAggregate {
        let geo = sample_index();
        let mut aggregate = PeriodAggregate::empty(geo.get(id).unwrap(), period);
        aggregate.total_records = malaria;
        aggregate.condition_counts.insert("malaria".to_string(), malaria);
        aggregate
    }

    fn month(m: u32) -> Period {
        Period::month(2024, m).unwrap()
    }

    #[test]
    fn test_rerun_appends_version() {
        let mut history = AggregateHistory::default();
        let now = Utc::now();

        assert_eq!(history.record(aggregate("bissau", month(3), 10), now), 1);
        assert_eq!(history.record(aggregate("bissau", month(3), 12), now), 2);
        assert_eq!(history.record(aggregate("gabu", month(3), 1), now), 1);

        assert_eq!(history.len(), 3);
        assert_eq!(history.versions("bissau", &month(3)).len(), 2);
        assert_eq!(history.latest("bissau", &month(3)).unwrap().total_records, 12);
        assert!(history.latest("bissau", &month(4)).is_none());
    }

    #[test]
    fn test_latest_before_is_chronological() {
        let mut history = AggregateHistory::default();
        let now = Utc::now();
        history.record(aggregate("bissau", month(2), 20), now);
        history.record(aggregate("bissau", month(1), 10), now);
        history.record(aggregate("bissau", month(2), 25), now);
        history.record(aggregate("bissau", month(3), 30), now);
        history.record(aggregate("bissau", Period::quarter(2023, 4).unwrap(), 99), now);

        let earlier = history.latest_before(&month(3));
        let counts: Vec<u64> = earlier.iter().map(|a| a.total_records).collect();
        assert_eq!(counts, vec![10, 25]);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");

        let mut history = AggregateHistory::default();
        history.record(aggregate("bandim", month(1), 3), Utc::now());
        history.save(&path).unwrap();

        let loaded = AggregateHistory::load(&path).unwrap();
        assert_eq!(loaded, history);
    }

    #[test]
    fn test_load_skips_bad_entries_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        assert!(AggregateHistory::load(&path).unwrap().is_empty());

        let mut history = AggregateHistory::default();
        history.record(aggregate("bandim", month(1), 3), Utc::now());
        history.save(&path).unwrap();

        let mut values: Vec<Value> = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        values.push(serde_json::json!({"version": "not a number"}));
        std::fs::write(&path, serde_json::to_string(&values).unwrap()).unwrap();

        let loaded = AggregateHistory::load(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.unreadable(), 1);
    }

    #[test]
    fn test_save_keeps_unreadable_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");

        let mut history = AggregateHistory::default();
        history.record(aggregate("bandim", month(1), 3), Utc::now());
        history.save(&path).unwrap();

        let foreign = serde_json::json!({
            "version": 1,
            "recorded_at": "2024-02-01T00:00:00Z",
            "aggregate": {"unit": "bandim", "cases": 7}
        });
        let mut values: Vec<Value> = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        values.push(foreign.clone());
        std::fs::write(&path, serde_json::to_string(&values).unwrap()).unwrap();

        let mut loaded = AggregateHistory::load(&path).unwrap();
        loaded.record(aggregate("bandim", month(2), 4), Utc::now());
        loaded.save(&path).unwrap();

        let saved: Vec<Value> = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved.len(), 3);
        assert!(saved.contains(&foreign));

        let reloaded = AggregateHistory::load(&path).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.unreadable(), 1);
    }
}

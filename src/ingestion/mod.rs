//! Record ingestion.
//!
//! Record stores read raw consultation rows from wherever the consultation
//! system keeps them and normalize them into [`HealthRecord`]s. Malformed rows
//! are logged and skipped; rows whose geography reference does not resolve
//! pass through untouched and are routed to the unclassified bucket later.

pub mod http;
pub mod jsonl;

pub use http::HttpRecordStore;
pub use jsonl::JsonlRecordStore;

use crate::error::{EpiError, Result};
use crate::models::{normalize_condition_code, CaseSeverity, Gender, HealthRecord};
use crate::period::Period;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Oldest plausible patient age.
const MAX_AGE: i64 = 130;

/// Which geography references a fetch should return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeoScope {
    /// Every row.
    All,
    /// Rows whose reference is one of these unit ids.
    Within(BTreeSet<String>),
    /// Rows whose reference is none of these ids, including unresolvable ones.
    Outside(BTreeSet<String>),
}

impl GeoScope {
    pub fn matches(&self, geo_ref: &str) -> bool {
        match self {
            GeoScope::All => true,
            GeoScope::Within(ids) => ids.contains(geo_ref),
            GeoScope::Outside(ids) => !ids.contains(geo_ref),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            GeoScope::All => "all".to_string(),
            GeoScope::Within(ids) => format!("within {} units", ids.len()),
            GeoScope::Outside(ids) => format!("outside {} units", ids.len()),
        }
    }
}

/// A loosely-typed row as the consultation system exports it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(default, alias = "region", alias = "geo_ref")]
    pub patient_region_ref: Option<String>,
    #[serde(default, alias = "condition")]
    pub condition_code: Option<String>,
    #[serde(default)]
    pub age: Option<i64>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
}

/// Why a row could not be normalized.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedRecord {
    #[error("missing condition code")]
    MissingCondition,
    #[error("missing timestamp")]
    MissingTimestamp,
    #[error("unparseable timestamp '{0}'")]
    BadTimestamp(String),
    #[error("impossible age {0}")]
    ImpossibleAge(i64),
    #[error("unreadable row: {0}")]
    Unreadable(String),
}

impl RawRecord {
    /// The trimmed geography reference, empty when absent.
    pub fn geo_ref(&self) -> &str {
        self.patient_region_ref
            .as_deref()
            .map(str::trim)
            .unwrap_or("")
    }

    pub fn normalize(&self) -> std::result::Result<HealthRecord, MalformedRecord> {
        let condition_code = self
            .condition_code
            .as_deref()
            .map(normalize_condition_code)
            .filter(|c| !c.is_empty())
            .ok_or(MalformedRecord::MissingCondition)?;

        let raw_ts = self
            .timestamp
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(MalformedRecord::MissingTimestamp)?;
        let timestamp =
            parse_timestamp(raw_ts).ok_or_else(|| MalformedRecord::BadTimestamp(raw_ts.to_string()))?;

        let age = match self.age {
            None => None,
            Some(age) if (0..=MAX_AGE).contains(&age) => Some(age as u32),
            Some(age) => return Err(MalformedRecord::ImpossibleAge(age)),
        };

        Ok(HealthRecord {
            patient_region_ref: self.geo_ref().to_string(),
            condition_code,
            age,
            gender: self
                .gender
                .as_deref()
                .map(Gender::from)
                .unwrap_or(Gender::Unknown),
            timestamp,
            severity: self.severity.as_deref().and_then(CaseSeverity::parse),
        })
    }
}

impl From<&HealthRecord> for RawRecord {
    fn from(record: &HealthRecord) -> Self {
        Self {
            patient_region_ref: Some(record.patient_region_ref.clone()),
            condition_code: Some(record.condition_code.clone()),
            age: record.age.map(i64::from),
            gender: Some(
                serde_json::to_value(record.gender)
                    .ok()
                    .and_then(|v| v.as_str().map(String::from))
                    .unwrap_or_default(),
            ),
            timestamp: Some(record.timestamp.to_rfc3339()),
            severity: record.severity.and_then(|s| {
                serde_json::to_value(s)
                    .ok()
                    .and_then(|v| v.as_str().map(String::from))
            }),
        }
    }
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS` (UTC) and bare dates.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// A row as read from a store, before normalization.
#[derive(Debug, Clone)]
pub enum SourceRow {
    Parsed(RawRecord),
    /// The row could not even be decoded; its geography is unknown.
    Unreadable(String),
}

/// Counters describing what ingestion and aggregation saw.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionSummary {
    /// Normalized records returned by the store.
    pub fetched: u64,
    /// Rows skipped because they could not be normalized.
    pub malformed: u64,
    /// Records routed to the unclassified bucket.
    pub unclassified: u64,
    /// Records whose timestamp fell outside the requested period.
    pub out_of_period: u64,
    /// Records resolving to units outside the requested scope.
    pub out_of_scope: u64,
}

impl IngestionSummary {
    pub fn absorb(&mut self, other: &IngestionSummary) {
        self.fetched += other.fetched;
        self.malformed += other.malformed;
        self.unclassified += other.unclassified;
        self.out_of_period += other.out_of_period;
        self.out_of_scope += other.out_of_scope;
    }
}

/// A finite, restartable set of records ordered by timestamp.
#[derive(Debug, Clone)]
pub struct RecordBatch {
    records: Arc<[HealthRecord]>,
    stats: IngestionSummary,
}

impl RecordBatch {
    pub fn new(mut records: Vec<HealthRecord>, stats: IngestionSummary) -> Self {
        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Self {
            records: records.into(),
            stats,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), IngestionSummary::default())
    }

    /// Iterate the records; may be called any number of times.
    pub fn iter(&self) -> std::slice::Iter<'_, HealthRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn stats(&self) -> &IngestionSummary {
        &self.stats
    }
}

impl<'a> IntoIterator for &'a RecordBatch {
    type Item = &'a HealthRecord;
    type IntoIter = std::slice::Iter<'a, HealthRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Keep the rows of `period` and `scope`, normalizing as we go.
pub fn select_rows<I>(rows: I, period: &Period, scope: &GeoScope, source: &str) -> RecordBatch
where
    I: IntoIterator<Item = SourceRow>,
{
    let mut stats = IngestionSummary::default();
    let mut records = Vec::new();

    for row in rows {
        match row {
            SourceRow::Unreadable(reason) => {
                if scope.matches("") {
                    stats.malformed += 1;
                    warn!("Skipping unreadable row from {}: {}", source, reason);
                }
            }
            SourceRow::Parsed(raw) => {
                if !scope.matches(raw.geo_ref()) {
                    continue;
                }
                match raw.normalize() {
                    Ok(record) => {
                        if period.contains(&record.timestamp) {
                            records.push(record);
                        }
                    }
                    Err(reason) => {
                        stats.malformed += 1;
                        warn!(
                            "Skipping malformed record from {} (ref '{}'): {}",
                            source,
                            raw.geo_ref(),
                            reason
                        );
                    }
                }
            }
        }
    }

    stats.fetched = records.len() as u64;
    RecordBatch::new(records, stats)
}

/// A queryable source of health records.
pub trait RecordStore: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Records of `period` whose geography reference matches `scope`.
    fn fetch(
        &self,
        period: &Period,
        scope: &GeoScope,
    ) -> impl Future<Output = Result<RecordBatch>> + Send;
}

/// In-memory store, used for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordStore {
    rows: Vec<RawRecord>,
}

impl MemoryRecordStore {
    pub fn new(rows: Vec<RawRecord>) -> Self {
        Self { rows }
    }

    pub fn from_records(records: &[HealthRecord]) -> Self {
        Self::new(records.iter().map(RawRecord::from).collect())
    }
}

impl RecordStore for MemoryRecordStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn fetch(&self, period: &Period, scope: &GeoScope) -> Result<RecordBatch> {
        let rows = self.rows.iter().cloned().map(SourceRow::Parsed);
        Ok(select_rows(rows, period, scope, self.name()))
    }
}

/// Wraps a store with a fetch timeout.
pub struct Ingestor<S> {
    store: S,
    timeout: Duration,
}

impl<S: RecordStore> Ingestor<S> {
    pub fn new(store: S, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Fetch, failing with `IngestionTimeout` instead of hanging.
    pub async fn fetch(&self, period: &Period, scope: &GeoScope) -> Result<RecordBatch> {
        debug!(
            "Fetching {} from {} store ({})",
            period,
            self.store.name(),
            scope.describe()
        );

        match tokio::time::timeout(self.timeout, self.store.fetch(period, scope)).await {
            Ok(result) => result,
            Err(_) => Err(EpiError::IngestionTimeout(self.timeout)),
        }
    }
}

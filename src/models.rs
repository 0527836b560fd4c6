//! Data models for the epidemiological core.
//!
//! This module contains the geography nodes, the normalized health record,
//! the derived aggregates and the anomaly/report structures used throughout
//! the pipeline.

use crate::ingestion::IngestionSummary;
use crate::period::{Period, PeriodRange};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Id of the catch-all aggregate for unresolvable geography references.
pub const UNCLASSIFIED_ID: &str = "unclassified";

/// Level of a node in the geography tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeoKind {
    /// Administrative region (Bissau, Bafatá, Gabú, ...)
    Region,
    /// City or sector within a region
    City,
    /// Tabanca or neighbourhood, the smallest division
    Locality,
}

impl GeoKind {
    /// The kind a unit of this kind must have as parent.
    pub fn parent_kind(&self) -> Option<GeoKind> {
        match self {
            GeoKind::Region => None,
            GeoKind::City => Some(GeoKind::Region),
            GeoKind::Locality => Some(GeoKind::City),
        }
    }

    /// Sort rank for reports: most specific level first.
    pub fn specificity_rank(kind: Option<GeoKind>) -> u8 {
        match kind {
            Some(GeoKind::Locality) => 0,
            Some(GeoKind::City) => 1,
            Some(GeoKind::Region) => 2,
            None => 3,
        }
    }
}

impl fmt::Display for GeoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeoKind::Region => write!(f, "Region"),
            GeoKind::City => write!(f, "City"),
            GeoKind::Locality => write!(f, "Locality"),
        }
    }
}

/// A node of the Region → City → Locality hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoUnit {
    /// Stable identifier referenced by health records.
    pub id: String,
    /// Level in the hierarchy.
    pub kind: GeoKind,
    /// Id of the parent unit; absent for regions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Display name.
    pub name: String,
    /// Estimated resident population.
    #[serde(default)]
    pub estimated_population: u64,
    /// Administrative code (e.g. region code `BS`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Patient gender as captured by the consultation system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    Other,
    Unknown,
}

impl From<&str> for Gender {
    fn from(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "m" | "male" | "masculino" => Gender::Male,
            "f" | "female" | "feminino" => Gender::Female,
            "o" | "other" | "outro" => Gender::Other,
            _ => Gender::Unknown,
        }
    }
}

/// Clinical severity of a single case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseSeverity {
    Mild,
    Moderate,
    Severe,
    Critical,
}

impl CaseSeverity {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "mild" | "leve" | "low" => Some(CaseSeverity::Mild),
            "moderate" | "moderada" | "medium" => Some(CaseSeverity::Moderate),
            "severe" | "grave" | "high" => Some(CaseSeverity::Severe),
            "critical" | "critica" | "crítica" => Some(CaseSeverity::Critical),
            _ => None,
        }
    }
}

/// A normalized consultation record. Read-only input to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    /// Geography id of the patient's residence (any level).
    pub patient_region_ref: String,
    /// Normalized condition code, see [`normalize_condition_code`].
    pub condition_code: String,
    /// Age in years, when known.
    pub age: Option<u32>,
    pub gender: Gender,
    pub timestamp: DateTime<Utc>,
    pub severity: Option<CaseSeverity>,
}

/// Normalize a condition code: trimmed, lowercase, separators folded to `_`.
pub fn normalize_condition_code(raw: &str) -> String {
    raw.split(|c: char| c.is_whitespace() || c == '-' || c == '_')
        .filter(|part| !part.is_empty())
        .map(|part| part.to_lowercase())
        .collect::<Vec<_>>()
        .join("_")
}

/// Fixed age bands. The boundaries are policy, not derived from data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AgeBand {
    Under5,
    From5To14,
    From15To49,
    From50To64,
    From65,
    Unknown,
}

impl AgeBand {
    pub fn for_age(age: Option<u32>) -> Self {
        match age {
            None => AgeBand::Unknown,
            Some(0..=4) => AgeBand::Under5,
            Some(5..=14) => AgeBand::From5To14,
            Some(15..=49) => AgeBand::From15To49,
            Some(50..=64) => AgeBand::From50To64,
            Some(_) => AgeBand::From65,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AgeBand::Under5 => "0-4",
            AgeBand::From5To14 => "5-14",
            AgeBand::From15To49 => "15-49",
            AgeBand::From50To64 => "50-64",
            AgeBand::From65 => "65+",
            AgeBand::Unknown => "unknown",
        }
    }
}

/// Case counts per age band.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgeBandCounts {
    pub age_0_4: u64,
    pub age_5_14: u64,
    pub age_15_49: u64,
    pub age_50_64: u64,
    pub age_65_plus: u64,
    pub unknown: u64,
}

impl AgeBandCounts {
    fn slot(&mut self, band: AgeBand) -> &mut u64 {
        match band {
            AgeBand::Under5 => &mut self.age_0_4,
            AgeBand::From5To14 => &mut self.age_5_14,
            AgeBand::From15To49 => &mut self.age_15_49,
            AgeBand::From50To64 => &mut self.age_50_64,
            AgeBand::From65 => &mut self.age_65_plus,
            AgeBand::Unknown => &mut self.unknown,
        }
    }

    pub fn get(&self, band: AgeBand) -> u64 {
        match band {
            AgeBand::Under5 => self.age_0_4,
            AgeBand::From5To14 => self.age_5_14,
            AgeBand::From15To49 => self.age_15_49,
            AgeBand::From50To64 => self.age_50_64,
            AgeBand::From65 => self.age_65_plus,
            AgeBand::Unknown => self.unknown,
        }
    }

    pub fn total(&self) -> u64 {
        self.age_0_4 + self.age_5_14 + self.age_15_49 + self.age_50_64 + self.age_65_plus + self.unknown
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenderCounts {
    pub male: u64,
    pub female: u64,
    pub other: u64,
    pub unknown: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub mild: u64,
    pub moderate: u64,
    pub severe: u64,
    pub critical: u64,
    pub unspecified: u64,
}

/// Demographic breakdown of the records in one aggregate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemographicBreakdown {
    pub age_bands: AgeBandCounts,
    pub gender: GenderCounts,
    pub severity: SeverityCounts,
}

impl DemographicBreakdown {
    pub fn record(&mut self, record: &HealthRecord) {
        *self.age_bands.slot(AgeBand::for_age(record.age)) += 1;

        match record.gender {
            Gender::Male => self.gender.male += 1,
            Gender::Female => self.gender.female += 1,
            Gender::Other => self.gender.other += 1,
            Gender::Unknown => self.gender.unknown += 1,
        }

        match record.severity {
            Some(CaseSeverity::Mild) => self.severity.mild += 1,
            Some(CaseSeverity::Moderate) => self.severity.moderate += 1,
            Some(CaseSeverity::Severe) => self.severity.severe += 1,
            Some(CaseSeverity::Critical) => self.severity.critical += 1,
            None => self.severity.unspecified += 1,
        }
    }

    pub fn absorb(&mut self, other: &DemographicBreakdown) {
        let a = &mut self.age_bands;
        let b = &other.age_bands;
        a.age_0_4 += b.age_0_4;
        a.age_5_14 += b.age_5_14;
        a.age_15_49 += b.age_15_49;
        a.age_50_64 += b.age_50_64;
        a.age_65_plus += b.age_65_plus;
        a.unknown += b.unknown;

        self.gender.male += other.gender.male;
        self.gender.female += other.gender.female;
        self.gender.other += other.gender.other;
        self.gender.unknown += other.gender.unknown;

        self.severity.mild += other.severity.mild;
        self.severity.moderate += other.severity.moderate;
        self.severity.severe += other.severity.severe;
        self.severity.critical += other.severity.critical;
        self.severity.unspecified += other.severity.unspecified;
    }
}

/// One entry of a top-N condition list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionCount {
    pub condition_code: String,
    pub count: u64,
}

/// Counts for one geographic unit over one period.
///
/// Only ordered maps are used so that identical input serializes to
/// identical bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodAggregate {
    pub geo_unit_id: String,
    /// Level of the unit; absent for the unclassified bucket.
    pub geo_kind: Option<GeoKind>,
    pub geo_name: String,
    /// Estimated population of the unit, 0 when unknown.
    pub population: u64,
    pub period: Period,
    pub total_records: u64,
    pub condition_counts: BTreeMap<String, u64>,
    pub top_conditions: Vec<ConditionCount>,
    pub demographic_breakdown: DemographicBreakdown,
}

impl PeriodAggregate {
    /// A zeroed aggregate for `unit`.
    pub fn empty(unit: &GeoUnit, period: Period) -> Self {
        Self {
            geo_unit_id: unit.id.clone(),
            geo_kind: Some(unit.kind),
            geo_name: unit.name.clone(),
            population: unit.estimated_population,
            period,
            total_records: 0,
            condition_counts: BTreeMap::new(),
            top_conditions: Vec::new(),
            demographic_breakdown: DemographicBreakdown::default(),
        }
    }

    /// A zeroed aggregate for records with no resolvable geography.
    pub fn unclassified(period: Period) -> Self {
        Self {
            geo_unit_id: UNCLASSIFIED_ID.to_string(),
            geo_kind: None,
            geo_name: "Unclassified".to_string(),
            population: 0,
            period,
            total_records: 0,
            condition_counts: BTreeMap::new(),
            top_conditions: Vec::new(),
            demographic_breakdown: DemographicBreakdown::default(),
        }
    }

    pub fn is_unclassified(&self) -> bool {
        self.geo_kind.is_none()
    }

    /// Count one record.
    pub fn record(&mut self, record: &HealthRecord) {
        self.total_records += 1;
        *self
            .condition_counts
            .entry(record.condition_code.clone())
            .or_insert(0) += 1;
        self.demographic_breakdown.record(record);
    }

    /// Add another aggregate's counts into this one. Top-N must be
    /// recomputed afterwards.
    pub fn absorb(&mut self, other: &PeriodAggregate) {
        self.total_records += other.total_records;
        for (code, count) in &other.condition_counts {
            *self.condition_counts.entry(code.clone()).or_insert(0) += count;
        }
        self.demographic_breakdown
            .absorb(&other.demographic_breakdown);
    }

    pub fn count_for(&self, condition_code: &str) -> u64 {
        self.condition_counts
            .get(condition_code)
            .copied()
            .unwrap_or(0)
    }

    /// Records per 1000 inhabitants, when the population is known.
    pub fn incidence_per_1000(&self) -> Option<f64> {
        if self.population == 0 {
            return None;
        }
        Some(self.total_records as f64 * 1000.0 / self.population as f64)
    }
}

/// Outbreak severity tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeverityFlag {
    /// Above the watch band (2σ by default)
    Watch,
    /// Above the alert band (3σ by default)
    Alert,
    /// At or above a multiple of the baseline mean (5× by default)
    Critical,
}

impl fmt::Display for SeverityFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeverityFlag::Watch => write!(f, "watch"),
            SeverityFlag::Alert => write!(f, "alert"),
            SeverityFlag::Critical => write!(f, "critical"),
        }
    }
}

impl SeverityFlag {
    /// Returns an emoji representation of the flag.
    pub fn emoji(&self) -> &'static str {
        match self {
            SeverityFlag::Watch => "🟡",
            SeverityFlag::Alert => "🟠",
            SeverityFlag::Critical => "🔴",
        }
    }
}

/// A flagged condition count for one unit and period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub geo_unit_id: String,
    pub geo_kind: Option<GeoKind>,
    pub geo_name: String,
    pub condition_code: String,
    pub period: Period,
    pub observed_count: u64,
    pub baseline_mean: f64,
    pub baseline_stddev: f64,
    /// Standard score; absent when the baseline has no spread.
    pub z_score: Option<f64>,
    pub severity_flag: SeverityFlag,
}

/// Informational status: not enough history to judge a count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryGap {
    pub geo_unit_id: String,
    pub geo_kind: Option<GeoKind>,
    pub geo_name: String,
    pub condition_code: String,
    pub period: Period,
    pub periods_available: usize,
    pub periods_required: usize,
}

/// Summary of anomalies found during a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnomalySummary {
    pub total: usize,
    pub critical: usize,
    pub alert: usize,
    pub watch: usize,
    /// Anomalies grouped by condition.
    pub by_condition: BTreeMap<String, usize>,
}

impl AnomalySummary {
    pub fn from_anomalies(anomalies: &[Anomaly]) -> Self {
        let mut summary = Self {
            total: anomalies.len(),
            ..Self::default()
        };

        for anomaly in anomalies {
            match anomaly.severity_flag {
                SeverityFlag::Critical => summary.critical += 1,
                SeverityFlag::Alert => summary.alert += 1,
                SeverityFlag::Watch => summary.watch += 1,
            }

            *summary
                .by_condition
                .entry(anomaly.condition_code.clone())
                .or_insert(0) += 1;
        }

        summary
    }

    /// Highest flag present, if any.
    pub fn highest(&self) -> Option<SeverityFlag> {
        if self.critical > 0 {
            Some(SeverityFlag::Critical)
        } else if self.alert > 0 {
            Some(SeverityFlag::Alert)
        } else if self.watch > 0 {
            Some(SeverityFlag::Watch)
        } else {
            None
        }
    }
}

/// The complete, immutable report artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpidemiologicalReport {
    /// `<title-slug>-<period-range>-v<version>`
    pub id: String,
    pub version: u32,
    pub title: String,
    pub period_range: PeriodRange,
    pub included_geo_units: Vec<GeoUnit>,
    pub aggregates: Vec<PeriodAggregate>,
    pub anomalies: Vec<Anomaly>,
    pub insufficient_history: Vec<HistoryGap>,
    /// Unclassified bucket, one per period.
    pub unclassified: Vec<PeriodAggregate>,
    pub summary: AnomalySummary,
    pub ingestion: IngestionSummary,
    pub generated_at: DateTime<Utc>,
    pub generated_by: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(condition: &str, age: Option<u32>, gender: Gender) -> HealthRecord {
        HealthRecord {
            patient_region_ref: "bissau".to_string(),
            condition_code: condition.to_string(),
            age,
            gender,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 10, 8, 0, 0).unwrap(),
            severity: Some(CaseSeverity::Moderate),
        }
    }

    #[test]
    fn test_normalize_condition_code() {
        assert_eq!(normalize_condition_code("  Malaria "), "malaria");
        assert_eq!(normalize_condition_code("Febre Amarela"), "febre_amarela");
        assert_eq!(normalize_condition_code("COVID-19"), "covid_19");
        assert_eq!(normalize_condition_code("   "), "");
    }

    #[test]
    fn test_age_band_boundaries() {
        assert_eq!(AgeBand::for_age(Some(0)), AgeBand::Under5);
        assert_eq!(AgeBand::for_age(Some(4)), AgeBand::Under5);
        assert_eq!(AgeBand::for_age(Some(5)), AgeBand::From5To14);
        assert_eq!(AgeBand::for_age(Some(14)), AgeBand::From5To14);
        assert_eq!(AgeBand::for_age(Some(15)), AgeBand::From15To49);
        assert_eq!(AgeBand::for_age(Some(49)), AgeBand::From15To49);
        assert_eq!(AgeBand::for_age(Some(50)), AgeBand::From50To64);
        assert_eq!(AgeBand::for_age(Some(64)), AgeBand::From50To64);
        assert_eq!(AgeBand::for_age(Some(65)), AgeBand::From65);
        assert_eq!(AgeBand::for_age(None), AgeBand::Unknown);
    }

    #[test]
    fn test_gender_from_source_codes() {
        assert_eq!(Gender::from("M"), Gender::Male);
        assert_eq!(Gender::from("f"), Gender::Female);
        assert_eq!(Gender::from("O"), Gender::Other);
        assert_eq!(Gender::from("NI"), Gender::Unknown);
    }

    #[test]
    fn test_aggregate_record_and_absorb() {
        let unit = GeoUnit {
            id: "bissau".to_string(),
            kind: GeoKind::Region,
            parent: None,
            name: "Bissau".to_string(),
            estimated_population: 2000,
            code: Some("BS".to_string()),
        };
        let period = Period::month(2024, 3).unwrap();

        let mut a = PeriodAggregate::empty(&unit, period);
        a.record(&record("malaria", Some(3), Gender::Female));
        a.record(&record("malaria", None, Gender::Male));

        let mut b = PeriodAggregate::empty(&unit, period);
        b.record(&record("dengue", Some(70), Gender::Unknown));

        a.absorb(&b);
        assert_eq!(a.total_records, 3);
        assert_eq!(a.count_for("malaria"), 2);
        assert_eq!(a.count_for("dengue"), 1);
        assert_eq!(a.count_for("cholera"), 0);
        assert_eq!(a.demographic_breakdown.age_bands.age_0_4, 1);
        assert_eq!(a.demographic_breakdown.age_bands.age_65_plus, 1);
        assert_eq!(a.demographic_breakdown.age_bands.unknown, 1);
        assert_eq!(a.demographic_breakdown.age_bands.total(), 3);
        assert_eq!(a.demographic_breakdown.severity.moderate, 3);
        assert_eq!(a.incidence_per_1000(), Some(1.5));
    }

    #[test]
    fn test_specificity_rank_orders_locality_first() {
        assert!(
            GeoKind::specificity_rank(Some(GeoKind::Locality))
                < GeoKind::specificity_rank(Some(GeoKind::City))
        );
        assert!(
            GeoKind::specificity_rank(Some(GeoKind::Region)) < GeoKind::specificity_rank(None)
        );
    }

    #[test]
    fn test_anomaly_summary() {
        let period = Period::month(2024, 3).unwrap();
        let make = |code: &str, flag: SeverityFlag| Anomaly {
            geo_unit_id: "bissau".to_string(),
            geo_kind: Some(GeoKind::Region),
            geo_name: "Bissau".to_string(),
            condition_code: code.to_string(),
            period,
            observed_count: 10,
            baseline_mean: 2.0,
            baseline_stddev: 1.0,
            z_score: Some(8.0),
            severity_flag: flag,
        };
        let anomalies = vec![
            make("malaria", SeverityFlag::Alert),
            make("malaria", SeverityFlag::Watch),
            make("cholera", SeverityFlag::Critical),
        ];

        let summary = AnomalySummary::from_anomalies(&anomalies);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.critical, 1);
        assert_eq!(summary.by_condition.get("malaria"), Some(&2));
        assert_eq!(summary.highest(), Some(SeverityFlag::Critical));
        assert_eq!(AnomalySummary::default().highest(), None);
    }

    #[test]
    fn test_severity_flag_ordering() {
        assert!(SeverityFlag::Watch < SeverityFlag::Alert);
        assert!(SeverityFlag::Alert < SeverityFlag::Critical);
        assert_eq!(SeverityFlag::Alert.to_string(), "alert");
    }
}

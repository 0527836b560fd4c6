//! Report assembly.
//!
//! Pure assembly of pipeline output into an [`EpidemiologicalReport`]:
//! no I/O, and identical input always yields identical, identically ordered
//! output.

use crate::analysis::PipelineRun;
use crate::error::{EpiError, Result};
use crate::models::{AnomalySummary, EpidemiologicalReport, GeoKind, GeoUnit};
use crate::period::PeriodRange;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;

/// What to build.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportRequest {
    pub title: String,
    pub period_range: PeriodRange,
    pub author: String,
    /// Version within the (title, period range) series.
    pub version: u32,
    pub generated_at: DateTime<Utc>,
}

impl ReportRequest {
    pub fn new(title: impl Into<String>, period_range: PeriodRange, author: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            period_range,
            author: author.into(),
            version: 1,
            generated_at: Utc::now(),
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version.max(1);
        self
    }

    pub fn generated_at(mut self, at: DateTime<Utc>) -> Self {
        self.generated_at = at;
        self
    }

    /// `<title-slug>-<period-range>-v<version>`
    pub fn report_id(&self) -> String {
        format!("{}-v{}", series_id(&self.title, &self.period_range), self.version)
    }
}

/// Identifier shared by every version of a report.
pub fn series_id(title: &str, range: &PeriodRange) -> String {
    format!("{}-{}", slugify(title), range.label())
}

/// Lowercase ASCII alphanumerics separated by single dashes.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-');

    if slug.is_empty() {
        "report".to_string()
    } else {
        slug.to_string()
    }
}

/// Assemble a report from a pipeline run over `geo_scope`.
///
/// Fails with `EmptyScope` when `geo_scope` has no units.
pub fn build(request: &ReportRequest, geo_scope: &[&GeoUnit], run: PipelineRun) -> Result<EpidemiologicalReport> {
    if geo_scope.is_empty() {
        return Err(EpiError::EmptyScope);
    }

    let mut units: Vec<GeoUnit> = geo_scope.iter().map(|u| (*u).clone()).collect();
    units.sort_by(|a, b| by_place(Some(a.kind), &a.name, &a.id, Some(b.kind), &b.name, &b.id));

    let PipelineRun {
        mut aggregates,
        mut unclassified,
        mut anomalies,
        gaps: mut insufficient_history,
        ingestion,
    } = run;

    aggregates.sort_by(|a, b| {
        by_place(a.geo_kind, &a.geo_name, &a.geo_unit_id, b.geo_kind, &b.geo_name, &b.geo_unit_id)
            .then_with(|| a.period.cmp(&b.period))
    });

    anomalies.sort_by(|a, b| {
        by_place(a.geo_kind, &a.geo_name, &a.geo_unit_id, b.geo_kind, &b.geo_name, &b.geo_unit_id)
            .then_with(|| a.period.cmp(&b.period))
            .then_with(|| a.condition_code.cmp(&b.condition_code))
    });

    insufficient_history.sort_by(|a, b| {
        by_place(a.geo_kind, &a.geo_name, &a.geo_unit_id, b.geo_kind, &b.geo_name, &b.geo_unit_id)
            .then_with(|| a.period.cmp(&b.period))
            .then_with(|| a.condition_code.cmp(&b.condition_code))
    });

    unclassified.sort_by(|a, b| a.period.cmp(&b.period));

    let summary = AnomalySummary::from_anomalies(&anomalies);

    Ok(EpidemiologicalReport {
        id: request.report_id(),
        version: request.version,
        title: request.title.clone(),
        period_range: request.period_range,
        included_geo_units: units,
        aggregates,
        anomalies,
        insufficient_history,
        unclassified,
        summary,
        ingestion,
        generated_at: request.generated_at,
        generated_by: request.author.clone(),
    })
}

/// Most specific level first, then by name, then by id.
fn by_place(
    kind_a: Option<GeoKind>,
    name_a: &str,
    id_a: &str,
    kind_b: Option<GeoKind>,
    name_b: &str,
    id_b: &str,
) -> Ordering {
    GeoKind::specificity_rank(kind_a)
        .cmp(&GeoKind::specificity_rank(kind_b))
        .then_with(|| name_a.cmp(name_b))
        .then_with(|| id_a.cmp(id_b))
}

//! Markdown and JSON report rendering.
//!
//! This module renders a built [`EpidemiologicalReport`] for people (Markdown)
//! or for downstream tooling such as the alert notifier (JSON).

use crate::analysis::{condition_distribution, most_affected_units, scope_roots};
use crate::error::Result;
use crate::models::{
    AgeBand, Anomaly, AnomalySummary, DemographicBreakdown, EpidemiologicalReport, GeoKind,
    HistoryGap, PeriodAggregate, SeverityFlag,
};
use super::archive::StagedFile;
use std::path::Path;

/// Rendering options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderOptions {
    /// Conditions listed per unit.
    pub top_conditions: usize,
    /// Units listed under "Most Affected Units".
    pub most_affected: usize,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            top_conditions: 5,
            most_affected: 5,
        }
    }
}

/// Generate a complete Markdown report.
pub fn generate_markdown_report(report: &EpidemiologicalReport, options: &RenderOptions) -> String {
    let mut output = String::new();

    output.push_str(&format!("# {}\n\n", report.title));
    output.push_str(&generate_metadata_section(report));
    output.push_str(&generate_table_of_contents(report));
    output.push_str(&generate_summary_section(report, options));
    output.push_str(&generate_anomalies_section(&report.anomalies));
    output.push_str(&generate_aggregates_section(&report.aggregates, options));
    output.push_str(&generate_unclassified_section(&report.unclassified, options));
    output.push_str(&generate_gaps_section(&report.insufficient_history));
    output.push_str(&generate_footer(report));

    output
}

fn generate_metadata_section(report: &EpidemiologicalReport) -> String {
    let mut section = String::new();
    let ingestion = &report.ingestion;

    section.push_str("## Metadata\n\n");
    section.push_str(&format!("- **Report:** `{}` (version {})\n", report.id, report.version));
    section.push_str(&format!("- **Period:** {}\n", report.period_range));
    section.push_str(&format!(
        "- **Generated:** {}\n",
        report.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    section.push_str(&format!("- **Generated By:** {}\n", report.generated_by));
    section.push_str(&format!(
        "- **Units in Scope:** {}\n",
        report.included_geo_units.len()
    ));
    section.push_str(&format!("- **Records Processed:** {}\n", ingestion.fetched));
    if ingestion.malformed > 0 {
        section.push_str(&format!("- **Malformed Records Skipped:** {}\n", ingestion.malformed));
    }
    if ingestion.unclassified > 0 {
        section.push_str(&format!("- **Unclassified Records:** {}\n", ingestion.unclassified));
    }
    if ingestion.out_of_scope > 0 {
        section.push_str(&format!("- **Records Outside Scope:** {}\n", ingestion.out_of_scope));
    }
    section.push('\n');

    section
}

fn generate_table_of_contents(report: &EpidemiologicalReport) -> String {
    let mut toc = String::new();

    toc.push_str("## Table of Contents\n\n");
    toc.push_str("- [Metadata](#metadata)\n");
    toc.push_str("- [Summary](#summary)\n");
    toc.push_str("- [Anomalies](#anomalies)\n");
    toc.push_str("- [Aggregates by Unit](#aggregates-by-unit)\n");
    if report.unclassified.iter().any(|u| u.total_records > 0) {
        toc.push_str("- [Unclassified Records](#unclassified-records)\n");
    }
    if !report.insufficient_history.is_empty() {
        toc.push_str("- [Insufficient History](#insufficient-history)\n");
    }
    toc.push('\n');

    toc
}

fn generate_summary_section(report: &EpidemiologicalReport, options: &RenderOptions) -> String {
    let mut section = String::new();

    section.push_str("## Summary\n\n");
    section.push_str(&generate_severity_table(&report.summary));

    if !report.summary.by_condition.is_empty() {
        section.push_str("### Anomalies by Condition\n\n");
        section.push_str("| Condition | Anomalies |\n");
        section.push_str("|:---|:---:|\n");

        let mut conditions: Vec<_> = report.summary.by_condition.iter().collect();
        conditions.sort_by_key(|(_, count)| std::cmp::Reverse(*count));

        for (condition, count) in conditions {
            section.push_str(&format!("| {} | {} |\n", condition, count));
        }
        section.push('\n');
    }

    let roots = scope_roots(&report.aggregates, &report.included_geo_units);

    let distribution = condition_distribution(&roots);
    if !distribution.is_empty() {
        section.push_str("### Cases by Condition\n\n");
        section.push_str("| Condition | Cases |\n");
        section.push_str("|:---|:---:|\n");

        let mut conditions: Vec<_> = distribution.iter().collect();
        conditions.sort_by(|(ca, a), (cb, b)| b.cmp(a).then_with(|| ca.cmp(cb)));

        for (condition, count) in conditions {
            section.push_str(&format!("| {} | {} |\n", condition, count));
        }
        section.push('\n');
    }

    let mut demographics = DemographicBreakdown::default();
    for aggregate in &roots {
        demographics.absorb(&aggregate.demographic_breakdown);
    }
    if demographics.age_bands.total() > 0 {
        section.push_str(&generate_demographics_table(&demographics));
    }

    let affected = most_affected_units(&report.aggregates, options.most_affected);
    if !affected.is_empty() {
        section.push_str("### Most Affected Units\n\n");
        section.push_str("| Unit | Level | Period | Records |\n");
        section.push_str("|:---|:---|:---|:---:|\n");

        for (aggregate, count) in affected {
            section.push_str(&format!(
                "| {} | {} | {} | {} |\n",
                aggregate.geo_name,
                level(aggregate.geo_kind),
                aggregate.period,
                count
            ));
        }
        section.push('\n');
    }

    section
}

fn generate_severity_table(summary: &AnomalySummary) -> String {
    let mut table = String::new();

    table.push_str("### Anomaly Severity Breakdown\n\n");
    table.push_str(&format!(
        "| {} Critical | {} Alert | {} Watch | **Total** |\n",
        SeverityFlag::Critical.emoji(),
        SeverityFlag::Alert.emoji(),
        SeverityFlag::Watch.emoji(),
    ));
    table.push_str("|:---:|:---:|:---:|:---:|\n");
    table.push_str(&format!(
        "| {} | {} | {} | **{}** |\n\n",
        summary.critical, summary.alert, summary.watch, summary.total
    ));

    table
}

fn generate_demographics_table(demographics: &DemographicBreakdown) -> String {
    let mut table = String::new();
    let bands = [
        AgeBand::Under5,
        AgeBand::From5To14,
        AgeBand::From15To49,
        AgeBand::From50To64,
        AgeBand::From65,
        AgeBand::Unknown,
    ];

    table.push_str("### Cases by Age Band\n\n");
    table.push_str(&format!(
        "| {} |\n",
        bands.iter().map(|b| b.label()).collect::<Vec<_>>().join(" | ")
    ));
    table.push_str(&format!("|{}\n", ":---:|".repeat(bands.len())));
    table.push_str(&format!(
        "| {} |\n\n",
        bands
            .iter()
            .map(|b| demographics.age_bands.get(*b).to_string())
            .collect::<Vec<_>>()
            .join(" | ")
    ));

    let g = &demographics.gender;
    table.push_str(&format!(
        "*Female: {} | Male: {} | Other: {} | Not informed: {}*\n\n",
        g.female, g.male, g.other, g.unknown
    ));

    table
}

fn generate_anomalies_section(anomalies: &[Anomaly]) -> String {
    let mut section = String::new();

    section.push_str("## Anomalies\n\n");

    if anomalies.is_empty() {
        section.push_str("No counts exceeded their historical baselines.\n\n");
        return section;
    }

    for anomaly in anomalies {
        section.push_str(&generate_anomaly_block(anomaly));
    }

    section
}

fn generate_anomaly_block(anomaly: &Anomaly) -> String {
    let mut block = String::new();

    block.push_str(&format!(
        "#### {} **{}** {} - {} ({})\n\n",
        anomaly.severity_flag.emoji(),
        anomaly.severity_flag.to_string().to_uppercase(),
        anomaly.condition_code,
        anomaly.geo_name,
        level(anomaly.geo_kind)
    ));
    block.push_str(&format!("**Period:** {}\n\n", anomaly.period));
    block.push_str(&format!(
        "**Observed:** {} cases (baseline {:.1} ± {:.1})\n\n",
        anomaly.observed_count, anomaly.baseline_mean, anomaly.baseline_stddev
    ));
    match anomaly.z_score {
        Some(z) => block.push_str(&format!("**z-score:** {:.2}\n\n", z)),
        None => block.push_str("**z-score:** n/a (no variation in baseline)\n\n"),
    }
    block.push_str("---\n\n");

    block
}

fn generate_aggregates_section(aggregates: &[PeriodAggregate], options: &RenderOptions) -> String {
    let mut section = String::new();

    section.push_str("## Aggregates by Unit\n\n");
    section.push_str("| Unit | Level | Period | Records | Per 1000 | Top Conditions |\n");
    section.push_str("|:---|:---|:---|:---:|:---:|:---|\n");

    for aggregate in aggregates {
        section.push_str(&format!(
            "| {} | {} | {} | {} | {} | {} |\n",
            aggregate.geo_name,
            level(aggregate.geo_kind),
            aggregate.period,
            aggregate.total_records,
            aggregate
                .incidence_per_1000()
                .map_or_else(|| "-".to_string(), |rate| format!("{:.2}", rate)),
            top_conditions_cell(aggregate, options.top_conditions)
        ));
    }
    section.push('\n');

    section
}

fn generate_unclassified_section(unclassified: &[PeriodAggregate], options: &RenderOptions) -> String {
    let populated: Vec<_> = unclassified.iter().filter(|u| u.total_records > 0).collect();
    if populated.is_empty() {
        return String::new();
    }

    let mut section = String::new();

    section.push_str("## Unclassified Records\n\n");
    section.push_str("Records whose geography reference could not be resolved.\n\n");
    section.push_str("| Period | Records | Top Conditions |\n");
    section.push_str("|:---|:---:|:---|\n");

    for bucket in populated {
        section.push_str(&format!(
            "| {} | {} | {} |\n",
            bucket.period,
            bucket.total_records,
            top_conditions_cell(bucket, options.top_conditions)
        ));
    }
    section.push('\n');

    section
}

fn generate_gaps_section(gaps: &[HistoryGap]) -> String {
    if gaps.is_empty() {
        return String::new();
    }

    let mut section = String::new();

    section.push_str("## Insufficient History\n\n");
    section.push_str("These counts could not be judged yet.\n\n");
    section.push_str("| Unit | Level | Condition | Period | History |\n");
    section.push_str("|:---|:---|:---|:---|:---:|\n");

    for gap in gaps {
        section.push_str(&format!(
            "| {} | {} | {} | {} | {}/{} |\n",
            gap.geo_name,
            level(gap.geo_kind),
            gap.condition_code,
            gap.period,
            gap.periods_available,
            gap.periods_required
        ));
    }
    section.push('\n');

    section
}

fn generate_footer(report: &EpidemiologicalReport) -> String {
    let mut footer = String::new();

    footer.push_str("---\n\n");
    footer.push_str(&format!(
        "*Report generated by epiwatch v{} for {}*\n",
        env!("CARGO_PKG_VERSION"),
        report.generated_by
    ));

    footer
}

fn level(kind: Option<GeoKind>) -> String {
    kind.map_or_else(|| "Unclassified".to_string(), |k| k.to_string())
}

fn top_conditions_cell(aggregate: &PeriodAggregate, n: usize) -> String {
    if aggregate.top_conditions.is_empty() {
        return "-".to_string();
    }
    aggregate
        .top_conditions
        .iter()
        .take(n)
        .map(|c| format!("{} ({})", c.condition_code, c.count))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Generate a JSON report.
pub fn generate_json_report(report: &EpidemiologicalReport) -> Result<String> {
    serde_json::to_string_pretty(report).map_err(Into::into)
}

/// Render `report` next to `path` without publishing it yet.
pub fn stage_report(
    report: &EpidemiologicalReport,
    path: &Path,
    json: bool,
    options: &RenderOptions,
) -> Result<StagedFile> {
    let content = if json {
        generate_json_report(report)?
    } else {
        generate_markdown_report(report, options)
    };
    StagedFile::stage(path, content.as_bytes())
}

/// Render `report` to `path` in the given format, atomically.
pub fn write_report(report: &EpidemiologicalReport, path: &Path, json: bool, options: &RenderOptions) -> Result<()> {
    stage_report(report, path, json, options)?.commit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{Aggregator, PipelineRun};
    use crate::geography::tests::sample_index;
    use crate::ingestion::tests::raw;
    use crate::models::HealthRecord;
    use crate::period::{Period, PeriodRange};
    use crate::report::builder::{build, ReportRequest};

    fn create_test_report() -> EpidemiologicalReport {
        let geo = sample_index();
        let scope = geo.scope(&["bissau".to_string()]).unwrap();
        let period = Period::month(2024, 3).unwrap();

        let mut records: Vec<HealthRecord> = ["bandim", "bandim", "mindara", "atlantis"]
            .iter()
            .map(|g| raw(g, "malaria", "2024-03-10").normalize().unwrap())
            .collect();
        records[1].age = Some(3);

        let outcome = Aggregator::default().aggregate(&records, &period, &geo, &scope);
        let bissau = &outcome.aggregates["bissau"];
        let anomaly = Anomaly {
            geo_unit_id: bissau.geo_unit_id.clone(),
            geo_kind: bissau.geo_kind,
            geo_name: bissau.geo_name.clone(),
            condition_code: "malaria".to_string(),
            period,
            observed_count: 250,
            baseline_mean: 101.7,
            baseline_stddev: 6.2,
            z_score: Some(23.9),
            severity_flag: SeverityFlag::Alert,
        };
        let gap = HistoryGap {
            geo_unit_id: "bandim".to_string(),
            geo_kind: Some(GeoKind::Locality),
            geo_name: "Bandim".to_string(),
            condition_code: "malaria".to_string(),
            period,
            periods_available: 1,
            periods_required: 3,
        };

        let run = PipelineRun {
            aggregates: outcome.aggregates.into_values().collect(),
            unclassified: vec![outcome.unclassified],
            anomalies: vec![anomaly],
            gaps: vec![gap],
            ingestion: Default::default(),
        };
        let request = ReportRequest::new("Bissau Weekly", PeriodRange::single(period), "Direção Regional");
        build(&request, &scope, run).unwrap()
    }

    #[test]
    fn test_generate_markdown_report() {
        let report = create_test_report();
        let markdown = generate_markdown_report(&report, &RenderOptions::default());

        assert!(markdown.contains("# Bissau Weekly"));
        assert!(markdown.contains("## Metadata"));
        assert!(markdown.contains("## Summary"));
        assert!(markdown.contains("## Anomalies"));
        assert!(markdown.contains("**ALERT** malaria - Bissau (Region)"));
        assert!(markdown.contains("## Unclassified Records"));
        assert!(markdown.contains("## Insufficient History"));
        assert!(markdown.contains("| Bandim | Locality | 2024-03 | 2 |"));
        assert!(markdown.contains("Direção Regional"));
    }

    #[test]
    fn test_summary_counts_each_record_once() {
        let report = create_test_report();
        let section = generate_summary_section(&report, &RenderOptions::default());

        // bandim, mindara and their city roll up into Bissau: 3 cases, not 9
        assert!(section.contains("| malaria | 3 |"));
        assert!(section.contains("### Cases by Age Band"));
    }

    #[test]
    fn test_anomaly_block_without_z_score() {
        let mut anomaly = create_test_report().anomalies[0].clone();
        anomaly.z_score = None;
        anomaly.severity_flag = SeverityFlag::Critical;

        let block = generate_anomaly_block(&anomaly);
        assert!(block.contains("CRITICAL"));
        assert!(block.contains("n/a"));
        assert!(block.contains("250 cases"));
    }

    #[test]
    fn test_empty_sections() {
        assert!(generate_gaps_section(&[]).is_empty());
        assert!(generate_unclassified_section(&[], &RenderOptions::default()).is_empty());
        assert!(generate_anomalies_section(&[]).contains("No counts exceeded"));
    }

    #[test]
    fn test_generate_json_report() {
        let report = create_test_report();
        let json = generate_json_report(&report).unwrap();

        assert!(json.contains("\"severity_flag\": \"alert\""));
        assert!(json.contains("\"period_range\""));
        assert!(json.contains("\"label\": \"2024-03\""));
    }

    #[test]
    fn test_write_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        write_report(&create_test_report(), &path, true, &RenderOptions::default()).unwrap();

        let parsed: EpidemiologicalReport =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed.anomalies.len(), 1);
    }

    #[test]
    fn test_staged_report_is_published_on_commit_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.md");

        let staged = stage_report(&create_test_report(), &path, false, &RenderOptions::default()).unwrap();
        assert!(!path.exists());
        staged.commit().unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("Bandim"));
    }
}

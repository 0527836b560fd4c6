//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use crate::models::SeverityFlag;
use crate::period::{Period, PeriodRange};
use clap::Parser;
use std::path::PathBuf;

/// epiwatch - regional epidemiological aggregation and outbreak reporting
///
/// Aggregates consultation records over the Region → City → Locality
/// hierarchy, flags counts that break their historical baselines, and
/// writes Markdown/JSON reports.
///
/// Examples:
///   epiwatch --geography geo.json --records exports/ --period 2024-03
///   epiwatch --geography geo.json --records-url http://consultas.local/api --period 2024-Q1
///   epiwatch --geography geo.json --records exports/ --period 2024-01 --through 2024-06 --history history.json --save-history
///   epiwatch --geography geo.json --find bissau
///   epiwatch --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Geography file (JSON array of regions, cities and localities)
    #[arg(short, long, value_name = "FILE", required_unless_present = "init_config")]
    pub geography: Option<PathBuf>,

    /// JSON-lines export file or directory of shards
    #[arg(short, long, value_name = "PATH", conflicts_with = "records_url")]
    pub records: Option<PathBuf>,

    /// Base URL of the consultation records API
    #[arg(long, value_name = "URL", env = "EPIWATCH_RECORDS_URL")]
    pub records_url: Option<String>,

    /// Period to report on: 2024-03, 2024-Q1 or 2024
    #[arg(short, long, value_name = "PERIOD")]
    pub period: Option<String>,

    /// Last period of a range starting at --period
    #[arg(long, value_name = "PERIOD", requires = "period")]
    pub through: Option<String>,

    /// Units to report on (comma-separated ids); each includes its subtree
    ///
    /// Defaults to every region.
    #[arg(short, long, value_name = "IDS", value_delimiter = ',')]
    pub scope: Option<Vec<String>>,

    /// History file of earlier aggregates, used for baselines
    #[arg(long, value_name = "FILE")]
    pub history: Option<PathBuf>,

    /// Append this run's aggregates to the history file
    #[arg(long, requires = "history")]
    pub save_history: bool,

    /// Archive directory for versioned JSON reports
    #[arg(long, value_name = "DIR")]
    pub archive: Option<PathBuf>,

    /// Report title
    #[arg(long, value_name = "TITLE")]
    pub title: Option<String>,

    /// Report author
    #[arg(long, value_name = "NAME")]
    pub author: Option<String>,

    /// Output format (markdown, json)
    #[arg(long, default_value = "markdown", value_name = "FORMAT")]
    pub format: OutputFormat,

    /// Output file path for the report
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Path to configuration file
    ///
    /// If not specified, looks for .epiwatch.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Number of region slices processed concurrently
    #[arg(long, value_name = "NUM")]
    pub concurrency: Option<usize>,

    /// Per-fetch timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Length of each unit's top-conditions list
    #[arg(long, value_name = "COUNT")]
    pub top_n: Option<usize>,

    /// Fetch all records once and partition in memory
    #[arg(long)]
    pub full_scan: bool,

    /// Fail if anomalies at or above this level are found
    ///
    /// For cron-driven alerting. Exit code 2 when the threshold is reached.
    /// Values: watch, alert, critical
    #[arg(long, value_name = "LEVEL")]
    pub fail_on: Option<AlertLevel>,

    /// Minimum anomaly level to include in the report
    #[arg(long, value_name = "LEVEL")]
    pub min_severity: Option<AlertLevel>,

    /// Search the geography by name or code, then exit
    #[arg(long, value_name = "TERM")]
    pub find: Option<String>,

    /// Dry run: load geography and records, print counts, build nothing
    #[arg(long)]
    pub dry_run: bool,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,

    /// Generate a default .epiwatch.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

/// Output format for the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

/// Anomaly level for --fail-on and --min-severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, clap::ValueEnum)]
pub enum AlertLevel {
    Watch,
    Alert,
    Critical,
}

impl From<AlertLevel> for SeverityFlag {
    fn from(level: AlertLevel) -> Self {
        match level {
            AlertLevel::Watch => SeverityFlag::Watch,
            AlertLevel::Alert => SeverityFlag::Alert,
            AlertLevel::Critical => SeverityFlag::Critical,
        }
    }
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        // Skip validation for --init-config
        if self.init_config {
            return Ok(());
        }

        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        match self.geography {
            Some(ref path) if !path.is_file() => {
                return Err(format!("Geography file does not exist: {}", path.display()));
            }
            None => return Err("--geography is required".to_string()),
            _ => {}
        }

        if self.concurrency == Some(0) {
            return Err("Concurrency must be at least 1".to_string());
        }
        if self.timeout == Some(0) {
            return Err("Timeout must be at least 1 second".to_string());
        }
        if self.top_n == Some(0) {
            return Err("--top-n must be at least 1".to_string());
        }

        // Geography search needs nothing else
        if self.find.is_some() {
            return Ok(());
        }

        if self.period.is_none() {
            return Err("--period is required".to_string());
        }
        self.period_range()?;

        match (&self.records, &self.records_url) {
            (None, None) => return Err("One of --records or --records-url is required".to_string()),
            (Some(path), _) if !path.exists() => {
                return Err(format!("Records path does not exist: {}", path.display()));
            }
            (_, Some(url)) if !url.starts_with("http://") && !url.starts_with("https://") => {
                return Err("Records URL must start with 'http://' or 'https://'".to_string());
            }
            _ => {}
        }

        Ok(())
    }

    /// The requested period range.
    pub fn period_range(&self) -> Result<PeriodRange, String> {
        let first: Period = self
            .period
            .as_deref()
            .ok_or_else(|| "--period is required".to_string())?
            .parse()
            .map_err(|e: crate::error::EpiError| e.to_string())?;

        match self.through.as_deref() {
            None => Ok(PeriodRange::single(first)),
            Some(last) => {
                let last: Period = last.parse().map_err(|e: crate::error::EpiError| e.to_string())?;
                PeriodRange::new(first, last).map_err(|e| e.to_string())
            }
        }
    }

    /// Scope ids; empty means every region.
    pub fn scope_ids(&self) -> Vec<String> {
        self.scope
            .as_ref()
            .map(|ids| {
                ids.iter()
                    .map(|id| id.trim().to_string())
                    .filter(|id| !id.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns the log level based on verbosity settings.
    ///
    /// `verbose_by_default` comes from the config file; `--quiet` wins over it.
    pub fn log_level(&self, verbose_by_default: bool) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose || verbose_by_default {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_args(dir: &std::path::Path) -> Args {
        let geography = dir.join("geo.json");
        let records = dir.join("records.jsonl");
        std::fs::write(&geography, "[]").unwrap();
        std::fs::write(&records, "").unwrap();

        Args {
            geography: Some(geography),
            records: Some(records),
            records_url: None,
            period: Some("2024-03".to_string()),
            through: None,
            scope: None,
            history: None,
            save_history: false,
            archive: None,
            title: None,
            author: None,
            format: OutputFormat::Markdown,
            output: None,
            config: None,
            concurrency: None,
            timeout: None,
            top_n: None,
            full_scan: false,
            fail_on: None,
            min_severity: None,
            find: None,
            dry_run: false,
            verbose: false,
            quiet: false,
            init_config: false,
        }
    }

    #[test]
    fn test_valid_args() {
        let dir = tempfile::tempdir().unwrap();
        assert!(make_args(dir.path()).validate().is_ok());
    }

    #[test]
    fn test_validation_conflicting_options() {
        let dir = tempfile::tempdir().unwrap();
        let mut args = make_args(dir.path());
        args.verbose = true;
        args.quiet = true;
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validation_requires_a_record_source() {
        let dir = tempfile::tempdir().unwrap();
        let mut args = make_args(dir.path());
        args.records = None;
        assert!(args.validate().is_err());

        args.records_url = Some("ftp://consultas".to_string());
        assert!(args.validate().is_err());

        args.records_url = Some("http://consultas.local/api".to_string());
        assert!(args.validate().is_ok());

        // Geography search needs no records
        args.records_url = None;
        args.find = Some("bissau".to_string());
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_period_range() {
        let dir = tempfile::tempdir().unwrap();
        let mut args = make_args(dir.path());
        assert_eq!(args.period_range().unwrap().label(), "2024-03");

        args.through = Some("2024-05".to_string());
        assert_eq!(args.period_range().unwrap().periods().len(), 3);

        args.through = Some("2024-Q2".to_string());
        assert!(args.period_range().is_err());

        args.through = Some("2023-12".to_string());
        assert!(args.validate().is_err());

        args.through = None;
        args.period = Some("March".to_string());
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_scope_ids() {
        let dir = tempfile::tempdir().unwrap();
        let mut args = make_args(dir.path());
        assert!(args.scope_ids().is_empty());

        args.scope = Some(vec![" bissau".to_string(), "".to_string(), "gabu".to_string()]);
        assert_eq!(args.scope_ids(), vec!["bissau", "gabu"]);
    }

    #[test]
    fn test_alert_level_maps_to_flag() {
        assert_eq!(SeverityFlag::from(AlertLevel::Alert), SeverityFlag::Alert);
        assert!(AlertLevel::Watch < AlertLevel::Critical);
    }

    #[test]
    fn test_log_level() {
        let dir = tempfile::tempdir().unwrap();
        let mut args = make_args(dir.path());
        assert_eq!(args.log_level(false), tracing::Level::INFO);

        args.verbose = true;
        assert_eq!(args.log_level(false), tracing::Level::DEBUG);

        args.verbose = false;
        args.quiet = true;
        assert_eq!(args.log_level(false), tracing::Level::ERROR);
    }

    #[test]
    fn test_config_verbose_raises_log_level() {
        let dir = tempfile::tempdir().unwrap();
        let mut args = make_args(dir.path());

        let mut config = crate::config::Config::default();
        config.general.verbose = true;
        config.merge_with_args(&args);
        assert_eq!(args.log_level(config.general.verbose), tracing::Level::DEBUG);

        args.quiet = true;
        assert_eq!(args.log_level(config.general.verbose), tracing::Level::ERROR);
    }
}

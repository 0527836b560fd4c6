//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.epiwatch.toml` files.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default configuration file name.
pub const CONFIG_FILE: &str = ".epiwatch.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Record ingestion settings.
    #[serde(default)]
    pub ingestion: IngestionConfig,

    /// Aggregation settings.
    #[serde(default)]
    pub aggregation: AggregatorConfig,

    /// Anomaly detection policy.
    #[serde(default)]
    pub anomaly: DetectorConfig,

    /// Report settings.
    #[serde(default)]
    pub report: ReportConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Default output file path.
    #[serde(default = "default_output")]
    pub output: String,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,

    /// Number of region slices processed concurrently.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            output: default_output(),
            verbose: false,
            concurrency: default_concurrency(),
        }
    }
}

fn default_output() -> String {
    "epi_report.md".to_string()
}

fn default_concurrency() -> usize {
    4
}

/// How records are pulled from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionMode {
    /// One scoped fetch per region, plus one for everything outside the scope.
    #[default]
    PerRegion,
    /// One unscoped fetch, partitioned in memory.
    FullScan,
}

/// Record ingestion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    #[serde(default)]
    pub mode: IngestionMode,

    /// Per-fetch timeout in seconds.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_seconds: u64,

    /// Page size for the HTTP store.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            mode: IngestionMode::default(),
            fetch_timeout_seconds: default_fetch_timeout(),
            page_size: default_page_size(),
        }
    }
}

fn default_fetch_timeout() -> u64 {
    30
}

fn default_page_size() -> usize {
    100
}

/// Aggregation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Length of each aggregate's top-conditions list.
    #[serde(default = "default_top_n")]
    pub top_n: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            top_n: default_top_n(),
        }
    }
}

fn default_top_n() -> usize {
    10
}

/// Anomaly detection policy. These are policy values, tune with care.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Counts below this are never flagged.
    #[serde(default = "default_min_cases")]
    pub minimum_case_threshold: u64,

    /// Periods of history needed before a count can be judged.
    #[serde(default = "default_min_periods")]
    pub minimum_baseline_periods: usize,

    /// Trailing periods kept in the rolling baseline.
    #[serde(default = "default_window")]
    pub window_periods: usize,

    /// Weight decay per period of age. 1.0 gives a plain mean.
    #[serde(default = "default_decay")]
    pub ewma_decay: f64,

    #[serde(default = "default_watch_sigma")]
    pub watch_sigma: f64,

    #[serde(default = "default_alert_sigma")]
    pub alert_sigma: f64,

    /// Multiple of the baseline mean that is always critical.
    #[serde(default = "default_critical_multiplier")]
    pub critical_multiplier: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            minimum_case_threshold: default_min_cases(),
            minimum_baseline_periods: default_min_periods(),
            window_periods: default_window(),
            ewma_decay: default_decay(),
            watch_sigma: default_watch_sigma(),
            alert_sigma: default_alert_sigma(),
            critical_multiplier: default_critical_multiplier(),
        }
    }
}

fn default_min_cases() -> u64 {
    5
}

fn default_min_periods() -> usize {
    3
}

fn default_window() -> usize {
    12
}

fn default_decay() -> f64 {
    0.85
}

fn default_watch_sigma() -> f64 {
    2.0
}

fn default_alert_sigma() -> f64 {
    3.0
}

fn default_critical_multiplier() -> f64 {
    5.0
}

/// Report generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    #[serde(default = "default_title")]
    pub title: String,

    #[serde(default = "default_author")]
    pub author: String,

    /// Conditions listed per unit in the rendered report.
    #[serde(default = "default_top_conditions")]
    pub top_conditions: usize,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            title: default_title(),
            author: default_author(),
            top_conditions: default_top_conditions(),
        }
    }
}

fn default_title() -> String {
    "Epidemiological Report".to_string()
}

fn default_author() -> String {
    "epiwatch".to_string()
}

fn default_top_conditions() -> usize {
    5
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings, but only
    /// when they were given explicitly.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(concurrency) = args.concurrency {
            self.general.concurrency = concurrency;
        }
        if let Some(ref output) = args.output {
            self.general.output = output.display().to_string();
        }

        if let Some(timeout) = args.timeout {
            self.ingestion.fetch_timeout_seconds = timeout;
        }
        if args.full_scan {
            self.ingestion.mode = IngestionMode::FullScan;
        }

        if let Some(top_n) = args.top_n {
            self.aggregation.top_n = top_n;
        }

        if let Some(ref title) = args.title {
            self.report.title = title.clone();
        }
        if let Some(ref author) = args.author {
            self.report.author = author.clone();
        }

        // Flags always override
        if args.verbose {
            self.general.verbose = true;
        }
    }

    /// Reject settings the engines cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.general.concurrency == 0 {
            bail!("general.concurrency must be at least 1");
        }
        if self.ingestion.fetch_timeout_seconds == 0 {
            bail!("ingestion.fetch_timeout_seconds must be at least 1");
        }
        if self.ingestion.page_size == 0 {
            bail!("ingestion.page_size must be at least 1");
        }
        if self.aggregation.top_n == 0 {
            bail!("aggregation.top_n must be at least 1");
        }

        let a = &self.anomaly;
        if a.minimum_baseline_periods == 0 {
            bail!("anomaly.minimum_baseline_periods must be at least 1");
        }
        if a.window_periods < a.minimum_baseline_periods {
            bail!(
                "anomaly.window_periods ({}) is smaller than minimum_baseline_periods ({})",
                a.window_periods,
                a.minimum_baseline_periods
            );
        }
        if !(a.ewma_decay > 0.0 && a.ewma_decay <= 1.0) {
            bail!("anomaly.ewma_decay must be in (0, 1], got {}", a.ewma_decay);
        }
        if a.watch_sigma <= 0.0 || a.alert_sigma < a.watch_sigma {
            bail!(
                "anomaly sigmas must satisfy 0 < watch_sigma <= alert_sigma (got {} and {})",
                a.watch_sigma,
                a.alert_sigma
            );
        }
        if a.critical_multiplier <= 1.0 {
            bail!("anomaly.critical_multiplier must be greater than 1");
        }

        Ok(())
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.output, "epi_report.md");
        assert_eq!(config.ingestion.mode, IngestionMode::PerRegion);
        assert_eq!(config.aggregation.top_n, 10);
        assert_eq!(config.anomaly.minimum_baseline_periods, 3);
        assert_eq!(config.anomaly.critical_multiplier, 5.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml_content = r#"
[general]
output = "march.md"
concurrency = 8

[ingestion]
mode = "full_scan"
fetch_timeout_seconds = 5

[anomaly]
ewma_decay = 1.0
minimum_case_threshold = 10
"#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.general.output, "march.md");
        assert_eq!(config.general.concurrency, 8);
        assert_eq!(config.ingestion.mode, IngestionMode::FullScan);
        assert_eq!(config.ingestion.fetch_timeout_seconds, 5);
        assert_eq!(config.ingestion.page_size, 100);
        assert_eq!(config.anomaly.ewma_decay, 1.0);
        assert_eq!(config.anomaly.minimum_case_threshold, 10);
        assert_eq!(config.anomaly.watch_sigma, 2.0);
        assert_eq!(config.report.title, "Epidemiological Report");
    }

    #[test]
    fn test_validate_rejects_bad_policy() {
        let mut config = Config::default();
        config.anomaly.ewma_decay = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.anomaly.alert_sigma = 1.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.anomaly.window_periods = 2;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.general.concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "[aggregation]\ntop_n = 3\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.aggregation.top_n, 3);

        std::fs::write(&path, "[aggregation]\ntop_n = 0\n").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(toml_str.contains("[general]"));
        assert!(toml_str.contains("[ingestion]"));
        assert!(toml_str.contains("[anomaly]"));
        assert!(toml_str.contains("mode = \"per_region\""));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.anomaly.window_periods, 12);
    }
}

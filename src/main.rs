//! epiwatch - regional epidemiological aggregation and outbreak reporting
//!
//! A CLI tool that aggregates consultation records over a geographic
//! hierarchy, detects counts above their historical baselines, and
//! writes versioned Markdown/JSON reports.
//!
//! Exit codes:
//!   0 - Success (no anomalies at the --fail-on level, or no --fail-on set)
//!   1 - Runtime error (bad geography, unreachable store, config, etc.)
//!   2 - Anomalies found at or above the --fail-on level

use anyhow::{Context, Result};
use chrono::Utc;
use epiwatch::analysis::{AggregateHistory, PipelineConfig, ReportPipeline};
use epiwatch::cli::{Args, OutputFormat};
use epiwatch::config::{Config, CONFIG_FILE};
use epiwatch::geography::GeographyIndex;
use epiwatch::ingestion::{GeoScope, HttpRecordStore, Ingestor, JsonlRecordStore, RecordStore};
use epiwatch::models::{AnomalySummary, SeverityFlag};
use epiwatch::period::PeriodRange;
use epiwatch::report::{self, RenderOptions, ReportArchive, ReportRequest};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    // Load configuration; CLI flags override the file
    let config = match load_config(&args) {
        Ok(mut config) => {
            config.merge_with_args(&args);
            config
        }
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    init_logging(&args, &config);

    info!("epiwatch v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);
    debug!("Configuration: {:?}", config);

    match run(args, config).await {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(e) => {
            error!("Run failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: generate a default .epiwatch.toml.
fn handle_init_config() -> Result<()> {
    let path = Path::new(CONFIG_FILE);

    if path.exists() {
        eprintln!("⚠️  {} already exists. Remove it first or edit it manually.", CONFIG_FILE);
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content).with_context(|| format!("Failed to write {}", CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", CONFIG_FILE);
    println!("   Edit it to tune baselines, thresholds, and report defaults.");
    Ok(())
}

/// Initialize logging based on verbosity settings.
fn init_logging(args: &Args, config: &Config) {
    let level = args.log_level(config.general.verbose);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

/// Load the geography and dispatch on the record source.
async fn run(args: Args, config: Config) -> Result<i32> {
    config.validate()?;

    let geography_path = args
        .geography
        .as_deref()
        .context("--geography is required")?;
    let geo = GeographyIndex::load(geography_path)
        .with_context(|| format!("Failed to load geography from {}", geography_path.display()))?;
    let summary = geo.summary();
    info!(
        "Geography: {} regions, {} cities, {} localities",
        summary.regions, summary.cities, summary.localities
    );

    // Handle --find: search and exit
    if let Some(ref term) = args.find {
        return handle_find(&geo, term);
    }

    let range = args.period_range().map_err(anyhow::Error::msg)?;
    let timeout = Duration::from_secs(config.ingestion.fetch_timeout_seconds);

    if let Some(ref url) = args.records_url {
        println!("📥 Reading records from API: {}", url);
        let store = HttpRecordStore::new(url, timeout, config.ingestion.page_size)?;
        execute(args, config, geo, range, Ingestor::new(store, timeout)).await
    } else {
        let path = args.records.clone().context("No record source given")?;
        println!("📥 Reading records from: {}", path.display());
        let store = JsonlRecordStore::new(path);
        execute(args, config, geo, range, Ingestor::new(store, timeout)).await
    }
}

/// Run the complete reporting workflow. Returns exit code (0 or 2).
async fn execute<S: RecordStore>(
    args: Args,
    config: Config,
    geo: GeographyIndex,
    range: PeriodRange,
    ingestor: Ingestor<S>,
) -> Result<i32> {
    let start_time = Instant::now();

    // Handle --dry-run: count records and exit
    if args.dry_run {
        return handle_dry_run(&geo, &range, &ingestor).await;
    }

    let scope_ids = args.scope_ids();
    let mut history = match args.history {
        Some(ref path) => Some(
            AggregateHistory::load(path)
                .with_context(|| format!("Failed to load history from {}", path.display()))?,
        ),
        None => None,
    };
    if let Some(ref h) = history {
        info!("Loaded {} history entries", h.len());
    }

    // Step 1: Aggregate and detect
    println!("\n🔬 Aggregating {} for {}...", range, config.report.title);
    println!(
        "   Concurrency: {} | Timeout: {}s | Mode: {:?}",
        config.general.concurrency, config.ingestion.fetch_timeout_seconds, config.ingestion.mode
    );

    let mut pipeline_config = PipelineConfig::from(&config);
    pipeline_config.show_progress = !args.quiet;
    let pipeline = ReportPipeline::new(Arc::new(geo), ingestor, pipeline_config);

    let mut outcome = pipeline.run(&range, &scope_ids, history.as_ref()).await?;
    let fresh_aggregates = outcome.aggregates.clone();

    // Apply --min-severity filter
    if let Some(min_level) = args.min_severity {
        let min_flag = SeverityFlag::from(min_level);
        outcome.anomalies.retain(|a| a.severity_flag >= min_flag);
    }

    let flagged_at_fail_level = args.fail_on.is_some_and(|level| {
        let threshold = SeverityFlag::from(level);
        outcome.anomalies.iter().any(|a| a.severity_flag >= threshold)
    });

    // Step 2: Build the report
    println!("\n📝 Generating report...");

    let archive = match args.archive {
        Some(ref dir) => Some(ReportArchive::open(dir)?),
        None => None,
    };
    let version = match archive {
        Some(ref archive) => archive.next_version(&config.report.title, &range)?,
        None => 1,
    };

    let request = ReportRequest::new(config.report.title.clone(), range, config.report.author.clone())
        .with_version(version);
    let scope = pipeline.geography().scope(&scope_ids)?;
    let report = report::build(&request, &scope, outcome)?;

    // Step 3: Stage the output, archive, then publish the output
    let output = output_path(&args, &config);
    let options = RenderOptions {
        top_conditions: config.report.top_conditions,
        most_affected: config.report.top_conditions,
    };
    let staged = report::stage_report(&report, &output, args.format == OutputFormat::Json, &options)
        .with_context(|| format!("Failed to render report for {}", output.display()))?;

    if let Some(ref archive) = archive {
        let stored = archive.store(&report)?;
        println!("   Archived as {}", stored.display());
    }

    staged
        .commit()
        .with_context(|| format!("Failed to write report to {}", output.display()))?;

    // Step 4: Record history only once the report exists
    if args.save_history {
        if let (Some(h), Some(path)) = (history.as_mut(), args.history.as_ref()) {
            let now = Utc::now();
            for aggregate in fresh_aggregates {
                h.record(aggregate, now);
            }
            h.save(path)
                .with_context(|| format!("Failed to save history to {}", path.display()))?;
            info!("History now holds {} entries", h.len());
        }
    }

    print_summary(&report.summary, report.aggregates.len(), start_time);
    if report.ingestion.malformed > 0 || report.ingestion.unclassified > 0 {
        warn!(
            "{} malformed and {} unclassified records were excluded from unit counts",
            report.ingestion.malformed, report.ingestion.unclassified
        );
    }
    println!("\n✅ Report {} saved to: {}", report.id, output.display());

    // Check --fail-on threshold
    if flagged_at_fail_level {
        eprintln!(
            "\n⛔ Anomalies found at or above {:?} level. Failing (exit code 2).",
            args.fail_on
        );
        return Ok(2);
    }

    Ok(0)
}

fn print_summary(summary: &AnomalySummary, aggregates: usize, start_time: Instant) {
    println!("\n📊 Run Summary:");
    println!("   Aggregates: {}", aggregates);
    println!("   Anomalies: {}", summary.total);
    println!(
        "   - 🔴 Critical: {} | 🟠 Alert: {} | 🟡 Watch: {}",
        summary.critical, summary.alert, summary.watch
    );
    println!("   Duration: {:.1}s", start_time.elapsed().as_secs_f64());
}

/// Handle --find: print matching units.
fn handle_find(geo: &GeographyIndex, term: &str) -> Result<i32> {
    let hits = geo.search(term)?;

    if hits.is_empty() {
        println!("No units match '{}'.", term);
        return Ok(0);
    }

    println!("Found {} units matching '{}':\n", hits.len(), term);
    for unit in hits {
        let parent = unit.parent.as_deref().unwrap_or("-");
        match unit.code {
            Some(ref code) => println!("  {:<9} {:<24} {} [{}] (parent: {})", unit.kind, unit.id, unit.name, code, parent),
            None => println!("  {:<9} {:<24} {} (parent: {})", unit.kind, unit.id, unit.name, parent),
        }
    }
    Ok(0)
}

/// Handle --dry-run: print what would be aggregated, exit.
async fn handle_dry_run<S: RecordStore>(
    geo: &GeographyIndex,
    range: &PeriodRange,
    ingestor: &Ingestor<S>,
) -> Result<i32> {
    println!("\n🔍 Dry run: counting records (no report written)...\n");

    let summary = geo.summary();
    println!(
        "   Geography: {} regions, {} cities, {} localities (~{} residents)",
        summary.regions, summary.cities, summary.localities, summary.estimated_population
    );

    let mut total = 0usize;
    for period in range.periods() {
        let batch = ingestor.fetch(&period, &GeoScope::All).await?;
        let resolvable = batch.iter().filter(|r| geo.get(&r.patient_region_ref).is_some()).count();
        println!(
            "     📄 {}: {} records ({} resolvable, {} malformed skipped)",
            period,
            batch.len(),
            resolvable,
            batch.stats().malformed
        );
        total += batch.len();
    }
    println!("\n   Total: {} records", total);

    println!("\n✅ Dry run complete. Nothing was written.");
    Ok(0)
}

/// Explicit --output wins; otherwise the configured path, with the
/// extension following --format.
fn output_path(args: &Args, config: &Config) -> PathBuf {
    if let Some(ref output) = args.output {
        return output.clone();
    }
    let path = PathBuf::from(&config.general.output);
    match args.format {
        OutputFormat::Json => path.with_extension("json"),
        OutputFormat::Markdown => path,
    }
}

/// Load configuration from file or use defaults.
///
/// Runs before logging is set up, since the file may turn on verbose output.
fn load_config(args: &Args) -> Result<Config> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        return Config::load(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()));
    }

    // Try default location
    match Config::load_default() {
        Ok(Some(config)) => Ok(config),
        Ok(None) => Ok(Config::default()),
        Err(e) => {
            eprintln!("⚠️  Failed to load {}: {}. Using defaults.", CONFIG_FILE, e);
            Ok(Config::default())
        }
    }
}

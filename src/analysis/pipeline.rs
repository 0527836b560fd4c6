//! Concurrent report pipeline.
//!
//! For every period of a range, the scope is split into one slice per
//! region. Slices are fetched and aggregated concurrently, joined, merged,
//! then judged against the rolling baselines before the period is fed into
//! the tracker. Any failed slice fails the whole run.

use super::aggregator::{AggregationConfig, AggregationOutcome, Aggregator};
use super::anomaly::{AnomalyConfig, AnomalyDetector, BaselineTracker, Detection};
use super::history::AggregateHistory;
use crate::config::{Config, IngestionMode};
use crate::error::{EpiError, Result};
use crate::geography::GeographyIndex;
use crate::ingestion::{GeoScope, IngestionSummary, Ingestor, RecordBatch, RecordStore};
use crate::models::{Anomaly, GeoUnit, HealthRecord, HistoryGap, PeriodAggregate};
use crate::period::{Period, PeriodRange};
use futures::stream::{self, StreamExt, TryStreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// Pipeline settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Slices processed at the same time.
    pub concurrency: usize,
    pub mode: IngestionMode,
    pub aggregation: AggregationConfig,
    pub anomaly: AnomalyConfig,
    /// Show a progress bar over slices.
    pub show_progress: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            mode: IngestionMode::PerRegion,
            aggregation: AggregationConfig::default(),
            anomaly: AnomalyConfig::default(),
            show_progress: false,
        }
    }
}

impl From<&Config> for PipelineConfig {
    fn from(config: &Config) -> Self {
        Self {
            concurrency: config.general.concurrency.max(1),
            mode: config.ingestion.mode,
            aggregation: AggregationConfig::from(&config.aggregation),
            anomaly: AnomalyConfig::from(&config.anomaly),
            show_progress: true,
        }
    }
}

/// Everything a report is assembled from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineRun {
    pub aggregates: Vec<PeriodAggregate>,
    /// One unclassified bucket per period.
    pub unclassified: Vec<PeriodAggregate>,
    pub anomalies: Vec<Anomaly>,
    pub gaps: Vec<HistoryGap>,
    pub ingestion: IngestionSummary,
}

/// One region's share of a period.
struct Slice {
    label: String,
    fetch_scope: GeoScope,
    /// Units aggregated by this slice; empty for the outside slice.
    units: BTreeSet<String>,
}

/// Fetch → aggregate → detect over a period range.
pub struct ReportPipeline<S> {
    geo: Arc<GeographyIndex>,
    ingestor: Ingestor<S>,
    config: PipelineConfig,
}

impl<S: RecordStore> ReportPipeline<S> {
    pub fn new(geo: Arc<GeographyIndex>, ingestor: Ingestor<S>, config: PipelineConfig) -> Self {
        Self {
            geo,
            ingestor,
            config,
        }
    }

    pub fn geography(&self) -> &GeographyIndex {
        &self.geo
    }

    /// Run the pipeline for `range` over the units `scope_ids` stand for.
    ///
    /// `history` seeds the baselines with periods preceding the range.
    pub async fn run(
        &self,
        range: &PeriodRange,
        scope_ids: &[String],
        history: Option<&AggregateHistory>,
    ) -> Result<PipelineRun> {
        let scope = self.geo.scope(scope_ids)?;
        if scope.is_empty() {
            return Err(EpiError::EmptyScope);
        }

        let regions = self.geo.partition_by_region(&scope)?;
        let all_ids: BTreeSet<String> = regions
            .iter()
            .flat_map(|(_, ids)| ids.iter().cloned())
            .collect();
        let periods = range.periods();

        info!(
            "Processing {} units in {} regions over {} ({} mode)",
            all_ids.len(),
            regions.len(),
            range,
            match self.config.mode {
                IngestionMode::PerRegion => "per-region",
                IngestionMode::FullScan => "full-scan",
            }
        );

        let mut slices: Vec<Slice> = regions
            .into_iter()
            .map(|(region, ids)| Slice {
                label: region,
                fetch_scope: GeoScope::Within(ids.clone()),
                units: ids,
            })
            .collect();
        slices.push(Slice {
            label: "outside scope".to_string(),
            fetch_scope: GeoScope::Outside(all_ids),
            units: BTreeSet::new(),
        });

        let progress = self.progress_bar((periods.len() * slices.len()) as u64);

        let mut tracker = BaselineTracker::new(self.config.anomaly);
        if let Some(history) = history {
            tracker.seed(history, &range.first);
        }
        let detector = AnomalyDetector::new(self.config.anomaly);
        let aggregator = Aggregator::new(self.config.aggregation);

        let mut run = PipelineRun::default();
        for period in periods {
            let (outcome, fetched) = match self.config.mode {
                IngestionMode::PerRegion => {
                    self.per_region(period, &slices, &aggregator, progress.as_ref())
                        .await?
                }
                IngestionMode::FullScan => {
                    self.full_scan(period, &slices, &aggregator, progress.as_ref())
                        .await?
                }
            };

            run.ingestion.absorb(&fetched);
            run.ingestion.unclassified += outcome.unclassified.total_records;
            run.ingestion.out_of_period += outcome.out_of_period;
            run.ingestion.out_of_scope += outcome.out_of_scope;

            let mut detection = Detection::default();
            for aggregate in outcome.aggregates.values() {
                detection.extend(detector.detect(aggregate, &tracker));
            }
            for aggregate in outcome.aggregates.values() {
                tracker.observe(aggregate);
            }

            debug!(
                "{}: {} anomalies, {} history gaps",
                period,
                detection.anomalies.len(),
                detection.gaps.len()
            );

            run.anomalies.extend(detection.anomalies);
            run.gaps.extend(detection.gaps);
            run.aggregates.extend(outcome.aggregates.into_values());
            run.unclassified.push(outcome.unclassified);
        }

        if let Some(pb) = progress {
            pb.finish_and_clear();
        }

        info!(
            "Processed {} records ({} malformed, {} unclassified), {} anomalies",
            run.ingestion.fetched,
            run.ingestion.malformed,
            run.ingestion.unclassified,
            run.anomalies.len()
        );
        Ok(run)
    }

    /// One scoped fetch per slice.
    async fn per_region(
        &self,
        period: Period,
        slices: &[Slice],
        aggregator: &Aggregator,
        progress: Option<&ProgressBar>,
    ) -> Result<(AggregationOutcome, IngestionSummary)> {
        let parts: Vec<(AggregationOutcome, IngestionSummary)> = stream::iter(slices)
            .map(|slice| async move {
                let batch = self.ingestor.fetch(&period, &slice.fetch_scope).await?;
                let stats = *batch.stats();
                debug!("{} {}: {} records", period, slice.label, batch.len());

                let outcome = self
                    .aggregate_slice(period, slice.units.clone(), batch, aggregator.clone())
                    .await?;
                if let Some(pb) = progress {
                    pb.inc(1);
                }
                Ok::<_, EpiError>((outcome, stats))
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .try_collect()
            .await?;

        Ok(Self::combine(period, aggregator, parts))
    }

    /// One unscoped fetch, partitioned in memory.
    async fn full_scan(
        &self,
        period: Period,
        slices: &[Slice],
        aggregator: &Aggregator,
        progress: Option<&ProgressBar>,
    ) -> Result<(AggregationOutcome, IngestionSummary)> {
        let batch = self.ingestor.fetch(&period, &GeoScope::All).await?;
        let stats = *batch.stats();
        debug!("{} full scan: {} records", period, batch.len());

        let mut slot_of: HashMap<&str, usize> = HashMap::new();
        for (index, slice) in slices.iter().enumerate() {
            for id in &slice.units {
                slot_of.insert(id.as_str(), index);
            }
        }
        let outside = slices
            .iter()
            .position(|s| s.units.is_empty())
            .unwrap_or(slices.len().saturating_sub(1));

        let mut partitions: Vec<Vec<HealthRecord>> = vec![Vec::new(); slices.len()];
        for record in &batch {
            let slot = slot_of
                .get(record.patient_region_ref.as_str())
                .copied()
                .unwrap_or(outside);
            partitions[slot].push(record.clone());
        }

        let jobs = slices.iter().zip(partitions).map(|(slice, records)| {
            (
                slice.units.clone(),
                RecordBatch::new(records, IngestionSummary::default()),
            )
        });

        let parts: Vec<(AggregationOutcome, IngestionSummary)> = stream::iter(jobs)
            .map(|(units, records)| async move {
                let outcome = self
                    .aggregate_slice(period, units, records, aggregator.clone())
                    .await?;
                if let Some(pb) = progress {
                    pb.inc(1);
                }
                Ok::<_, EpiError>((outcome, IngestionSummary::default()))
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .try_collect()
            .await?;

        let (outcome, _) = Self::combine(period, aggregator, parts);
        Ok((outcome, stats))
    }

    /// Aggregate one slice off the async runtime.
    async fn aggregate_slice(
        &self,
        period: Period,
        units: BTreeSet<String>,
        batch: RecordBatch,
        aggregator: Aggregator,
    ) -> Result<AggregationOutcome> {
        let geo = Arc::clone(&self.geo);

        tokio::task::spawn_blocking(move || {
            let scope: Vec<&GeoUnit> = units.iter().filter_map(|id| geo.get(id)).collect();
            aggregator.aggregate(batch.iter(), &period, &geo, &scope)
        })
        .await
        .map_err(|e| EpiError::Worker(e.to_string()))
    }

    fn combine(
        period: Period,
        aggregator: &Aggregator,
        parts: Vec<(AggregationOutcome, IngestionSummary)>,
    ) -> (AggregationOutcome, IngestionSummary) {
        let mut stats = IngestionSummary::default();
        let mut outcomes = Vec::with_capacity(parts.len());
        for (outcome, part_stats) in parts {
            stats.absorb(&part_stats);
            outcomes.push(outcome);
        }
        (aggregator.merge(period, outcomes), stats)
    }

    fn progress_bar(&self, len: u64) -> Option<ProgressBar> {
        if !self.config.show_progress {
            return None;
        }

        let pb = ProgressBar::new(len);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} slices ({eta})")
            .map(|s| s.progress_chars("#>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        pb.set_style(style);
        Some(pb)
    }
}

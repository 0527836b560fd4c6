//! Outbreak detection against rolling baselines.
//!
//! The baseline for a (unit, condition) pair is an exponentially weighted
//! mean and standard deviation over a bounded window of earlier periods.
//! [`BaselineTracker`] maintains those windows incrementally, so each new
//! period costs one push per unit instead of a rescan of the history.

use super::history::AggregateHistory;
use crate::config::DetectorConfig;
use crate::models::{Anomaly, HistoryGap, PeriodAggregate, SeverityFlag};
use crate::period::Period;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::debug;

/// Anomaly detection policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnomalyConfig {
    pub minimum_case_threshold: u64,
    pub minimum_baseline_periods: usize,
    pub window_periods: usize,
    pub ewma_decay: f64,
    pub watch_sigma: f64,
    pub alert_sigma: f64,
    pub critical_multiplier: f64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self::from(&DetectorConfig::default())
    }
}

impl From<&DetectorConfig> for AnomalyConfig {
    fn from(config: &DetectorConfig) -> Self {
        Self {
            minimum_case_threshold: config.minimum_case_threshold,
            minimum_baseline_periods: config.minimum_baseline_periods,
            window_periods: config.window_periods.max(1),
            ewma_decay: config.ewma_decay,
            watch_sigma: config.watch_sigma,
            alert_sigma: config.alert_sigma,
            critical_multiplier: config.critical_multiplier,
        }
    }
}

/// Historical expectation for one (unit, condition) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Baseline {
    pub geo_unit_id: String,
    pub condition_code: String,
    pub mean: f64,
    pub stddev: f64,
    /// Number of periods the statistics were computed from.
    pub periods: usize,
}

impl Baseline {
    /// Weighted statistics over the trailing window of `counts`, oldest
    /// first. The most recent period has weight 1, the one before it
    /// `decay`, then `decay²`, and so on.
    pub fn from_counts(geo_unit_id: &str, condition_code: &str, counts: &[u64], config: &AnomalyConfig) -> Self {
        let start = counts.len().saturating_sub(config.window_periods);
        let window = &counts[start..];

        let mut weight_sum = 0.0;
        let mut weighted = 0.0;
        let mut weight = 1.0;
        for &count in window.iter().rev() {
            weight_sum += weight;
            weighted += weight * count as f64;
            weight *= config.ewma_decay;
        }

        let (mean, stddev) = if weight_sum > 0.0 {
            let mean = weighted / weight_sum;
            let mut spread = 0.0;
            let mut weight = 1.0;
            for &count in window.iter().rev() {
                spread += weight * (count as f64 - mean).powi(2);
                weight *= config.ewma_decay;
            }
            (mean, (spread / weight_sum).sqrt())
        } else {
            (0.0, 0.0)
        };

        Self {
            geo_unit_id: geo_unit_id.to_string(),
            condition_code: condition_code.to_string(),
            mean,
            stddev,
            periods: window.len(),
        }
    }
}

/// One finalized period of a unit's condition counts.
#[derive(Debug, Clone)]
struct Observation {
    period: Period,
    counts: BTreeMap<String, u64>,
}

/// Per-unit bounded windows of finalized periods.
#[derive(Debug, Clone)]
pub struct BaselineTracker {
    config: AnomalyConfig,
    series: HashMap<String, VecDeque<Observation>>,
}

impl BaselineTracker {
    pub fn new(config: AnomalyConfig) -> Self {
        Self {
            config,
            series: HashMap::new(),
        }
    }

    /// Replay the trailing history preceding `before`.
    pub fn seed(&mut self, history: &AggregateHistory, before: &Period) {
        let earlier = history.latest_before(before);
        debug!("Seeding baselines from {} historical aggregates", earlier.len());
        for aggregate in earlier {
            self.observe(aggregate);
        }
    }

    /// Push one finalized period. Observing a period again supersedes the
    /// earlier observation of it.
    pub fn observe(&mut self, aggregate: &PeriodAggregate) {
        if aggregate.is_unclassified() {
            return;
        }

        let window = self
            .series
            .entry(aggregate.geo_unit_id.clone())
            .or_default();
        let observation = Observation {
            period: aggregate.period,
            counts: aggregate.condition_counts.clone(),
        };

        match window.iter().position(|o| o.period == aggregate.period) {
            Some(index) => window[index] = observation,
            None => {
                let index = window.partition_point(|o| o.period < aggregate.period);
                window.insert(index, observation);
            }
        }

        while window.len() > self.config.window_periods {
            window.pop_front();
        }
    }

    pub fn periods_observed(&self, geo_unit_id: &str) -> usize {
        self.series.get(geo_unit_id).map_or(0, VecDeque::len)
    }

    /// Counts of `condition_code` per observed period, oldest first. A
    /// period that saw no such case counts as 0.
    pub fn counts(&self, geo_unit_id: &str, condition_code: &str) -> Vec<u64> {
        self.series
            .get(geo_unit_id)
            .map(|window| {
                window
                    .iter()
                    .map(|o| o.counts.get(condition_code).copied().unwrap_or(0))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn baseline(&self, geo_unit_id: &str, condition_code: &str) -> Baseline {
        Baseline::from_counts(
            geo_unit_id,
            condition_code,
            &self.counts(geo_unit_id, condition_code),
            &self.config,
        )
    }
}

/// Verdict for a single count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DetectionStatus {
    Normal,
    Anomaly {
        flag: SeverityFlag,
        z_score: Option<f64>,
    },
    InsufficientHistory {
        available: usize,
        required: usize,
    },
}

/// Anomalies and history gaps found in one aggregate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detection {
    pub anomalies: Vec<Anomaly>,
    pub gaps: Vec<HistoryGap>,
}

impl Detection {
    pub fn extend(&mut self, other: Detection) {
        self.anomalies.extend(other.anomalies);
        self.gaps.extend(other.gaps);
    }
}

/// Applies the alerting policy to aggregates.
#[derive(Debug, Clone, Default)]
pub struct AnomalyDetector {
    config: AnomalyConfig,
}

impl AnomalyDetector {
    pub fn new(config: AnomalyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnomalyConfig {
        &self.config
    }

    /// Severity of `observed` against `baseline`, if it is anomalous at all.
    ///
    /// A count is flagged when it clears the watch band and the absolute
    /// case floor. The critical tier needs a positive baseline mean.
    pub fn classify(&self, observed: u64, baseline: &Baseline) -> Option<SeverityFlag> {
        if observed < self.config.minimum_case_threshold {
            return None;
        }

        let observed = observed as f64;
        if observed <= baseline.mean + self.config.watch_sigma * baseline.stddev {
            return None;
        }

        if baseline.mean > 0.0 && observed >= self.config.critical_multiplier * baseline.mean {
            Some(SeverityFlag::Critical)
        } else if observed > baseline.mean + self.config.alert_sigma * baseline.stddev {
            Some(SeverityFlag::Alert)
        } else {
            Some(SeverityFlag::Watch)
        }
    }

    pub fn detect_condition(&self, observed: u64, baseline: &Baseline) -> DetectionStatus {
        if baseline.periods < self.config.minimum_baseline_periods {
            return DetectionStatus::InsufficientHistory {
                available: baseline.periods,
                required: self.config.minimum_baseline_periods,
            };
        }

        match self.classify(observed, baseline) {
            Some(flag) => DetectionStatus::Anomaly {
                flag,
                z_score: z_score(observed, baseline),
            },
            None => DetectionStatus::Normal,
        }
    }

    /// Judge every condition seen in `current` against the tracker's
    /// baselines. The tracker must not yet contain `current`'s period.
    pub fn detect(&self, current: &PeriodAggregate, tracker: &BaselineTracker) -> Detection {
        let mut detection = Detection::default();
        if current.is_unclassified() {
            return detection;
        }

        for (condition, &observed) in &current.condition_counts {
            if observed == 0 {
                continue;
            }

            let baseline = tracker.baseline(&current.geo_unit_id, condition);
            match self.detect_condition(observed, &baseline) {
                DetectionStatus::Normal => {}
                DetectionStatus::Anomaly { flag, z_score } => {
                    debug!(
                        "{} {} in {}: {} cases vs baseline {:.1} ± {:.1} ({})",
                        current.geo_name,
                        condition,
                        current.period,
                        observed,
                        baseline.mean,
                        baseline.stddev,
                        flag
                    );
                    detection.anomalies.push(Anomaly {
                        geo_unit_id: current.geo_unit_id.clone(),
                        geo_kind: current.geo_kind,
                        geo_name: current.geo_name.clone(),
                        condition_code: condition.clone(),
                        period: current.period,
                        observed_count: observed,
                        baseline_mean: baseline.mean,
                        baseline_stddev: baseline.stddev,
                        z_score,
                        severity_flag: flag,
                    });
                }
                DetectionStatus::InsufficientHistory {
                    available,
                    required,
                } => detection.gaps.push(HistoryGap {
                    geo_unit_id: current.geo_unit_id.clone(),
                    geo_kind: current.geo_kind,
                    geo_name: current.geo_name.clone(),
                    condition_code: condition.clone(),
                    period: current.period,
                    periods_available: available,
                    periods_required: required,
                }),
            }
        }

        detection
    }
}

fn z_score(observed: u64, baseline: &Baseline) -> Option<f64> {
    if baseline.stddev > 0.0 {
        Some((observed as f64 - baseline.mean) / baseline.stddev)
    } else {
        None
    }
}

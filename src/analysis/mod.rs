//! Analysis modules.
//!
//! Aggregation, baselines and anomaly detection, and the pipeline that
//! drives them over a period range.

pub mod aggregator;
pub mod anomaly;
pub mod history;
pub mod pipeline;

pub use aggregator::*;
pub use anomaly::{AnomalyConfig, AnomalyDetector, Baseline, BaselineTracker, Detection, DetectionStatus};
pub use history::{AggregateHistory, HistoryEntry};
pub use pipeline::{PipelineConfig, PipelineRun, ReportPipeline};

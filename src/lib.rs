//! epiwatch: epidemiological aggregation and outbreak reporting.
//!
//! Consultation records are ingested per period, rolled up the
//! Region → City → Locality tree, compared against rolling historical
//! baselines, and assembled into versioned reports.

pub mod analysis;
pub mod cli;
pub mod config;
pub mod error;
pub mod geography;
pub mod ingestion;
pub mod models;
pub mod period;
pub mod report;

pub use error::{EpiError, Result};

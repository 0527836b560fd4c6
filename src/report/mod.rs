//! Report assembly, rendering and archiving.

pub mod archive;
pub mod builder;
pub mod generator;

pub use archive::{write_atomically, ReportArchive, StagedFile};
pub use builder::{build, series_id, slugify, ReportRequest};
pub use generator::{generate_json_report, generate_markdown_report, stage_report, write_report, RenderOptions};

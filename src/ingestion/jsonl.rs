//! JSON-lines record store.
//!
//! Reads a single export file or a directory tree of `*.jsonl` / `*.ndjson`
//! shards, one record object per line.

use super::{select_rows, GeoScope, RawRecord, RecordBatch, RecordStore, SourceRow};
use crate::error::{EpiError, Result};
use crate::period::Period;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

const SHARD_EXTENSIONS: &[&str] = &["jsonl", "ndjson"];

/// Record store backed by JSON-lines files.
#[derive(Debug, Clone)]
pub struct JsonlRecordStore {
    root: PathBuf,
}

impl JsonlRecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Shard files in a stable order.
    pub fn shard_paths(&self) -> Result<Vec<PathBuf>> {
        if !self.root.exists() {
            return Err(EpiError::IngestionUnavailable(format!(
                "record path not found: {}",
                self.root.display()
            )));
        }

        if self.root.is_file() {
            return Ok(vec![self.root.clone()]);
        }

        let mut shards: Vec<PathBuf> = WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| {
                path.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| SHARD_EXTENSIONS.contains(&e))
            })
            .collect();

        shards.sort();
        Ok(shards)
    }

    fn read_rows(&self) -> Result<Vec<SourceRow>> {
        let mut rows = Vec::new();

        for shard in self.shard_paths()? {
            let content = fs::read(&shard).map_err(|e| {
                EpiError::IngestionUnavailable(format!("cannot read {}: {}", shard.display(), e))
            })?;

            for (line_no, bytes) in content.split(|b| *b == b'\n').enumerate() {
                let line = match std::str::from_utf8(bytes) {
                    Ok(line) => line.trim(),
                    Err(e) => {
                        rows.push(SourceRow::Unreadable(format!(
                            "{}:{}: {}",
                            shard.display(),
                            line_no + 1,
                            e
                        )));
                        continue;
                    }
                };
                if line.is_empty() {
                    continue;
                }
                rows.push(match serde_json::from_str::<RawRecord>(line) {
                    Ok(raw) => SourceRow::Parsed(raw),
                    Err(e) => SourceRow::Unreadable(format!(
                        "{}:{}: {}",
                        shard.display(),
                        line_no + 1,
                        e
                    )),
                });
            }
        }

        debug!("Read {} rows from {}", rows.len(), self.root.display());
        Ok(rows)
    }
}

impl RecordStore for JsonlRecordStore {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn fetch(&self, period: &Period, scope: &GeoScope) -> Result<RecordBatch> {
        let store = self.clone();
        let period = *period;
        let scope = scope.clone();

        tokio::task::spawn_blocking(move || -> Result<RecordBatch> {
            let rows = store.read_rows()?;
            Ok(select_rows(rows, &period, &scope, "jsonl"))
        })
        .await
        .map_err(|e| EpiError::Worker(e.to_string()))?
    }
}

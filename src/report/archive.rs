//! Versioned report archive.
//!
//! Layout: `<root>/<title-slug>-<period-range>/v<N>.json`. Every write goes
//! through a temporary file in the target directory followed by a rename,
//! so readers never observe a partial report.

use super::builder::series_id;
use crate::error::{EpiError, Result};
use crate::models::EpidemiologicalReport;
use crate::period::PeriodRange;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Content written next to its destination but not yet visible there.
///
/// Dropping a staged file discards it.
#[derive(Debug)]
pub struct StagedFile {
    tmp: NamedTempFile,
    path: PathBuf,
}

impl StagedFile {
    /// Write `content` to a temporary file in `path`'s directory.
    pub fn stage(path: &Path, content: &[u8]) -> Result<Self> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(content)?;
        tmp.as_file().sync_all()?;
        Ok(Self {
            tmp,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rename into place.
    pub fn commit(self) -> Result<()> {
        self.tmp.persist(&self.path).map_err(|e| EpiError::Io(e.error))?;
        debug!("Wrote {}", self.path.display());
        Ok(())
    }
}

/// Write `content` to `path` atomically.
pub fn write_atomically(path: &Path, content: &[u8]) -> Result<()> {
    StagedFile::stage(path, content)?.commit()
}

/// Directory of immutable, versioned reports.
#[derive(Debug, Clone)]
pub struct ReportArchive {
    root: PathBuf,
}

impl ReportArchive {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn series_dir(&self, title: &str, range: &PeriodRange) -> PathBuf {
        self.root.join(series_id(title, range))
    }

    /// Archived versions of a report series, ascending.
    pub fn versions(&self, title: &str, range: &PeriodRange) -> Result<Vec<u32>> {
        let dir = self.series_dir(title, range);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut versions: Vec<u32> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name();
                let name = name.to_str()?;
                name.strip_prefix('v')?
                    .strip_suffix(".json")?
                    .parse::<u32>()
                    .ok()
            })
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    pub fn next_version(&self, title: &str, range: &PeriodRange) -> Result<u32> {
        Ok(self
            .versions(title, range)?
            .last()
            .map_or(1, |latest| latest + 1))
    }

    /// Store a report under its version. An archived version is never
    /// overwritten.
    pub fn store(&self, report: &EpidemiologicalReport) -> Result<PathBuf> {
        let dir = self.series_dir(&report.title, &report.period_range);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("v{}.json", report.version));

        let json = serde_json::to_vec_pretty(report)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist_noclobber(&path).map_err(|e| {
            if e.error.kind() == std::io::ErrorKind::AlreadyExists {
                EpiError::Archive(format!(
                    "{} version {} is already archived",
                    report.id, report.version
                ))
            } else {
                EpiError::Io(e.error)
            }
        })?;

        info!("Archived {} at {}", report.id, path.display());
        Ok(path)
    }

    pub fn load(&self, title: &str, range: &PeriodRange, version: u32) -> Result<EpidemiologicalReport> {
        let path = self
            .series_dir(title, range)
            .join(format!("v{}.json", version));
        if !path.exists() {
            return Err(EpiError::Archive(format!(
                "no version {} of '{}' for {}",
                version, title, range
            )));
        }
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::PipelineRun;
    use crate::geography::tests::sample_index;
    use crate::period::Period;
    use crate::report::builder::{build, ReportRequest};
    use chrono::{TimeZone, Utc};

    fn report(version: u32) -> EpidemiologicalReport {
        let geo = sample_index();
        let scope = geo.scope(&["gabu".to_string()]).unwrap();
        let request = ReportRequest::new(
            "Gabu Monthly",
            PeriodRange::single(Period::month(2024, 3).unwrap()),
            "epiwatch",
        )
        .with_version(version)
        .generated_at(Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap());
        build(&request, &scope, PipelineRun::default()).unwrap()
    }

    #[test]
    fn test_versions_increment() {
        let dir = tempfile::tempdir().unwrap();
        let archive = ReportArchive::open(dir.path().join("archive")).unwrap();
        let range = report(1).period_range;

        assert_eq!(archive.next_version("Gabu Monthly", &range).unwrap(), 1);
        archive.store(&report(1)).unwrap();
        archive.store(&report(2)).unwrap();

        assert_eq!(archive.versions("Gabu Monthly", &range).unwrap(), vec![1, 2]);
        assert_eq!(archive.next_version("Gabu Monthly", &range).unwrap(), 3);

        let loaded = archive.load("Gabu Monthly", &range, 2).unwrap();
        assert_eq!(loaded, report(2));
    }

    #[test]
    fn test_archived_version_is_immutable() {
        let dir = tempfile::tempdir().unwrap();
        let archive = ReportArchive::open(dir.path()).unwrap();

        let path = archive.store(&report(1)).unwrap();
        let before = fs::read(&path).unwrap();

        let err = archive.store(&report(1)).unwrap_err();
        assert!(matches!(err, EpiError::Archive(_)));
        assert_eq!(fs::read(&path).unwrap(), before);

        // No temporary files left behind
        let leftovers = fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_staged_file_is_invisible_until_commit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.md");

        let staged = StagedFile::stage(&path, b"draft").unwrap();
        assert!(!path.exists());
        drop(staged);
        assert!(!path.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);

        StagedFile::stage(&path, b"final").unwrap().commit().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "final");
    }

    #[test]
    fn test_write_atomically_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("report.md");

        write_atomically(&path, b"first").unwrap();
        write_atomically(&path, b"second").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
    }
}

//! Removal of temporary batch artifacts.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use contracts::{CacheConfig, ContractError};
use ingestion::is_batch_file;
use tracing::{debug, instrument};

/// Deletes prepared batch files once a stage no longer needs them.
///
/// Only files directly inside `dir` named like a prepared batch under
/// `prefix` (`<prefix>.<sample>.<sequence>.batch`) are touched. A disabled
/// janitor never touches the filesystem.
#[derive(Debug, Clone)]
pub struct ResourceJanitor {
    dir: PathBuf,
    prefix: String,
    enabled: bool,
}

impl ResourceJanitor {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>, enabled: bool) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            enabled,
        }
    }

    /// Enabled when batches or subfunction results are cached on disk
    pub fn from_config(cache: &CacheConfig) -> Self {
        Self::new(&cache.temp_dir, &cache.batch_prefix, cache.needs_cleanup())
    }

    pub fn disabled() -> Self {
        Self::new(PathBuf::new(), String::new(), false)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Remove every matching file and return how many were removed.
    ///
    /// A missing directory counts as already clean.
    #[instrument(name = "janitor_cleanup", skip(self), fields(dir = %self.dir.display()))]
    pub fn cleanup(&self) -> Result<usize, ContractError> {
        if !self.enabled {
            return Ok(0);
        }

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            if !is_batch_file(&self.prefix, &name.to_string_lossy()) {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                // removed concurrently
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        if removed > 0 {
            debug!(removed, prefix = %self.prefix, "temporary batch files removed");
        }
        observability::record_cleanup(removed);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn touch(dir: &std::path::Path, name: &str) {
        fs::write(dir.join(name), b"x").unwrap();
    }

    #[test]
    fn removes_only_prefixed_files() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "batch.case_1.000000.batch");
        touch(dir.path(), "batch.case_1.000001.batch");
        touch(dir.path(), "notes.txt");
        fs::create_dir(dir.path().join("batch_dir")).unwrap();

        let janitor = ResourceJanitor::new(dir.path(), "batch", true);
        assert_eq!(janitor.cleanup().unwrap(), 2);
        assert!(dir.path().join("notes.txt").exists());
        assert!(dir.path().join("batch_dir").exists());
    }

    #[test]
    fn keeps_outputs_that_share_the_prefix() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "batch.case_1.000000.batch");
        touch(dir.path(), "batch_report.csv");
        touch(dir.path(), "batch.log");

        let janitor = ResourceJanitor::new(dir.path(), "batch", true);
        assert_eq!(janitor.cleanup().unwrap(), 1);
        assert!(dir.path().join("batch_report.csv").exists());
        assert!(dir.path().join("batch.log").exists());
    }

    #[test]
    fn empty_prefix_removes_nothing() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "case_00001_prediction.npy");
        touch(dir.path(), "history.json");

        let janitor = ResourceJanitor::new(dir.path(), "", true);
        assert_eq!(janitor.cleanup().unwrap(), 0);
        assert!(dir.path().join("case_00001_prediction.npy").exists());
        assert!(dir.path().join("history.json").exists());
    }

    #[test]
    fn cleanup_is_idempotent() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "batch.a.000000.batch");

        let janitor = ResourceJanitor::new(dir.path(), "batch", true);
        assert_eq!(janitor.cleanup().unwrap(), 1);
        assert_eq!(janitor.cleanup().unwrap(), 0);
    }

    #[test]
    fn missing_directory_is_clean() {
        let dir = tempdir().unwrap();
        let janitor = ResourceJanitor::new(dir.path().join("absent"), "batch", true);
        assert_eq!(janitor.cleanup().unwrap(), 0);
    }

    #[test]
    fn disabled_janitor_keeps_files() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "batch.a.000000.batch");

        let mut cache = CacheConfig::default();
        cache.temp_dir = dir.path().to_path_buf();
        let janitor = ResourceJanitor::from_config(&cache);
        assert!(!janitor.is_enabled());
        assert_eq!(janitor.cleanup().unwrap(), 0);
        assert!(dir.path().join("batch.a.000000.batch").exists());

        cache.prepare_batches = true;
        assert_eq!(ResourceJanitor::from_config(&cache).cleanup().unwrap(), 1);
    }
}

//! On-disk prepared batches.
//!
//! Files are named `<prefix>.<sample>.<sequence>.batch` inside the temp
//! directory. [`is_batch_file`] is the one matching rule the resource
//! janitor uses, so unrelated files that merely share the prefix survive.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use contracts::{Batch, CacheConfig};
use tracing::trace;

use crate::error::{IngestionError, Result};

/// Extension of every prepared batch file
pub const BATCH_EXTENSION: &str = "batch";

/// Whether `name` is a batch file written under `prefix`.
///
/// Requires the `<prefix>.` lead and the `.batch` extension with something
/// in between; an empty prefix matches nothing.
pub fn is_batch_file(prefix: &str, name: &str) -> bool {
    if prefix.is_empty() {
        return false;
    }
    name.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('.'))
        .and_then(|rest| rest.strip_suffix(BATCH_EXTENSION))
        .and_then(|rest| rest.strip_suffix('.'))
        .is_some_and(|middle| !middle.is_empty())
}

/// Writes prepared batches as bincode files and reads them back.
#[derive(Debug)]
pub struct BatchFileStore {
    dir: PathBuf,
    prefix: String,
    sequence: AtomicU64,
}

impl BatchFileStore {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(&config.temp_dir, &config.batch_prefix)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Persist a batch and return its path
    pub fn store(&self, batch: &Batch) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).map_err(|e| IngestionError::batch_file(&self.dir, e))?;

        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let path = self.dir.join(format!(
            "{}.{}.{seq:06}.{BATCH_EXTENSION}",
            self.prefix,
            file_safe(batch.sample_id.as_str())
        ));

        let file = File::create(&path).map_err(|e| IngestionError::batch_file(&path, e))?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, batch)
            .map_err(|e| IngestionError::batch_file(&path, e))?;
        writer
            .flush()
            .map_err(|e| IngestionError::batch_file(&path, e))?;

        trace!(path = %path.display(), patches = batch.len(), "batch stored");
        Ok(path)
    }

    /// Read a batch written by [`store`](Self::store)
    pub fn load(&self, path: &Path) -> Result<Batch> {
        let file = File::open(path).map_err(|e| IngestionError::batch_file(path, e))?;
        bincode::deserialize_from(BufReader::new(file))
            .map_err(|e| IngestionError::batch_file(path, e))
    }
}

fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

//! Ingestion error types

use std::path::PathBuf;

use contracts::{ContractError, SampleId};
use thiserror::Error;

/// Ingestion error
#[derive(Debug, Error)]
pub enum IngestionError {
    /// Sample id unknown to the volume source
    #[error("sample {sample_id} not found")]
    SampleNotFound { sample_id: SampleId },

    /// Volume file could not be read or decoded
    #[error("failed to load sample {sample_id}: {message}")]
    LoadFailed { sample_id: SampleId, message: String },

    /// Loaded arrays disagree with the configured layout
    #[error("sample {sample_id} has an unexpected layout: {message}")]
    Layout { sample_id: SampleId, message: String },

    /// Training batch requested for a sample without ground truth
    #[error("sample {sample_id} has no segmentation")]
    MissingSegmentation { sample_id: SampleId },

    /// Temporary batch file could not be written or read back
    #[error("batch file {path}: {message}")]
    BatchFile { path: PathBuf, message: String },

    /// Prefetch worker stopped abnormally
    #[error("prefetch worker failed: {message}")]
    Worker { message: String },
}

impl IngestionError {
    pub fn layout(sample_id: &SampleId, message: impl Into<String>) -> Self {
        Self::Layout {
            sample_id: sample_id.clone(),
            message: message.into(),
        }
    }

    pub fn batch_file(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::BatchFile {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Sample the error is attributed to, if any
    pub fn sample_id(&self) -> Option<&SampleId> {
        match self {
            Self::SampleNotFound { sample_id }
            | Self::LoadFailed { sample_id, .. }
            | Self::Layout { sample_id, .. }
            | Self::MissingSegmentation { sample_id } => Some(sample_id),
            Self::BatchFile { .. } | Self::Worker { .. } => None,
        }
    }
}

impl From<IngestionError> for ContractError {
    fn from(err: IngestionError) -> Self {
        let sample_id = err.sample_id().cloned().unwrap_or_default();
        ContractError::batch_stream(&sample_id, err.to_string())
    }
}

/// Ingestion Result alias
pub type Result<T> = std::result::Result<T, IngestionError>;

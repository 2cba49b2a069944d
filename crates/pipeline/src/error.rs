//! Pipeline error types

use std::fmt;

use contracts::{ContractError, SampleId};
use thiserror::Error;

/// Pipeline invocation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineMode {
    Train,
    Predict,
    Evaluate,
}

impl fmt::Display for PipelineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Train => "train",
            Self::Predict => "predict",
            Self::Evaluate => "evaluate",
        };
        f.write_str(name)
    }
}

/// Per-sample prediction state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleStage {
    Fetching,
    Infer,
    Reassemble,
    Discretize,
    PostProcess,
    Emit,
}

impl fmt::Display for SampleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Fetching => "fetching",
            Self::Infer => "infer",
            Self::Reassemble => "reassemble",
            Self::Discretize => "discretize",
            Self::PostProcess => "post-process",
            Self::Emit => "emit",
        };
        f.write_str(name)
    }
}

/// Orchestrator error
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A single sample failed; other samples are unaffected
    #[error("sample '{sample_id}' failed at {stage}: {source}")]
    Sample {
        sample_id: SampleId,
        stage: SampleStage,
        #[source]
        source: ContractError,
    },

    /// A train or evaluate stage failed
    #[error("{mode} stage failed: {source}")]
    Stage {
        mode: PipelineMode,
        #[source]
        source: ContractError,
    },

    /// Temporary file cleanup failed after an otherwise successful stage
    #[error("cleanup after {mode} failed: {source}")]
    Cleanup {
        mode: PipelineMode,
        #[source]
        source: ContractError,
    },

    /// Invalid configuration detected at construction
    #[error("pipeline configuration error: {0}")]
    Config(#[from] ContractError),

    /// The batch producer worker died
    #[error("batch prefetch worker failed: {message}")]
    Prefetch { message: String },
}

impl PipelineError {
    pub fn sample(sample_id: &SampleId, stage: SampleStage, source: ContractError) -> Self {
        Self::Sample {
            sample_id: sample_id.clone(),
            stage,
            source,
        }
    }

    pub fn stage(mode: PipelineMode, source: ContractError) -> Self {
        Self::Stage { mode, source }
    }

    /// Sample the error belongs to, if any
    pub fn sample_id(&self) -> Option<&SampleId> {
        match self {
            Self::Sample { sample_id, .. } => Some(sample_id),
            _ => None,
        }
    }
}

impl From<ingestion::IngestionError> for PipelineError {
    fn from(err: ingestion::IngestionError) -> Self {
        Self::Prefetch {
            message: err.to_string(),
        }
    }
}

//! Layered error definitions
//!
//! Categorized by source: config / patching / collaborators / sink

use thiserror::Error;

use crate::SampleId;

/// Unified error type
#[derive(Debug, Error)]
pub enum ContractError {
    // ===== Configuration Errors =====
    /// Configuration parse error
    #[error("config parse error: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration validation error
    #[error("config validation error at '{field}': {message}")]
    ConfigValidation { field: String, message: String },

    // ===== Patch Geometry Errors =====
    /// Overlap leaves no positive stride along an axis
    #[error("invalid overlap on axis {axis}: overlap {overlap} must be smaller than window {window}")]
    InvalidOverlap {
        axis: usize,
        overlap: usize,
        window: usize,
    },

    /// A shape record already exists and has not been consumed
    #[error("duplicate shape record for sample '{sample_id}'")]
    DuplicateShape { sample_id: SampleId },

    /// No shape record exists (never decomposed, or already reconstructed)
    #[error("missing shape record for sample '{sample_id}'")]
    MissingShape { sample_id: SampleId },

    /// Reconstruction grid and received patches disagree
    #[error(
        "reconstruction coverage error: expected {expected_patches} patches, \
         received {received_patches}, {unwritten_voxels} voxels unwritten"
    )]
    ReconstructionCoverage {
        expected_patches: usize,
        received_patches: usize,
        unwritten_voxels: usize,
    },

    /// Array has an unexpected shape
    #[error("shape mismatch for {what}: expected {expected:?}, got {got:?}")]
    PatchShape {
        what: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    // ===== Collaborator Errors =====
    /// Batch production failed
    #[error("batch stream error for sample '{sample_id}': {message}")]
    BatchStream { sample_id: SampleId, message: String },

    /// Model call failed
    #[error("model '{model}' error: {message}")]
    Model { model: String, message: String },

    /// Post-processor failed
    #[error("post-processor '{name}' error: {message}")]
    PostProcess { name: String, message: String },

    // ===== Sink Errors =====
    /// Sink write error
    #[error("sink '{sink_name}' write error: {message}")]
    SinkWrite { sink_name: String, message: String },

    // ===== General Errors =====
    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl ContractError {
    /// Create configuration parse error
    pub fn config_parse(message: impl Into<String>) -> Self {
        Self::ConfigParse {
            message: message.into(),
            source: None,
        }
    }

    /// Create configuration validation error
    pub fn config_validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create shape mismatch error
    pub fn patch_shape(what: &'static str, expected: &[usize], got: &[usize]) -> Self {
        Self::PatchShape {
            what,
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }

    /// Create batch stream error
    pub fn batch_stream(sample_id: &SampleId, message: impl Into<String>) -> Self {
        Self::BatchStream {
            sample_id: sample_id.clone(),
            message: message.into(),
        }
    }

    /// Create model error
    pub fn model(model: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Model {
            model: model.into(),
            message: message.into(),
        }
    }

    /// Create post-processor error
    pub fn post_process(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PostProcess {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create sink write error
    pub fn sink_write(sink_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SinkWrite {
            sink_name: sink_name.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_errors_name_the_sample() {
        let err = ContractError::MissingShape {
            sample_id: "case_00012".into(),
        };
        assert!(err.to_string().contains("case_00012"));

        let err = ContractError::DuplicateShape {
            sample_id: "case_00012".into(),
        };
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn invalid_overlap_message() {
        let err = ContractError::InvalidOverlap {
            axis: 0,
            overlap: 40,
            window: 40,
        };
        assert_eq!(
            err.to_string(),
            "invalid overlap on axis 0: overlap 40 must be smaller than window 40"
        );
    }
}

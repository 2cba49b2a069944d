//! Error types for CLI operations.

use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Data directory holds no loadable sample
    #[error("No samples found in {path}")]
    NoSamples { path: String },

    /// A requested sample is not in the data directory
    #[error("Unknown sample '{sample_id}' (not found in {path})")]
    UnknownSample { sample_id: String, path: String },

    /// Train/validation split left one side empty
    #[error("Cannot split {total} samples for validation: {message}")]
    Split { total: usize, message: String },

    /// Some samples could not be predicted
    #[error("{failed} of {total} samples failed")]
    SamplesFailed { failed: usize, total: usize },

    /// Run interrupted by a signal
    #[error("Interrupted by shutdown signal")]
    Interrupted,
}

impl CliError {
    pub fn config_not_found(path: impl Into<String>) -> Self {
        Self::ConfigNotFound { path: path.into() }
    }

    pub fn split(total: usize, message: impl Into<String>) -> Self {
        Self::Split {
            total,
            message: message.into(),
        }
    }
}

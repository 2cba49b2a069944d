//! Dispatcher error types

use thiserror::Error;

/// Errors raised while building sinks from configuration
#[derive(Debug, Error)]
pub enum DispatcherError {
    /// Sink could not be constructed (bad params, unwritable output directory)
    #[error("failed to create sink '{name}': {message}")]
    SinkCreation { name: String, message: String },

    /// Two sinks share a name; metrics and logs are keyed by it
    #[error("sink name '{name}' is used more than once")]
    DuplicateSink { name: String },
}

impl DispatcherError {
    pub fn sink_creation(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SinkCreation {
            name: name.into(),
            message: message.into(),
        }
    }
}

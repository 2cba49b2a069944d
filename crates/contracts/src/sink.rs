//! PredictionSink trait - output interface for finished predictions
//!
//! Defines the abstract interface for Sinks.

use crate::{ContractError, LabelVolume, SampleId};

/// Prediction output trait
///
/// All sink implementations must implement this trait.
#[trait_variant::make(PredictionSink: Send)]
pub trait LocalPredictionSink {
    /// Sink name (used for logging/metrics)
    fn name(&self) -> &str;

    /// Write the label volume predicted for a sample
    ///
    /// # Errors
    /// Returns write error (should include context)
    async fn write(&mut self, sample_id: &SampleId, volume: &LabelVolume)
        -> Result<(), ContractError>;

    /// Flush buffer (if any)
    async fn flush(&mut self) -> Result<(), ContractError>;

    /// Close sink
    async fn close(&mut self) -> Result<(), ContractError>;
}

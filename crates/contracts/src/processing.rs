//! Post-processing and scoring capabilities.

use ndarray::ArrayViewD;

use crate::{ContractError, LabelVolume};

/// Mutates a discrete prediction in place.
///
/// Post-processors run in registration order after argmax.
pub trait PostProcessor: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, volume: &mut LabelVolume) -> Result<(), ContractError>;
}

/// Scores a prediction against one-hot ground truth.
///
/// Both arrays are classes-last with identical shapes.
pub trait Metric: Send + Sync {
    /// Identifier used in configuration and history records
    fn name(&self) -> &str;

    fn score(&self, predicted: ArrayViewD<'_, f32>, truth: ArrayViewD<'_, f32>) -> f32;
}

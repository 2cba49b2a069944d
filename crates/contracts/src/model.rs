//! SegmentationModel trait - external learning library boundary

use std::path::{Path, PathBuf};

use ndarray::{ArrayD, ArrayViewD};

use crate::ContractError;

/// Locations of a persisted model: a structural descriptor and a parameter
/// blob sharing one path prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPaths {
    /// `<prefix>.model.<ext>`
    pub descriptor: PathBuf,
    /// `<prefix>.weights.<ext>`
    pub weights: PathBuf,
}

impl ModelPaths {
    /// Derive both paths from a prefix and per-artifact extensions.
    ///
    /// # Example
    /// ```
    /// use contracts::ModelPaths;
    ///
    /// let paths = ModelPaths::from_prefix("runs/fold0", "json", "bin");
    /// assert_eq!(paths.descriptor.to_str(), Some("runs/fold0.model.json"));
    /// assert_eq!(paths.weights.to_str(), Some("runs/fold0.weights.bin"));
    /// ```
    pub fn from_prefix(prefix: impl AsRef<Path>, descriptor_ext: &str, weights_ext: &str) -> Self {
        let prefix = prefix.as_ref().as_os_str().to_owned();

        let mut descriptor = prefix.clone();
        descriptor.push(format!(".model.{descriptor_ext}"));

        let mut weights = prefix;
        weights.push(format!(".weights.{weights_ext}"));

        Self {
            descriptor: PathBuf::from(descriptor),
            weights: PathBuf::from(weights),
        }
    }
}

/// A trainable per-voxel classifier.
///
/// Arrays are channels-last with a leading batch axis. `predict` returns
/// scores with the same spatial shape as its input and `classes` as the last
/// axis.
pub trait SegmentationModel: Send {
    /// Model name (used for logging/errors)
    fn name(&self) -> &str;

    /// Per-voxel per-class scores for a batch of images
    fn predict(&mut self, images: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, ContractError>;

    /// One parameter update; returns the batch loss
    fn train_on_batch(
        &mut self,
        images: ArrayViewD<'_, f32>,
        labels: ArrayViewD<'_, f32>,
    ) -> Result<f32, ContractError>;

    /// Loss on a batch without updating parameters
    fn test_on_batch(
        &mut self,
        images: ArrayViewD<'_, f32>,
        labels: ArrayViewD<'_, f32>,
    ) -> Result<f32, ContractError>;

    /// File extensions of (descriptor, weights)
    fn file_extensions(&self) -> (&'static str, &'static str);

    /// Persist descriptor and weights
    fn save(&self, paths: &ModelPaths) -> Result<(), ContractError>;

    /// Restore descriptor and weights
    fn load(&mut self, paths: &ModelPaths) -> Result<(), ContractError>;

    /// Current parameters as a flat vector
    fn weights(&self) -> Vec<f32>;

    /// Replace the parameters
    fn set_weights(&mut self, weights: &[f32]) -> Result<(), ContractError>;
}

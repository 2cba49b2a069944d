//! BatchStream trait - batch source abstraction
//!
//! Decouples the orchestrator from how samples are loaded, decomposed and
//! batched. The orchestrator only pulls `Batch` values in order.

use crate::{Batch, ContractError, SampleId};

/// Lazy, finite sequence of batches.
///
/// Must be `Send`: iteration is moved onto a blocking worker so batch
/// preparation overlaps model inference.
pub type BatchIter = Box<dyn Iterator<Item = Result<Batch, ContractError>> + Send>;

/// Stream flavour requested by a pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamMode {
    /// Labels are attached and training-style decomposition (e.g. random crops) is used
    pub training: bool,

    /// Batches feed validation rather than parameter updates
    pub validation: bool,

    /// Reorder samples (never the patches within a sample)
    pub shuffle: bool,
}

impl StreamMode {
    /// Inference: no labels, no shuffling
    pub fn inference() -> Self {
        Self::default()
    }

    pub fn training(shuffle: bool) -> Self {
        Self {
            training: true,
            validation: false,
            shuffle,
        }
    }

    pub fn validation(shuffle: bool) -> Self {
        Self {
            training: true,
            validation: true,
            shuffle,
        }
    }
}

/// Batch producer.
///
/// # Contract
///
/// - For inference under a patch-based analysis mode, the implementation
///   records each sample's original shape in the shape cache exactly once,
///   before the first batch of that sample is yielded.
/// - Patches of a sample are yielded in grid traversal order.
/// - Shuffling reorders samples only.
pub trait BatchStream: Send + Sync {
    /// Start a stream over the given samples
    fn stream(&self, samples: &[SampleId], mode: StreamMode) -> Result<BatchIter, ContractError>;
}

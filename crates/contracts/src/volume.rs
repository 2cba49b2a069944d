//! Volume, sample and batch data structures.

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::SampleId;

/// Per-voxel class scores, classes-last: `[spatial..., classes]`.
pub type ScoreVolume = ArrayD<f32>;

/// Discrete per-voxel class labels: `[spatial...]`.
pub type LabelVolume = ArrayD<u16>;

/// Spatial extents of a volume, e.g. width x height [x depth].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolumeShape(Vec<usize>);

impl VolumeShape {
    pub fn new(extents: impl Into<Vec<usize>>) -> Self {
        Self(extents.into())
    }

    /// Number of spatial axes
    #[inline]
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn extents(&self) -> &[usize] {
        &self.0
    }

    /// Total voxel count
    pub fn voxels(&self) -> usize {
        self.0.iter().product()
    }
}

impl From<&[usize]> for VolumeShape {
    fn from(extents: &[usize]) -> Self {
        Self(extents.to_vec())
    }
}

impl From<Vec<usize>> for VolumeShape {
    fn from(extents: Vec<usize>) -> Self {
        Self(extents)
    }
}

impl fmt::Display for VolumeShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(usize::to_string).collect();
        write!(f, "{}", parts.join("x"))
    }
}

/// One input volume as delivered by a data source.
#[derive(Debug, Clone)]
pub struct Sample {
    pub id: SampleId,

    /// Image intensities, channels-last: `[spatial..., channels]`
    pub image: ArrayD<f32>,

    /// Ground-truth labels `[spatial...]` (absent at inference time)
    pub segmentation: Option<LabelVolume>,
}

impl Sample {
    /// Spatial shape of the image (all axes but the channel axis)
    pub fn spatial_shape(&self) -> VolumeShape {
        let shape = self.image.shape();
        VolumeShape::from(&shape[..shape.len().saturating_sub(1)])
    }
}

/// A batch of patches (or whole volumes) belonging to one sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub sample_id: SampleId,

    /// `[n, spatial..., channels]`
    pub images: ArrayD<f32>,

    /// One-hot labels `[n, spatial..., classes]` (training / validation only)
    pub labels: Option<ArrayD<f32>>,
}

impl Batch {
    /// Number of patches in the batch
    pub fn len(&self) -> usize {
        self.images.shape().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

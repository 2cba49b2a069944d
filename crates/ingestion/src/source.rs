//! Volume sources: where samples come from.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use contracts::{LabelVolume, Sample, SampleId};
use ndarray::{ArrayD, Axis};
use ndarray_npy::read_npy;
use tracing::{debug, instrument};

use crate::error::{IngestionError, Result};

/// Loads samples by id.
pub trait VolumeSource: Send + Sync {
    /// Every sample id the source can load, in a stable order
    fn sample_ids(&self) -> Vec<SampleId>;

    /// Load one sample; the image is channels-last
    fn load(&self, sample_id: &SampleId) -> Result<Sample>;
}

/// Samples held in memory (tests and embedding applications).
#[derive(Debug, Default)]
pub struct InMemorySource {
    samples: BTreeMap<SampleId, Sample>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sample, replacing one with the same id
    pub fn insert(&mut self, sample: Sample) {
        self.samples.insert(sample.id.clone(), sample);
    }

    pub fn with_sample(mut self, sample: Sample) -> Self {
        self.insert(sample);
        self
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl VolumeSource for InMemorySource {
    fn sample_ids(&self) -> Vec<SampleId> {
        self.samples.keys().cloned().collect()
    }

    fn load(&self, sample_id: &SampleId) -> Result<Sample> {
        self.samples
            .get(sample_id)
            .cloned()
            .ok_or_else(|| IngestionError::SampleNotFound {
                sample_id: sample_id.clone(),
            })
    }
}

/// File name of the image array inside a sample directory
pub const IMAGE_FILE: &str = "imaging.npy";
/// File name of the optional label array inside a sample directory
pub const SEGMENTATION_FILE: &str = "segmentation.npy";

/// Directory of `.npy` samples.
///
/// Layout: `<root>/<sample_id>/imaging.npy` (`f32`, `[spatial...]` or
/// `[spatial..., channels]`) and optionally `<root>/<sample_id>/segmentation.npy`
/// (`u16`, `[spatial...]`).
#[derive(Debug, Clone)]
pub struct NpyDirSource {
    root: PathBuf,
    spatial_rank: usize,
}

impl NpyDirSource {
    /// `spatial_rank` decides whether a single-channel image without an
    /// explicit channel axis needs one appended.
    pub fn new(root: impl Into<PathBuf>, spatial_rank: usize) -> Self {
        Self {
            root: root.into(),
            spatial_rank,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn sample_dir(&self, sample_id: &SampleId) -> PathBuf {
        self.root.join(sample_id.as_str())
    }
}

impl VolumeSource for NpyDirSource {
    fn sample_ids(&self) -> Vec<SampleId> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut ids: Vec<SampleId> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().join(IMAGE_FILE).is_file())
            .filter_map(|entry| entry.file_name().to_str().map(SampleId::from))
            .collect();
        ids.sort();
        ids
    }

    #[instrument(name = "npy_load", skip(self), fields(sample_id = %sample_id))]
    fn load(&self, sample_id: &SampleId) -> Result<Sample> {
        let dir = self.sample_dir(sample_id);
        let image_path = dir.join(IMAGE_FILE);
        if !image_path.is_file() {
            return Err(IngestionError::SampleNotFound {
                sample_id: sample_id.clone(),
            });
        }

        let load_failed = |e: &dyn std::fmt::Display| IngestionError::LoadFailed {
            sample_id: sample_id.clone(),
            message: e.to_string(),
        };

        let mut image: ArrayD<f32> = read_npy(&image_path).map_err(|e| load_failed(&e))?;
        if image.ndim() == self.spatial_rank {
            image = image.insert_axis(Axis(self.spatial_rank));
        }

        let seg_path = dir.join(SEGMENTATION_FILE);
        let segmentation = if seg_path.is_file() {
            let seg: LabelVolume = read_npy(&seg_path).map_err(|e| load_failed(&e))?;
            Some(seg)
        } else {
            None
        };

        debug!(shape = ?image.shape(), labelled = segmentation.is_some(), "sample loaded");
        Ok(Sample {
            id: sample_id.clone(),
            image,
            segmentation,
        })
    }
}

//! Preprocessor: the `BatchStream` implementation.
//!
//! Loads samples, validates their layout, cuts them into patches (grid or
//! random crop, per analysis mode), attaches one-hot labels for training and
//! splits the result into batches. Under a patch-based analysis mode, the
//! original shape of every sample decomposed for inference is recorded in the
//! shape cache before its first batch leaves the stream.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use contracts::{
    AnalysisMode, Batch, BatchIter, BatchStream, ContractError, LabelVolume, PipelineBlueprint,
    SampleId, StreamMode,
};
use ndarray::{ArrayD, Axis, IxDyn, Slice, Zip};
use patching::{decompose, window_slice, PatchGeometry, ShapeCache};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{debug, instrument};

use crate::batch_files::BatchFileStore;
use crate::error::IngestionError;
use crate::source::VolumeSource;

/// Layout and decomposition settings taken from the blueprint
#[derive(Debug, Clone)]
struct Settings {
    mode: AnalysisMode,
    geometry: Option<PatchGeometry>,
    spatial_rank: usize,
    channels: usize,
    classes: usize,
    batch_size: usize,
    seed: Option<u64>,
}

/// Batch producer over a [`VolumeSource`].
///
/// Cheap to clone; clones share the source, the shape cache and the batch
/// file store.
#[derive(Clone)]
pub struct Preprocessor {
    source: Arc<dyn VolumeSource>,
    shape_cache: Arc<ShapeCache>,
    settings: Arc<Settings>,
    batch_files: Option<Arc<BatchFileStore>>,
    streams_started: Arc<AtomicU64>,
}

impl Preprocessor {
    /// # Errors
    /// Patch geometry errors (`InvalidOverlap`, zero window) for patch-based
    /// analysis modes.
    pub fn new(
        source: Arc<dyn VolumeSource>,
        shape_cache: Arc<ShapeCache>,
        blueprint: &PipelineBlueprint,
    ) -> Result<Self, ContractError> {
        let analysis = &blueprint.analysis;
        let geometry = if analysis.mode.is_patchwise() {
            Some(PatchGeometry::new(&analysis.patch_shape, &analysis.overlap)?)
        } else {
            None
        };

        let batch_files = blueprint
            .cache
            .prepare_batches
            .then(|| Arc::new(BatchFileStore::from_config(&blueprint.cache)));

        Ok(Self {
            source,
            shape_cache,
            settings: Arc::new(Settings {
                mode: analysis.mode,
                geometry,
                spatial_rank: blueprint.data.spatial_rank(),
                channels: blueprint.data.channels,
                classes: blueprint.data.classes,
                batch_size: analysis.batch_size.max(1),
                seed: blueprint.training.seed,
            }),
            batch_files,
            streams_started: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn shape_cache(&self) -> &Arc<ShapeCache> {
        &self.shape_cache
    }

    pub fn source(&self) -> &Arc<dyn VolumeSource> {
        &self.source
    }

    /// Every stream gets its own generator; seeded runs stay reproducible
    /// while successive epochs still see different orders and crops.
    fn next_rng(&self) -> StdRng {
        let stream = self.streams_started.fetch_add(1, Ordering::Relaxed);
        match self.settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(stream)),
            None => StdRng::from_os_rng(),
        }
    }

    /// Turn one sample into its batches.
    #[instrument(name = "preprocess_sample", skip(self, rng), fields(sample_id = %sample_id))]
    fn prepare_sample(
        &self,
        sample_id: &SampleId,
        mode: StreamMode,
        rng: &mut StdRng,
    ) -> Result<Vec<Batch>, ContractError> {
        let settings = &*self.settings;
        let sample = self.source.load(sample_id)?;
        self.check_layout(sample_id, &sample.image, sample.segmentation.as_ref())?;

        let labels = if mode.training {
            let segmentation = sample.segmentation.as_ref().ok_or_else(|| {
                IngestionError::MissingSegmentation {
                    sample_id: sample_id.clone(),
                }
            })?;
            Some(one_hot(sample_id, segmentation, settings.classes)?)
        } else {
            None
        };

        let (images, labels) = match (settings.mode, &settings.geometry) {
            (AnalysisMode::PatchwiseCrop, Some(geometry)) if mode.training => {
                random_crop(&sample.image, labels.as_ref(), geometry, rng)
            }
            (AnalysisMode::PatchwiseCrop | AnalysisMode::PatchwiseGrid, Some(geometry)) => {
                let images = decompose(sample.image.view(), geometry)?;
                let labels = labels
                    .map(|l| decompose(l.view(), geometry))
                    .transpose()?;
                if !mode.training {
                    self.shape_cache
                        .put(sample_id.clone(), sample.spatial_shape())?;
                }
                (images, labels)
            }
            _ => (
                sample.image.insert_axis(Axis(0)),
                labels.map(|l| l.insert_axis(Axis(0))),
            ),
        };

        let batches = split_batches(sample_id, &images, labels.as_ref(), settings.batch_size);
        debug!(
            patches = images.len_of(Axis(0)),
            batches = batches.len(),
            "sample prepared"
        );
        Ok(batches)
    }

    /// Prepare every sample in `order` and write its batches to `store`
    fn prepare_to_disk(
        &self,
        store: &BatchFileStore,
        order: &[SampleId],
        mode: StreamMode,
        rng: &mut StdRng,
    ) -> Result<Vec<PathBuf>, ContractError> {
        let mut paths = Vec::new();
        for sample_id in order {
            for batch in self.prepare_sample(sample_id, mode, rng)? {
                paths.push(store.store(&batch)?);
            }
        }
        debug!(files = paths.len(), dir = %store.dir().display(), "batches prepared on disk");
        Ok(paths)
    }

    fn check_layout(
        &self,
        sample_id: &SampleId,
        image: &ArrayD<f32>,
        segmentation: Option<&LabelVolume>,
    ) -> Result<(), IngestionError> {
        let settings = &*self.settings;
        let shape = image.shape();
        if shape.len() != settings.spatial_rank + 1 {
            return Err(IngestionError::layout(
                sample_id,
                format!(
                    "image rank {} does not match {} spatial axes plus channels",
                    shape.len(),
                    settings.spatial_rank
                ),
            ));
        }
        if shape[settings.spatial_rank] != settings.channels {
            return Err(IngestionError::layout(
                sample_id,
                format!(
                    "image has {} channels, configured {}",
                    shape[settings.spatial_rank], settings.channels
                ),
            ));
        }
        if let Some(seg) = segmentation {
            if seg.shape() != &shape[..settings.spatial_rank] {
                return Err(IngestionError::layout(
                    sample_id,
                    format!(
                        "segmentation shape {:?} differs from image shape {:?}",
                        seg.shape(),
                        &shape[..settings.spatial_rank]
                    ),
                ));
            }
        }
        Ok(())
    }
}

impl BatchStream for Preprocessor {
    fn stream(&self, samples: &[SampleId], mode: StreamMode) -> Result<BatchIter, ContractError> {
        let mut order = samples.to_vec();
        let mut rng = self.next_rng();
        if mode.shuffle {
            order.shuffle(&mut rng);
        }
        debug!(samples = order.len(), ?mode, "batch stream started");

        match &self.batch_files {
            // Every batch is written before the first one is read back. The
            // work runs on the first pull, i.e. on whichever thread drives
            // the iterator.
            Some(store) => {
                let this = self.clone();
                let store = Arc::clone(store);
                Ok(Box::new(std::iter::once(()).flat_map(move |()| -> BatchIter {
                    match this.prepare_to_disk(&store, &order, mode, &mut rng) {
                        Ok(paths) => {
                            let store = Arc::clone(&store);
                            Box::new(
                                paths
                                    .into_iter()
                                    .map(move |path| store.load(&path).map_err(ContractError::from)),
                            )
                        }
                        Err(err) => Box::new(std::iter::once(Err(err))),
                    }
                })))
            }
            None => {
                let this = self.clone();
                Ok(Box::new(order.into_iter().flat_map(move |sample_id| {
                    match this.prepare_sample(&sample_id, mode, &mut rng) {
                        Ok(batches) => batches.into_iter().map(Ok).collect::<Vec<_>>(),
                        Err(err) => vec![Err(err)],
                    }
                })))
            }
        }
    }
}

/// `[spatial...]` labels to `[spatial..., classes]` one-hot scores
fn one_hot(
    sample_id: &SampleId,
    segmentation: &LabelVolume,
    classes: usize,
) -> Result<ArrayD<f32>, IngestionError> {
    if let Some(&label) = segmentation.iter().find(|&&l| usize::from(l) >= classes) {
        return Err(IngestionError::layout(
            sample_id,
            format!("label {label} outside 0..{classes}"),
        ));
    }

    let rank = segmentation.ndim();
    let mut dims = segmentation.shape().to_vec();
    dims.push(classes);
    let mut encoded = ArrayD::<f32>::zeros(IxDyn(&dims));
    Zip::from(encoded.lanes_mut(Axis(rank)))
        .and(segmentation)
        .for_each(|mut lane, &label| lane[usize::from(label)] = 1.0);
    Ok(encoded)
}

/// One random window per sample, shared by image and labels
fn random_crop(
    image: &ArrayD<f32>,
    labels: Option<&ArrayD<f32>>,
    geometry: &PatchGeometry,
    rng: &mut StdRng,
) -> (ArrayD<f32>, Option<ArrayD<f32>>) {
    let (origin, extent): (Vec<usize>, Vec<usize>) = image
        .shape()
        .iter()
        .zip(geometry.window())
        .map(|(&len, &window)| {
            let extent = len.min(window);
            (rng.random_range(0..=len - extent), extent)
        })
        .unzip();

    let crop = |array: &ArrayD<f32>| {
        array
            .slice_each_axis(window_slice(&origin, &extent))
            .to_owned()
            .insert_axis(Axis(0))
    };
    (crop(image), labels.map(crop))
}

fn split_batches(
    sample_id: &SampleId,
    images: &ArrayD<f32>,
    labels: Option<&ArrayD<f32>>,
    batch_size: usize,
) -> Vec<Batch> {
    let total = images.len_of(Axis(0));
    (0..total)
        .step_by(batch_size)
        .map(|start| {
            let range = Slice::from(start..(start + batch_size).min(total));
            Batch {
                sample_id: sample_id.clone(),
                images: images.slice_axis(Axis(0), range).to_owned(),
                labels: labels.map(|l| l.slice_axis(Axis(0), range).to_owned()),
            }
        })
        .collect()
}

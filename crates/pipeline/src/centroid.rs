//! Nearest-centroid reference model.
//!
//! Scores each voxel by the softmax of its negative squared distance to one
//! intensity centroid per class. Training moves each centroid towards the
//! mean intensity of the voxels labelled with its class. Small enough to run
//! the whole pipeline without an external learning library.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};

use contracts::{ContractError, ModelPaths, SegmentationModel};
use ndarray::{s, Array2, ArrayD, ArrayViewD, Axis, IxDyn, Zip};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

const MODEL_NAME: &str = "centroid";

/// Structural descriptor written next to the weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Descriptor {
    kind: String,
    classes: usize,
    channels: usize,
    momentum: f32,
}

#[derive(Debug, Clone)]
pub struct CentroidModel {
    classes: usize,
    channels: usize,
    momentum: f32,
    /// `[classes, channels]`
    centroids: Array2<f32>,
}

impl CentroidModel {
    /// Centroids start evenly spaced over `[0, 1]` on every channel.
    ///
    /// # Errors
    /// `Model` for fewer than two classes, zero channels, or a momentum
    /// outside `(0, 1]`.
    pub fn new(classes: usize, channels: usize, momentum: f32) -> Result<Self, ContractError> {
        if classes < 2 || channels == 0 {
            return Err(ContractError::model(
                MODEL_NAME,
                format!("need at least 2 classes and 1 channel, got {classes} and {channels}"),
            ));
        }
        if !(momentum > 0.0 && momentum <= 1.0) {
            return Err(ContractError::model(
                MODEL_NAME,
                format!("momentum must be in (0, 1], got {momentum}"),
            ));
        }

        let centroids =
            Array2::from_shape_fn((classes, channels), |(c, _)| c as f32 / (classes - 1) as f32);
        Ok(Self {
            classes,
            channels,
            momentum,
            centroids,
        })
    }

    pub fn classes(&self) -> usize {
        self.classes
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn centroids(&self) -> &Array2<f32> {
        &self.centroids
    }

    /// `[voxels, channels]` view of a channels-last batch
    fn voxels(&self, images: ArrayViewD<'_, f32>) -> Result<Array2<f32>, ContractError> {
        let channels = images.shape().last().copied().unwrap_or(0);
        if channels != self.channels {
            return Err(ContractError::model(
                MODEL_NAME,
                format!("expected {} channels, got {channels}", self.channels),
            ));
        }
        let voxels = images.len() / channels;
        images
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((voxels, channels))
            .map_err(|e| ContractError::model(MODEL_NAME, e.to_string()))
    }

    /// `[voxels, classes]` class probabilities
    fn probabilities(&self, voxels: &Array2<f32>) -> Array2<f32> {
        let mut scores = Array2::<f32>::zeros((voxels.nrows(), self.classes));
        Zip::from(scores.rows_mut())
            .and(voxels.rows())
            .for_each(|mut row, x| {
                for (class, centroid) in self.centroids.rows().into_iter().enumerate() {
                    let distance: f32 = Zip::from(&x)
                        .and(&centroid)
                        .fold(0.0, |acc, &a, &b| acc + (a - b) * (a - b));
                    row[class] = -distance;
                }
                softmax(row.as_slice_mut());
            });
        scores
    }

    /// Mean cross-entropy of `probabilities` against one-hot `labels`
    fn loss(
        &self,
        probabilities: &Array2<f32>,
        labels: ArrayViewD<'_, f32>,
    ) -> Result<(Array2<f32>, f32), ContractError> {
        let classes = labels.shape().last().copied().unwrap_or(0);
        if classes != self.classes || labels.len() / classes.max(1) != probabilities.nrows() {
            return Err(ContractError::model(
                MODEL_NAME,
                format!(
                    "labels {:?} do not match {} voxels x {} classes",
                    labels.shape(),
                    probabilities.nrows(),
                    self.classes
                ),
            ));
        }
        let labels = labels
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((probabilities.nrows(), classes))
            .map_err(|e| ContractError::model(MODEL_NAME, e.to_string()))?;

        let voxels = probabilities.nrows().max(1) as f32;
        let total: f32 = Zip::from(probabilities)
            .and(&labels)
            .fold(0.0, |acc, &p, &t| acc - t * (p + 1e-7).ln());
        Ok((labels, total / voxels))
    }

    fn check_batch(&self, images: &ArrayViewD<'_, f32>) -> Result<(), ContractError> {
        if images.ndim() < 2 {
            return Err(ContractError::model(
                MODEL_NAME,
                format!("expected [n, spatial..., channels], got {:?}", images.shape()),
            ));
        }
        Ok(())
    }
}

fn softmax(row: Option<&mut [f32]>) {
    let Some(row) = row else { return };
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for v in row.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    if sum > 0.0 {
        row.iter_mut().for_each(|v| *v /= sum);
    }
}

impl SegmentationModel for CentroidModel {
    fn name(&self) -> &str {
        MODEL_NAME
    }

    fn predict(&mut self, images: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, ContractError> {
        self.check_batch(&images)?;
        let voxels = self.voxels(images.view())?;
        let scores = self.probabilities(&voxels);

        let mut dims = images.shape()[..images.ndim() - 1].to_vec();
        dims.push(self.classes);
        scores
            .into_shape_with_order(IxDyn(&dims))
            .map_err(|e| ContractError::model(MODEL_NAME, e.to_string()))
    }

    fn train_on_batch(
        &mut self,
        images: ArrayViewD<'_, f32>,
        labels: ArrayViewD<'_, f32>,
    ) -> Result<f32, ContractError> {
        self.check_batch(&images)?;
        let voxels = self.voxels(images)?;
        let (labels, loss) = self.loss(&self.probabilities(&voxels), labels)?;

        // per-class intensity sums and voxel counts
        let sums = labels.t().dot(&voxels);
        let counts = labels.sum_axis(Axis(0));
        let momentum = self.momentum;
        for (class, &count) in counts.iter().enumerate() {
            if count <= 0.0 {
                continue;
            }
            let mean = sums.row(class).mapv(|v| v / count);
            let mut centroid = self.centroids.slice_mut(s![class, ..]);
            centroid.zip_mut_with(&mean, |c, &m| *c += momentum * (m - *c));
        }
        Ok(loss)
    }

    fn test_on_batch(
        &mut self,
        images: ArrayViewD<'_, f32>,
        labels: ArrayViewD<'_, f32>,
    ) -> Result<f32, ContractError> {
        self.check_batch(&images)?;
        let voxels = self.voxels(images)?;
        let (_, loss) = self.loss(&self.probabilities(&voxels), labels)?;
        Ok(loss)
    }

    fn file_extensions(&self) -> (&'static str, &'static str) {
        ("json", "bin")
    }

    #[instrument(name = "centroid_save", skip(self), fields(path = %paths.weights.display()))]
    fn save(&self, paths: &ModelPaths) -> Result<(), ContractError> {
        for path in [&paths.descriptor, &paths.weights] {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
        }

        let descriptor = Descriptor {
            kind: MODEL_NAME.to_string(),
            classes: self.classes,
            channels: self.channels,
            momentum: self.momentum,
        };
        let mut writer = BufWriter::new(File::create(&paths.descriptor)?);
        serde_json::to_writer_pretty(&mut writer, &descriptor)
            .map_err(|e| ContractError::model(MODEL_NAME, e.to_string()))?;
        writer.flush()?;

        let mut writer = BufWriter::new(File::create(&paths.weights)?);
        bincode::serialize_into(&mut writer, &self.weights())
            .map_err(|e| ContractError::model(MODEL_NAME, e.to_string()))?;
        writer.flush()?;

        debug!("model saved");
        Ok(())
    }

    #[instrument(name = "centroid_load", skip(self), fields(path = %paths.weights.display()))]
    fn load(&mut self, paths: &ModelPaths) -> Result<(), ContractError> {
        let descriptor: Descriptor =
            serde_json::from_reader(BufReader::new(File::open(&paths.descriptor)?))
                .map_err(|e| ContractError::model(MODEL_NAME, e.to_string()))?;
        if descriptor.kind != MODEL_NAME {
            return Err(ContractError::model(
                MODEL_NAME,
                format!("descriptor describes a '{}' model", descriptor.kind),
            ));
        }
        let weights: Vec<f32> = bincode::deserialize_from(BufReader::new(File::open(&paths.weights)?))
            .map_err(|e| ContractError::model(MODEL_NAME, e.to_string()))?;

        let mut restored = Self::new(descriptor.classes, descriptor.channels, descriptor.momentum)?;
        restored.set_weights(&weights)?;
        *self = restored;

        debug!(classes = self.classes, channels = self.channels, "model loaded");
        Ok(())
    }

    fn weights(&self) -> Vec<f32> {
        self.centroids.iter().copied().collect()
    }

    fn set_weights(&mut self, weights: &[f32]) -> Result<(), ContractError> {
        let centroids = Array2::from_shape_vec((self.classes, self.channels), weights.to_vec())
            .map_err(|_| {
                ContractError::model(
                    MODEL_NAME,
                    format!(
                        "expected {} weights, got {}",
                        self.classes * self.channels,
                        weights.len()
                    ),
                )
            })?;
        self.centroids = centroids;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;
    use tempfile::tempdir;

    /// `[1, 4, 1]` batch: intensities 0.1, 0.2 (class 0) and 0.8, 0.9 (class 1)
    fn batch() -> (ArrayD<f32>, ArrayD<f32>) {
        let images = Array::from_shape_vec(IxDyn(&[1, 4, 1]), vec![0.1, 0.2, 0.8, 0.9]).unwrap();
        let labels = Array::from_shape_vec(
            IxDyn(&[1, 4, 2]),
            vec![1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0],
        )
        .unwrap();
        (images, labels)
    }

    #[test]
    fn predict_keeps_spatial_shape() {
        let mut model = CentroidModel::new(3, 2, 0.5).unwrap();
        let images = ArrayD::<f32>::zeros(IxDyn(&[2, 5, 4, 2]));
        let scores = model.predict(images.view()).unwrap();
        assert_eq!(scores.shape(), &[2, 5, 4, 3]);

        let total: f32 = scores.slice(s![0, 0, 0, ..]).sum();
        assert!((total - 1.0).abs() < 1e-5);
    }

    #[test]
    fn training_lowers_the_loss() {
        let mut model = CentroidModel::new(2, 1, 1.0).unwrap();
        // start with the classes swapped
        model.set_weights(&[0.9, 0.1]).unwrap();
        let (images, labels) = batch();

        let before = model.test_on_batch(images.view(), labels.view()).unwrap();
        model.train_on_batch(images.view(), labels.view()).unwrap();
        let after = model.test_on_batch(images.view(), labels.view()).unwrap();

        assert!(after < before, "{after} >= {before}");
        assert!((model.centroids()[[0, 0]] - 0.15).abs() < 1e-6);
        assert!((model.centroids()[[1, 0]] - 0.85).abs() < 1e-6);
    }

    #[test]
    fn wrong_channel_count_is_a_model_error() {
        let mut model = CentroidModel::new(2, 3, 0.5).unwrap();
        let images = ArrayD::<f32>::zeros(IxDyn(&[1, 4, 1]));
        assert!(matches!(
            model.predict(images.view()),
            Err(ContractError::Model { .. })
        ));
    }

    #[test]
    fn save_and_load_restore_the_centroids() {
        let dir = tempdir().unwrap();
        let mut model = CentroidModel::new(2, 1, 1.0).unwrap();
        let (images, labels) = batch();
        model.train_on_batch(images.view(), labels.view()).unwrap();

        let (d, w) = model.file_extensions();
        let paths = ModelPaths::from_prefix(dir.path().join("runs/fold0"), d, w);
        model.save(&paths).unwrap();
        assert!(paths.descriptor.exists());

        let mut restored = CentroidModel::new(2, 1, 0.5).unwrap();
        restored.load(&paths).unwrap();
        assert_eq!(restored.weights(), model.weights());
    }

    #[test]
    fn set_weights_checks_length() {
        let mut model = CentroidModel::new(2, 2, 0.5).unwrap();
        assert!(model.set_weights(&[0.0; 3]).is_err());
        model.set_weights(&[0.0, 0.1, 0.2, 0.3]).unwrap();
        assert_eq!(model.weights(), vec![0.0, 0.1, 0.2, 0.3]);
    }

    #[test]
    fn rejects_degenerate_configuration() {
        assert!(CentroidModel::new(1, 1, 0.5).is_err());
        assert!(CentroidModel::new(2, 0, 0.5).is_err());
        assert!(CentroidModel::new(2, 1, 0.0).is_err());
    }
}

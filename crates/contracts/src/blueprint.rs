//! PipelineBlueprint - Config Loader output
//!
//! Describes a full pipeline run: data layout, patch analysis, training
//! options, temporary batch caching, post-processing and output routing.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ContractError;

/// Metric identifiers understood by the metric registry
pub const KNOWN_METRICS: &[&str] = &["dice_soft", "dice_classwise", "categorical_accuracy"];

/// Configuration version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConfigVersion {
    #[default]
    V1,
}

/// Complete pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineBlueprint {
    /// Configuration version
    #[serde(default)]
    pub version: ConfigVersion,

    /// Input data layout
    pub data: DataConfig,

    /// Patch decomposition settings
    pub analysis: AnalysisConfig,

    /// Epoch driver settings
    #[serde(default)]
    pub training: TrainingConfig,

    /// On-disk batch caching
    #[serde(default)]
    pub cache: CacheConfig,

    /// Post-processors, applied in order
    #[serde(default)]
    pub postprocess: Vec<PostProcessConfig>,

    /// Output routing
    #[serde(default)]
    pub sinks: Vec<SinkConfig>,
}

/// Input data layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Volumetric (3 spatial axes) or planar (2 spatial axes) data
    #[serde(default = "default_three_dim")]
    pub three_dim: bool,

    /// Image channels
    #[serde(default = "default_channels")]
    pub channels: usize,

    /// Segmentation classes, background included
    pub classes: usize,
}

fn default_three_dim() -> bool {
    true
}

fn default_channels() -> usize {
    1
}

impl DataConfig {
    /// Expected spatial rank
    pub fn spatial_rank(&self) -> usize {
        if self.three_dim {
            3
        } else {
            2
        }
    }
}

/// Decomposition strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMode {
    /// Whole volume goes through the model at once
    FullVolume,
    /// Random crops for training, grid decomposition for inference
    PatchwiseCrop,
    /// Grid decomposition everywhere
    #[default]
    PatchwiseGrid,
}

impl AnalysisMode {
    /// Whether inference outputs must be reassembled from patches
    pub fn is_patchwise(self) -> bool {
        matches!(self, Self::PatchwiseCrop | Self::PatchwiseGrid)
    }
}

/// Overlap between neighbouring patches, per axis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Overlap {
    /// Absolute voxel count
    Voxels(Vec<usize>),
    /// Fraction of the window, in [0, 1)
    Fraction(Vec<f64>),
}

impl Default for Overlap {
    fn default() -> Self {
        Self::Voxels(Vec::new())
    }
}

impl Overlap {
    /// Normalize to absolute voxel counts for the given window.
    ///
    /// An empty list means no overlap on any axis. Fractions are rounded to
    /// the nearest voxel.
    ///
    /// # Errors
    /// - rank differs from the window rank
    /// - fraction outside [0, 1)
    /// - overlap >= window on some axis (`InvalidOverlap`)
    pub fn resolve(&self, window: &[usize]) -> Result<Vec<usize>, ContractError> {
        let voxels = match self {
            Self::Voxels(v) if v.is_empty() => vec![0; window.len()],
            Self::Fraction(f) if f.is_empty() => vec![0; window.len()],
            Self::Voxels(v) => {
                check_rank(v.len(), window.len())?;
                v.clone()
            }
            Self::Fraction(f) => {
                check_rank(f.len(), window.len())?;
                f.iter()
                    .zip(window)
                    .enumerate()
                    .map(|(axis, (&frac, &w))| {
                        if !(0.0..1.0).contains(&frac) {
                            return Err(ContractError::config_validation(
                                format!("analysis.overlap.fraction[{axis}]"),
                                format!("fraction must be in [0, 1), got {frac}"),
                            ));
                        }
                        Ok((frac * w as f64).round() as usize)
                    })
                    .collect::<Result<Vec<_>, _>>()?
            }
        };

        for (axis, (&overlap, &window)) in voxels.iter().zip(window).enumerate() {
            if overlap >= window {
                return Err(ContractError::InvalidOverlap {
                    axis,
                    overlap,
                    window,
                });
            }
        }

        Ok(voxels)
    }
}

fn check_rank(got: usize, expected: usize) -> Result<(), ContractError> {
    if got != expected {
        return Err(ContractError::config_validation(
            "analysis.overlap",
            format!("overlap has {got} axes but the patch window has {expected}"),
        ));
    }
    Ok(())
}

/// How voxels covered by several patches are resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Later patch in traversal order overwrites earlier ones
    #[default]
    LastWriteWins,
    /// Mean of every patch covering the voxel
    Average,
}

/// Patch analysis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Decomposition strategy
    #[serde(default)]
    pub mode: AnalysisMode,

    /// Patch window extents (ignored for full-volume analysis)
    #[serde(default)]
    pub patch_shape: Vec<usize>,

    /// Overlap between grid patches
    #[serde(default)]
    pub overlap: Overlap,

    /// Overlap resolution during reconstruction
    #[serde(default)]
    pub overlap_policy: OverlapPolicy,

    /// Patches per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_batch_size() -> usize {
    1
}

/// Epoch driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Passes over the training samples
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// Forwarded to the model
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    /// Loss identifier, forwarded to the model
    #[serde(default = "default_loss")]
    pub loss: String,

    /// Metric identifiers reported per epoch
    #[serde(default = "default_metrics")]
    pub metrics: Vec<String>,

    /// Shuffle sample order per epoch
    #[serde(default = "default_shuffle")]
    pub shuffle: bool,

    /// Maximum number of prepared batches held in memory
    #[serde(default = "default_batch_queue_size")]
    pub batch_queue_size: usize,

    /// Seed for shuffling and random crops
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_epochs() -> usize {
    20
}

fn default_learning_rate() -> f64 {
    1e-4
}

fn default_loss() -> String {
    "tversky".to_string()
}

fn default_metrics() -> Vec<String> {
    vec!["dice_classwise".to_string()]
}

fn default_shuffle() -> bool {
    true
}

fn default_batch_queue_size() -> usize {
    2
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            learning_rate: default_learning_rate(),
            loss: default_loss(),
            metrics: default_metrics(),
            shuffle: default_shuffle(),
            batch_queue_size: default_batch_queue_size(),
            seed: None,
        }
    }
}

/// Temporary on-disk caching of prepared batches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Write prepared batches to `temp_dir` before streaming them
    #[serde(default)]
    pub prepare_batches: bool,

    /// Preprocessing subfunction results are cached on disk
    #[serde(default)]
    pub prepare_subfunctions: bool,

    /// Directory holding temporary batch files
    #[serde(default = "default_temp_dir")]
    pub temp_dir: std::path::PathBuf,

    /// File name prefix of temporary batch files
    #[serde(default = "default_batch_prefix")]
    pub batch_prefix: String,
}

fn default_temp_dir() -> std::path::PathBuf {
    std::path::PathBuf::from("batches")
}

fn default_batch_prefix() -> String {
    "batch".to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            prepare_batches: false,
            prepare_subfunctions: false,
            temp_dir: default_temp_dir(),
            batch_prefix: default_batch_prefix(),
        }
    }
}

impl CacheConfig {
    /// Whether temporary artifacts can exist and must be cleaned up
    pub fn needs_cleanup(&self) -> bool {
        self.prepare_batches || self.prepare_subfunctions
    }
}

/// Post-processor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PostProcessConfig {
    /// Relabel classes: each pair is `[from, to]`
    LabelRemap { mapping: Vec<[u16; 2]> },
}

/// Sink output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Sink name
    pub name: String,

    /// Sink type
    pub sink_type: SinkType,

    /// Type specific parameters
    #[serde(default)]
    pub params: HashMap<String, String>,
}

/// Sink type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkType {
    /// Log a summary per prediction
    Log,
    /// Write predictions to disk
    File,
}

impl PipelineBlueprint {
    /// Whether inference needs the shape cache and the reconstructor
    pub fn is_patchwise(&self) -> bool {
        self.analysis.mode.is_patchwise()
    }
}

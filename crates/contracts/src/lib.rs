//! # Contracts
//!
//! Frozen interface contracts shared by every pipeline crate: sample and
//! volume types, the configuration blueprint, the error taxonomy and the
//! traits of the external collaborators (batch stream, model, sinks,
//! post-processors, metrics, hooks).
//! All business crates can only depend on this crate, reverse dependencies are prohibited.
//!
//! ## Array layout
//! - Images are channels-last: `[spatial..., channels]`
//! - Batches add a leading patch axis: `[n, spatial..., channels]`
//! - Model scores are classes-last: `[n, spatial..., classes]`

mod batch_stream;
mod blueprint;
mod error;
mod hook;
mod model;
mod processing;
mod sample_id;
mod sink;
mod volume;

pub use batch_stream::{BatchIter, BatchStream, StreamMode};
pub use blueprint::*;
pub use error::*;
pub use hook::{EpochRecord, History, PipelineHook};
pub use model::{ModelPaths, SegmentationModel};
pub use processing::{Metric, PostProcessor};
pub use sample_id::SampleId;
pub use sink::*;
pub use volume::*;

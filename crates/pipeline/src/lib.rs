//! # Pipeline
//!
//! Orchestrates training, prediction and evaluation of a segmentation model
//! over patch-decomposed volumes.
//!
//! ## Components
//!
//! - [`Pipeline`]: train / evaluate epoch driver and the per-sample predict
//!   state machine
//! - [`ResourceJanitor`]: removal of temporary batch files
//! - [`MetricRegistry`]: metrics resolved from configuration identifiers
//! - [`LabelRemap`]: built-in post-processor
//! - [`CentroidModel`]: nearest-centroid reference model
//!
//! ## Usage Example
//!
//! ```ignore
//! use pipeline::{CentroidModel, Pipeline};
//!
//! let cache = Arc::new(ShapeCache::new());
//! let stream = Preprocessor::new(source, cache.clone(), &blueprint)?;
//! let model = CentroidModel::new(blueprint.data.classes, blueprint.data.channels, 0.5)?;
//! let mut pipeline = Pipeline::new(model, stream, cache, &blueprint)?;
//!
//! pipeline.train(&training).await?;
//! let report = pipeline.predict_to_sink(&samples, &mut sinks).await;
//! ```

mod centroid;
mod error;
mod janitor;
mod orchestrator;
mod postprocess;
mod scoring;

pub use centroid::CentroidModel;
pub use error::{PipelineError, PipelineMode, SampleStage};
pub use janitor::ResourceJanitor;
pub use orchestrator::{Pipeline, PredictReport};
pub use postprocess::{build_post_processors, LabelRemap};
pub use scoring::{resolve as resolve_metric, CategoricalAccuracy, DiceClasswise, DiceSoft, MetricRegistry};

//! # Ingestion
//!
//! Batch production for the pipeline.
//!
//! Responsibilities:
//! - Load samples from a volume source (in memory or `.npy` directories)
//! - Decompose samples into patches and record shapes for reconstruction
//! - Optionally prepare batches as temporary files
//! - Bounded prefetch queue towards the orchestrator
//!
//! ## Usage Example
//!
//! ```ignore
//! use ingestion::{BatchPrefetcher, NpyDirSource, Preprocessor};
//! use contracts::{BatchStream, StreamMode};
//!
//! let source = Arc::new(NpyDirSource::new("data", blueprint.data.spatial_rank()));
//! let preprocessor = Preprocessor::new(source, shape_cache.clone(), &blueprint)?;
//!
//! let batches = preprocessor.stream(&[sample_id], StreamMode::inference())?;
//! let mut prefetch = BatchPrefetcher::spawn(batches, blueprint.training.batch_queue_size);
//! while let Some(batch) = prefetch.next().await {
//!     // run the model
//! }
//! prefetch.finish().await?;
//! ```

mod batch_files;
mod error;
mod prefetch;
mod preprocess;
mod source;

pub use batch_files::{is_batch_file, BatchFileStore, BATCH_EXTENSION};
pub use error::{IngestionError, Result};
pub use prefetch::{BatchPrefetcher, PrefetchMetrics, PrefetchSnapshot, BATCH_QUEUE_DEPTH};
pub use preprocess::Preprocessor;
pub use source::{InMemorySource, NpyDirSource, VolumeSource, IMAGE_FILE, SEGMENTATION_FILE};

//! # Dispatcher
//!
//! Routing of finished predictions to output sinks.
//!
//! Responsibilities:
//! - Build sinks from configuration
//! - Fan-out each prediction to every sink
//! - Surface sink failures to the caller

pub mod error;
pub mod metrics;
pub mod sink_set;
pub mod sinks;

pub use contracts::PredictionSink;
pub use error::DispatcherError;
pub use metrics::{MetricsSnapshot, SinkMetrics};
pub use sink_set::{create_sink, ConfiguredSink, SinkSet};
pub use sinks::{class_histogram, FileFormat, FileSink, FileSinkConfig, LogSink};

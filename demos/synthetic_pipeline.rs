//! Synthetic Pipeline Example
//!
//! Trains the bundled centroid model on generated 3D volumes, then predicts
//! them patch by patch and logs every label volume. Runs without any data on
//! disk.
//!
//! Run with: cargo run -p demos --bin synthetic_pipeline [config.toml]

use std::sync::Arc;

use config_loader::{ConfigFormat, ConfigLoader};
use contracts::{PipelineBlueprint, Sample, SampleId};
use dispatcher::{ConfiguredSink, LogSink, PredictionSink, SinkSet};
use ingestion::{InMemorySource, Preprocessor, VolumeSource};
use ndarray::{Array3, Axis};
use observability::{LogFormat, ObservabilityConfig};
use patching::ShapeCache;
use pipeline::{CentroidModel, Pipeline};

const DEMO_CONFIG: &str = r#"
[data]
three_dim = true
channels = 1
classes = 3

[analysis]
mode = "patchwise_grid"
patch_shape = [24, 24, 16]
overlap = { fraction = [0.25, 0.25, 0.25] }
overlap_policy = "average"
batch_size = 8

[training]
epochs = 3
metrics = ["dice_soft", "dice_classwise"]
seed = 42
"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    observability::init_with_config(ObservabilityConfig {
        log_format: LogFormat::Pretty,
        ..Default::default()
    })?;

    tracing::info!("Starting synthetic pipeline demo");

    // ==== Stage 1: Load config or use the built-in one ====
    let blueprint = if let Some(path) = std::env::args().nth(1) {
        tracing::info!(path = %path, "Loading pipeline config");
        ConfigLoader::load_from_path(std::path::Path::new(&path))?
    } else {
        ConfigLoader::load_from_str(DEMO_CONFIG, ConfigFormat::Toml)?
    };

    // ==== Stage 2: Generate samples ====
    let mut source = InMemorySource::new();
    for (i, depth) in [20usize, 33, 41].into_iter().enumerate() {
        source.insert(layered_sample(&format!("synthetic_{i:02}"), [50, 45, depth], &blueprint));
    }
    let ids = source.sample_ids();
    tracing::info!(samples = ids.len(), "Samples generated");

    // ==== Stage 3: Wire stream, model and pipeline ====
    let shape_cache = Arc::new(ShapeCache::new());
    let stream = Preprocessor::new(Arc::new(source), Arc::clone(&shape_cache), &blueprint)?;
    let model = CentroidModel::new(blueprint.data.classes, blueprint.data.channels, 0.5)?;
    let mut pipeline = Pipeline::new(model, stream, shape_cache, &blueprint)?;

    // ==== Stage 4: Train ====
    let history = pipeline.train(&ids).await?;
    for record in &history.epochs {
        tracing::info!(epoch = record.epoch, loss = record.loss, metrics = ?record.metrics, "Epoch");
    }

    // ==== Stage 5: Predict ====
    let mut sinks = if blueprint.sinks.is_empty() {
        let mut set = SinkSet::new("demo");
        set.push(ConfiguredSink::Log(LogSink::new("log")));
        set
    } else {
        SinkSet::from_configs(&blueprint.sinks)?
    };
    let report = pipeline.predict_to_sink(&ids, &mut sinks).await;
    sinks.close().await?;

    for failure in &report.failures {
        tracing::error!(error = %failure, "Prediction failed");
    }
    println!("{}", pipeline.run_summary());

    Ok(())
}

/// Intensity bands along the first axis, one band per class
fn layered_sample(id: &str, shape: [usize; 3], blueprint: &PipelineBlueprint) -> Sample {
    let classes = blueprint.data.classes.max(1);
    let band = (shape[0] / classes).max(1);
    let labels = Array3::from_shape_fn(shape, |(x, _, _)| ((x / band).min(classes - 1)) as u16);
    let image = labels
        .mapv(|label| label as f32 / (classes.max(2) - 1) as f32)
        .insert_axis(Axis(3));

    Sample {
        id: SampleId::from(id),
        image: image.into_dyn(),
        segmentation: Some(labels.into_dyn()),
    }
}

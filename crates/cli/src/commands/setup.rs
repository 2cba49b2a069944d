//! Shared setup for the commands that run the pipeline.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use config_loader::ConfigLoader;
use contracts::{History, PipelineBlueprint, SampleId};
use ingestion::{NpyDirSource, Preprocessor, VolumeSource};
use patching::ShapeCache;
use pipeline::{CentroidModel, Pipeline};
use tracing::{info, warn};

use crate::cli::RunArgs;
use crate::error::CliError;

/// The pipeline the CLI drives
pub type SegPipeline = Pipeline<CentroidModel, Preprocessor>;

/// Centroid step size for the bundled model
pub const CENTROID_MOMENTUM: f32 = 0.5;

/// Everything a run needs
pub struct Session {
    pub blueprint: PipelineBlueprint,
    pub samples: Vec<SampleId>,
    pub available: Vec<SampleId>,
    pub pipeline: SegPipeline,
}

/// Load the configuration and apply CLI overrides
pub fn load_blueprint(args: &RunArgs) -> Result<PipelineBlueprint> {
    info!(config = %args.config.display(), "Loading configuration");

    if !args.config.exists() {
        return Err(CliError::config_not_found(args.config.display().to_string()).into());
    }

    let mut blueprint = ConfigLoader::load_from_path(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    apply_overrides(&mut blueprint, args);
    ConfigLoader::validate(&blueprint).context("Configuration invalid after CLI overrides")?;

    info!(
        mode = ?blueprint.analysis.mode,
        patch_shape = ?blueprint.analysis.patch_shape,
        classes = blueprint.data.classes,
        channels = blueprint.data.channels,
        sinks = blueprint.sinks.len(),
        "Configuration loaded"
    );

    Ok(blueprint)
}

fn apply_overrides(blueprint: &mut PipelineBlueprint, args: &RunArgs) {
    if let Some(epochs) = args.epochs {
        info!(epochs, "Overriding training.epochs from CLI");
        blueprint.training.epochs = epochs;
    }
    if let Some(depth) = args.queue_depth {
        info!(depth, "Overriding training.batch_queue_size from CLI");
        blueprint.training.batch_queue_size = depth;
    }
    if let Some(seed) = args.seed {
        info!(seed, "Overriding training.seed from CLI");
        blueprint.training.seed = Some(seed);
    }
}

/// Build source, stream, model and pipeline for `blueprint`.
///
/// `model` optionally names a saved model to start from.
pub fn open_session(
    args: &RunArgs,
    blueprint: PipelineBlueprint,
    model: Option<&Path>,
) -> Result<Session> {
    let source = Arc::new(NpyDirSource::new(
        &args.data,
        blueprint.data.spatial_rank(),
    ));
    let available = source.sample_ids();
    if available.is_empty() {
        return Err(CliError::NoSamples {
            path: args.data.display().to_string(),
        }
        .into());
    }
    let samples = select_samples(&available, &args.samples, &args.data)?;
    info!(
        data = %args.data.display(),
        available = available.len(),
        selected = samples.len(),
        "Samples selected"
    );

    let shape_cache = Arc::new(ShapeCache::new());
    let stream = Preprocessor::new(source, Arc::clone(&shape_cache), &blueprint)
        .context("Failed to build batch stream")?;
    let network = CentroidModel::new(
        blueprint.data.classes,
        blueprint.data.channels,
        CENTROID_MOMENTUM,
    )
    .context("Failed to build model")?;

    let mut pipeline = Pipeline::new(network, stream, shape_cache, &blueprint)
        .context("Failed to build pipeline")?;

    if let Some(prefix) = model {
        let paths = pipeline
            .load(prefix)
            .with_context(|| format!("Failed to load model from {}", prefix.display()))?;
        info!(
            descriptor = %paths.descriptor.display(),
            weights = %paths.weights.display(),
            "Model loaded"
        );
    }

    Ok(Session {
        blueprint,
        samples,
        available,
        pipeline,
    })
}

/// Resolve the requested sample names against the data directory.
///
/// An empty request selects every available sample.
pub fn select_samples(
    available: &[SampleId],
    requested: &[String],
    root: &Path,
) -> Result<Vec<SampleId>, CliError> {
    if requested.is_empty() {
        return Ok(available.to_vec());
    }

    requested
        .iter()
        .map(|name| {
            available
                .iter()
                .find(|id| *id == name.as_str())
                .cloned()
                .ok_or_else(|| CliError::UnknownSample {
                    sample_id: name.clone(),
                    path: root.display().to_string(),
                })
        })
        .collect()
}

/// Split `samples` into training and validation sets.
///
/// With an explicit `validation` list, those samples are validated on and
/// the remaining selected samples are trained on. Otherwise the last
/// `fraction` of the selection (at least one sample) is held out.
pub fn split_validation(
    samples: &[SampleId],
    validation: &[SampleId],
    fraction: f64,
) -> Result<(Vec<SampleId>, Vec<SampleId>), CliError> {
    let total = samples.len();

    if !validation.is_empty() {
        let held_out: BTreeSet<&SampleId> = validation.iter().collect();
        let training: Vec<SampleId> = samples
            .iter()
            .filter(|id| !held_out.contains(id))
            .cloned()
            .collect();
        if training.is_empty() {
            return Err(CliError::split(total, "every selected sample is a validation sample"));
        }
        return Ok((training, validation.to_vec()));
    }

    if !(fraction > 0.0 && fraction < 1.0) {
        return Err(CliError::split(
            total,
            format!("validation fraction must be in (0, 1), got {fraction}"),
        ));
    }
    if total < 2 {
        return Err(CliError::split(total, "need at least two samples"));
    }

    let held = ((total as f64 * fraction).round() as usize).clamp(1, total - 1);
    let (training, validation) = samples.split_at(total - held);
    Ok((training.to_vec(), validation.to_vec()))
}

/// Print one line per epoch
pub fn print_history(history: &History) {
    println!("\n=== Training History ===\n");
    for record in &history.epochs {
        let mut line = format!("epoch {:>3}  loss {:.4}", record.epoch + 1, record.loss);
        for (name, value) in &record.metrics {
            line.push_str(&format!("  {name} {value:.4}"));
        }
        if let Some(val_loss) = record.val_loss {
            line.push_str(&format!("  val_loss {val_loss:.4}"));
        }
        for (name, value) in &record.val_metrics {
            line.push_str(&format!("  val_{name} {value:.4}"));
        }
        println!("{line}");
    }
    println!();
}

/// Write the history as pretty JSON
pub fn write_history(history: &History, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(history).context("Failed to serialize history")?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write history to {}", path.display()))?;
    info!(path = %path.display(), "History written");
    Ok(())
}

/// Save the model under `prefix`
pub fn save_model(pipeline: &SegPipeline, prefix: &Path) -> Result<()> {
    if let Some(parent) = prefix.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let paths = pipeline
        .dump(prefix)
        .with_context(|| format!("Failed to save model to {}", prefix.display()))?;
    info!(
        descriptor = %paths.descriptor.display(),
        weights = %paths.weights.display(),
        "Model saved"
    );
    Ok(())
}

/// Log the interruption and remove prepared batch files
pub fn interrupted(pipeline: &SegPipeline) -> anyhow::Error {
    warn!("Received shutdown signal, stopping run...");
    if let Err(e) = pipeline.janitor().cleanup() {
        warn!(error = %e, "Cleanup after interruption failed");
    }
    CliError::Interrupted.into()
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<SampleId> {
        names.iter().map(|n| SampleId::from(*n)).collect()
    }

    #[test]
    fn empty_request_selects_everything() {
        let available = ids(&["a", "b"]);
        let selected = select_samples(&available, &[], Path::new("data")).unwrap();
        assert_eq!(selected, available);
    }

    #[test]
    fn unknown_sample_is_rejected() {
        let available = ids(&["a", "b"]);
        let err = select_samples(&available, &["c".to_string()], Path::new("data")).unwrap_err();
        assert!(matches!(err, CliError::UnknownSample { ref sample_id, .. } if sample_id == "c"));
    }

    #[test]
    fn fraction_split_keeps_both_sides() {
        let samples = ids(&["a", "b", "c", "d", "e"]);
        let (training, validation) = split_validation(&samples, &[], 0.2).unwrap();
        assert_eq!(training, ids(&["a", "b", "c", "d"]));
        assert_eq!(validation, ids(&["e"]));

        // rounds down to zero but one sample is always held out
        let (training, validation) = split_validation(&samples[..2], &[], 0.1).unwrap();
        assert_eq!((training.len(), validation.len()), (1, 1));
    }

    #[test]
    fn explicit_validation_is_removed_from_training() {
        let samples = ids(&["a", "b", "c"]);
        let (training, validation) = split_validation(&samples, &ids(&["b"]), 0.5).unwrap();
        assert_eq!(training, ids(&["a", "c"]));
        assert_eq!(validation, ids(&["b"]));
    }

    #[test]
    fn degenerate_splits_fail() {
        let samples = ids(&["a"]);
        assert!(split_validation(&samples, &[], 0.5).is_err());
        assert!(split_validation(&ids(&["a", "b"]), &[], 1.0).is_err());
        assert!(split_validation(&samples, &samples, 0.5).is_err());
    }
}

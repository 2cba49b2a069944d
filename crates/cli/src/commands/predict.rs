//! `predict` command implementation.

use anyhow::{Context, Result};
use contracts::PredictionSink;
use dispatcher::{ConfiguredSink, LogSink, SinkSet};
use serde::Serialize;
use tracing::{error, info, warn};

use super::setup::{interrupted, load_blueprint, open_session, shutdown_signal};
use crate::cli::PredictArgs;
use crate::error::CliError;

/// Run summary for JSON output
#[derive(Serialize)]
struct PredictSummary {
    samples: usize,
    written: Vec<String>,
    failed: Vec<FailureInfo>,
    sinks: Vec<SinkInfo>,
    mean_patches_per_sample: f64,
    mean_reconstruction_ms: f64,
}

#[derive(Serialize)]
struct FailureInfo {
    sample_id: Option<String>,
    error: String,
}

#[derive(Serialize)]
struct SinkInfo {
    name: String,
    writes: u64,
    failures: u64,
    voxels: u64,
}

/// Execute the `predict` command
pub async fn run_predict(args: &PredictArgs) -> Result<()> {
    let blueprint = load_blueprint(&args.run)?;

    if args.run.dry_run {
        info!("Dry run mode - configuration is valid, exiting");
        return Ok(());
    }

    let mut sinks = if blueprint.sinks.is_empty() {
        warn!("No sinks configured - predictions will only be logged");
        let mut set = SinkSet::new("sinks");
        set.push(ConfiguredSink::Log(LogSink::new("log")));
        set
    } else {
        SinkSet::from_configs(&blueprint.sinks).context("Failed to create sinks")?
    };

    if args.model.is_none() {
        warn!("No --model given - predicting with untrained weights");
    }
    let mut session = open_session(&args.run, blueprint, args.model.as_deref())?;
    info!(samples = session.samples.len(), sinks = sinks.len(), "Starting prediction...");

    let outcome = tokio::select! {
        report = session.pipeline.predict_to_sink(&session.samples, &mut sinks) => Some(report),
        _ = shutdown_signal() => None,
    };
    let Some(report) = outcome else {
        if let Err(e) = sinks.close().await {
            warn!(error = %e, "Closing sinks after interruption failed");
        }
        return Err(interrupted(&session.pipeline));
    };
    sinks.close().await.context("Failed to close sinks")?;

    for failure in &report.failures {
        error!(error = %failure, "Prediction failed");
    }
    for (name, snapshot) in sinks.metrics() {
        info!(
            sink = %name,
            writes = snapshot.write_count,
            failures = snapshot.failure_count,
            "Sink finished"
        );
    }

    let summary = session.pipeline.run_summary();
    if args.json {
        let json = PredictSummary {
            samples: session.samples.len(),
            written: report.emitted.iter().map(|id| id.to_string()).collect(),
            failed: report
                .failures
                .iter()
                .map(|e| FailureInfo {
                    sample_id: e.sample_id().map(|id| id.to_string()),
                    error: e.to_string(),
                })
                .collect(),
            sinks: sinks
                .metrics()
                .into_iter()
                .map(|(name, snapshot)| SinkInfo {
                    name,
                    writes: snapshot.write_count,
                    failures: snapshot.failure_count,
                    voxels: snapshot.voxel_count,
                })
                .collect(),
            mean_patches_per_sample: summary.patches_per_sample.mean,
            mean_reconstruction_ms: summary.reconstruction_ms.mean,
        };
        let json =
            serde_json::to_string_pretty(&json).context("Failed to serialize prediction summary")?;
        println!("{}", json);
    } else {
        println!("\n{summary}");
    }

    if report.is_success() {
        info!(written = report.emitted.len(), "Prediction completed");
        Ok(())
    } else {
        Err(CliError::SamplesFailed {
            failed: report.failures.len(),
            total: session.samples.len(),
        }
        .into())
    }
}

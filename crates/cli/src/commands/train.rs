//! `train` command implementation.

use anyhow::{Context, Result};
use tracing::info;

use super::setup::{
    interrupted, load_blueprint, open_session, print_history, save_model, shutdown_signal,
    write_history,
};
use crate::cli::TrainArgs;

/// Execute the `train` command
pub async fn run_train(args: &TrainArgs) -> Result<()> {
    let blueprint = load_blueprint(&args.run)?;

    if args.run.dry_run {
        info!("Dry run mode - configuration is valid, exiting");
        return Ok(());
    }

    let mut session = open_session(&args.run, blueprint, args.model.as_deref())?;
    info!(
        samples = session.samples.len(),
        epochs = session.blueprint.training.epochs,
        "Starting training..."
    );

    let outcome = tokio::select! {
        result = session.pipeline.train(&session.samples) => Some(result),
        _ = shutdown_signal() => None,
    };
    let Some(result) = outcome else {
        return Err(interrupted(&session.pipeline));
    };
    let history = result.context("Training failed")?;

    if let Some(last) = history.last() {
        info!(epochs = history.epochs.len(), loss = last.loss, "Training completed");
    }
    print_history(&history);

    save_model(&session.pipeline, &args.model_out)?;
    if let Some(path) = &args.history_out {
        write_history(&history, path)?;
    }

    Ok(())
}

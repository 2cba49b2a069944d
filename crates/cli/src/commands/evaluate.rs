//! `evaluate` command implementation.

use anyhow::{Context, Result};
use tracing::info;

use super::setup::{
    interrupted, load_blueprint, open_session, print_history, save_model, select_samples,
    shutdown_signal, split_validation, write_history,
};
use crate::cli::EvaluateArgs;

/// Execute the `evaluate` command
pub async fn run_evaluate(args: &EvaluateArgs) -> Result<()> {
    let blueprint = load_blueprint(&args.run)?;

    if args.run.dry_run {
        info!("Dry run mode - configuration is valid, exiting");
        return Ok(());
    }

    let mut session = open_session(&args.run, blueprint, args.model.as_deref())?;
    let validation = if args.validation.is_empty() {
        Vec::new()
    } else {
        select_samples(&session.available, &args.validation, &args.run.data)?
    };
    let (training, validation) =
        split_validation(&session.samples, &validation, args.validation_fraction)?;

    info!(
        training = training.len(),
        validation = validation.len(),
        epochs = session.blueprint.training.epochs,
        "Starting evaluation..."
    );

    let outcome = tokio::select! {
        result = session.pipeline.evaluate(&training, &validation) => Some(result),
        _ = shutdown_signal() => None,
    };
    let Some(result) = outcome else {
        return Err(interrupted(&session.pipeline));
    };
    let history = result.context("Evaluation failed")?;

    if let Some(last) = history.last() {
        info!(
            epochs = history.epochs.len(),
            loss = last.loss,
            val_loss = ?last.val_loss,
            "Evaluation completed"
        );
    }
    print_history(&history);

    if let Some(prefix) = &args.model_out {
        save_model(&session.pipeline, prefix)?;
    }
    if let Some(path) = &args.history_out {
        write_history(&history, path)?;
    }

    Ok(())
}

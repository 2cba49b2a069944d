//! `validate` command implementation.

use anyhow::{Context, Result};
use contracts::{AnalysisMode, OverlapPolicy, PipelineBlueprint};
use serde::Serialize;
use tracing::info;

use crate::cli::ValidateArgs;

/// Validation result for JSON output
#[derive(Serialize)]
struct ValidationResult {
    valid: bool,
    config_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warnings: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<ConfigSummary>,
}

#[derive(Serialize)]
struct ConfigSummary {
    version: String,
    mode: String,
    patch_shape: Vec<usize>,
    overlap_voxels: Vec<usize>,
    classes: usize,
    channels: usize,
    epochs: usize,
    sink_count: usize,
}

/// Execute the `validate` command
pub fn run_validate(args: &ValidateArgs) -> Result<()> {
    info!(config = %args.config.display(), "Validating configuration");

    let result = validate_config(args);

    if args.json {
        let json = serde_json::to_string_pretty(&result)
            .context("Failed to serialize validation result")?;
        println!("{}", json);
    } else {
        print_validation_result(&result);
    }

    if result.valid {
        Ok(())
    } else {
        anyhow::bail!("Configuration validation failed")
    }
}

fn validate_config(args: &ValidateArgs) -> ValidationResult {
    let config_path = args.config.display().to_string();

    if !args.config.exists() {
        return ValidationResult {
            valid: false,
            config_path,
            error: Some(format!("File not found: {}", args.config.display())),
            warnings: None,
            summary: None,
        };
    }

    let loaded = config_loader::ConfigLoader::load_from_path(&args.config).and_then(|blueprint| {
        let analysis = &blueprint.analysis;
        let overlap = if analysis.mode.is_patchwise() {
            analysis.overlap.resolve(&analysis.patch_shape)?
        } else {
            Vec::new()
        };
        Ok((blueprint, overlap))
    });

    match loaded {
        Ok((blueprint, overlap_voxels)) => {
            let warnings = collect_warnings(&blueprint);

            ValidationResult {
                valid: true,
                config_path,
                error: None,
                warnings: if warnings.is_empty() {
                    None
                } else {
                    Some(warnings)
                },
                summary: Some(ConfigSummary {
                    version: format!("{:?}", blueprint.version),
                    mode: format!("{:?}", blueprint.analysis.mode),
                    patch_shape: blueprint.analysis.patch_shape.clone(),
                    overlap_voxels,
                    classes: blueprint.data.classes,
                    channels: blueprint.data.channels,
                    epochs: blueprint.training.epochs,
                    sink_count: blueprint.sinks.len(),
                }),
            }
        }
        Err(e) => ValidationResult {
            valid: false,
            config_path,
            error: Some(e.to_string()),
            warnings: None,
            summary: None,
        },
    }
}

/// Collect configuration warnings (non-fatal issues)
fn collect_warnings(blueprint: &PipelineBlueprint) -> Vec<String> {
    let mut warnings = Vec::new();

    if blueprint.sinks.is_empty() {
        warnings.push("No sinks configured - predictions will only be logged".to_string());
    }

    if blueprint.analysis.mode == AnalysisMode::FullVolume {
        if !blueprint.analysis.patch_shape.is_empty() {
            warnings.push("analysis.patch_shape is ignored in full_volume mode".to_string());
        }
        if blueprint.analysis.overlap_policy == OverlapPolicy::Average {
            warnings.push("analysis.overlap_policy has no effect in full_volume mode".to_string());
        }
    }

    if blueprint.training.metrics.is_empty() {
        warnings.push("training.metrics is empty - epochs report loss only".to_string());
    }

    if blueprint.cache.prepare_batches && !blueprint.cache.temp_dir.exists() {
        warnings.push(format!(
            "cache.temp_dir '{}' does not exist yet - it will be created",
            blueprint.cache.temp_dir.display()
        ));
    }

    warnings
}

fn print_validation_result(result: &ValidationResult) {
    if result.valid {
        println!("✓ Configuration is valid: {}", result.config_path);

        if let Some(ref summary) = result.summary {
            println!("\n  Version: {}", summary.version);
            println!("  Mode: {}", summary.mode);
            if !summary.patch_shape.is_empty() {
                println!("  Patch shape: {:?}", summary.patch_shape);
                println!("  Overlap (voxels): {:?}", summary.overlap_voxels);
            }
            println!("  Classes: {}", summary.classes);
            println!("  Channels: {}", summary.channels);
            println!("  Epochs: {}", summary.epochs);
            println!("  Sinks: {}", summary.sink_count);
        }

        if let Some(ref warnings) = result.warnings {
            println!("\n⚠ Warnings:");
            for warning in warnings {
                println!("  - {}", warning);
            }
        }
    } else {
        println!("✗ Configuration is invalid: {}", result.config_path);
        if let Some(ref error) = result.error {
            println!("\n  Error: {}", error);
        }
    }
}

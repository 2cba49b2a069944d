//! `info` command implementation.

use std::collections::HashMap;

use anyhow::{Context, Result};
use contracts::{PipelineBlueprint, PostProcessConfig};
use serde::Serialize;
use tracing::info;

use crate::cli::InfoArgs;

/// Configuration info for JSON output
#[derive(Serialize)]
struct ConfigInfo {
    version: String,
    data: DataInfo,
    analysis: AnalysisInfo,
    training: TrainingInfo,
    cache: CacheInfo,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    postprocess: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    sinks: Vec<SinkInfo>,
}

#[derive(Serialize)]
struct DataInfo {
    three_dim: bool,
    channels: usize,
    classes: usize,
}

#[derive(Serialize)]
struct AnalysisInfo {
    mode: String,
    patch_shape: Vec<usize>,
    overlap: String,
    overlap_policy: String,
    batch_size: usize,
}

#[derive(Serialize)]
struct TrainingInfo {
    epochs: usize,
    learning_rate: f64,
    loss: String,
    metrics: Vec<String>,
    shuffle: bool,
    batch_queue_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Serialize)]
struct CacheInfo {
    prepare_batches: bool,
    prepare_subfunctions: bool,
    temp_dir: String,
    batch_prefix: String,
}

#[derive(Serialize)]
struct SinkInfo {
    name: String,
    sink_type: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    params: HashMap<String, String>,
}

/// Execute the `info` command
pub fn run_info(args: &InfoArgs) -> Result<()> {
    info!(config = %args.config.display(), "Loading configuration info");

    if !args.config.exists() {
        anyhow::bail!("Configuration file not found: {}", args.config.display());
    }

    let blueprint = config_loader::ConfigLoader::load_from_path(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    if args.json {
        let info = build_config_info(&blueprint, args);
        let json =
            serde_json::to_string_pretty(&info).context("Failed to serialize config info")?;
        println!("{}", json);
    } else {
        print_config_info(&blueprint, args);
    }

    Ok(())
}

fn describe_post_processor(config: &PostProcessConfig) -> String {
    match config {
        PostProcessConfig::LabelRemap { mapping } => {
            let pairs: Vec<String> = mapping
                .iter()
                .map(|[from, to]| format!("{from}->{to}"))
                .collect();
            format!("label_remap [{}]", pairs.join(", "))
        }
    }
}

fn build_config_info(blueprint: &PipelineBlueprint, args: &InfoArgs) -> ConfigInfo {
    let sinks = if args.sinks {
        blueprint
            .sinks
            .iter()
            .map(|s| SinkInfo {
                name: s.name.clone(),
                sink_type: format!("{:?}", s.sink_type),
                params: s.params.clone(),
            })
            .collect()
    } else {
        Vec::new()
    };

    let analysis = &blueprint.analysis;
    let training = &blueprint.training;
    let cache = &blueprint.cache;

    ConfigInfo {
        version: format!("{:?}", blueprint.version),
        data: DataInfo {
            three_dim: blueprint.data.three_dim,
            channels: blueprint.data.channels,
            classes: blueprint.data.classes,
        },
        analysis: AnalysisInfo {
            mode: format!("{:?}", analysis.mode),
            patch_shape: analysis.patch_shape.clone(),
            overlap: format!("{:?}", analysis.overlap),
            overlap_policy: format!("{:?}", analysis.overlap_policy),
            batch_size: analysis.batch_size,
        },
        training: TrainingInfo {
            epochs: training.epochs,
            learning_rate: training.learning_rate,
            loss: training.loss.clone(),
            metrics: training.metrics.clone(),
            shuffle: training.shuffle,
            batch_queue_size: training.batch_queue_size,
            seed: training.seed,
        },
        cache: CacheInfo {
            prepare_batches: cache.prepare_batches,
            prepare_subfunctions: cache.prepare_subfunctions,
            temp_dir: cache.temp_dir.display().to_string(),
            batch_prefix: cache.batch_prefix.clone(),
        },
        postprocess: blueprint
            .postprocess
            .iter()
            .map(describe_post_processor)
            .collect(),
        sinks,
    }
}

fn print_config_info(blueprint: &PipelineBlueprint, args: &InfoArgs) {
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                 segpipe Configuration                        ║");
    println!("╚══════════════════════════════════════════════════════════════╝\n");

    let data = &blueprint.data;
    println!("🗂  Data");
    println!("   ├─ Version: {:?}", blueprint.version);
    println!("   ├─ Dimensions: {}", if data.three_dim { "3D" } else { "2D" });
    println!("   ├─ Channels: {}", data.channels);
    println!("   └─ Classes: {}", data.classes);

    let analysis = &blueprint.analysis;
    println!("\n🧩 Analysis");
    println!("   ├─ Mode: {:?}", analysis.mode);
    if analysis.mode.is_patchwise() {
        println!("   ├─ Patch shape: {:?}", analysis.patch_shape);
        println!("   ├─ Overlap: {:?}", analysis.overlap);
        println!("   ├─ Overlap policy: {:?}", analysis.overlap_policy);
    }
    println!("   └─ Batch size: {}", analysis.batch_size);

    let training = &blueprint.training;
    println!("\n⚙️  Training");
    println!("   ├─ Epochs: {}", training.epochs);
    println!("   ├─ Learning rate: {}", training.learning_rate);
    println!("   ├─ Loss: {}", training.loss);
    println!("   ├─ Metrics: {:?}", training.metrics);
    println!("   ├─ Shuffle: {}", training.shuffle);
    println!("   ├─ Queue depth: {}", training.batch_queue_size);
    match training.seed {
        Some(seed) => println!("   └─ Seed: {}", seed),
        None => println!("   └─ Seed: (random)"),
    }

    let cache = &blueprint.cache;
    println!("\n💾 Batch cache");
    println!("   ├─ Prepare batches: {}", cache.prepare_batches);
    println!("   ├─ Prepare subfunctions: {}", cache.prepare_subfunctions);
    println!(
        "   └─ Files: {}/{}.*",
        cache.temp_dir.display(),
        cache.batch_prefix
    );

    if !blueprint.postprocess.is_empty() {
        println!("\n🔧 Post-processing ({})", blueprint.postprocess.len());
        for (i, config) in blueprint.postprocess.iter().enumerate() {
            let is_last = i == blueprint.postprocess.len() - 1;
            let prefix = if is_last { "└─" } else { "├─" };
            println!("   {} {}", prefix, describe_post_processor(config));
        }
    }

    if !blueprint.sinks.is_empty() {
        println!("\n📤 Sinks ({})", blueprint.sinks.len());
        for (i, sink) in blueprint.sinks.iter().enumerate() {
            let is_last = i == blueprint.sinks.len() - 1;
            let prefix = if is_last { "└─" } else { "├─" };
            println!("   {} {} ({:?})", prefix, sink.name, sink.sink_type);
            if args.sinks {
                let child_prefix = if is_last { "   " } else { "│  " };
                let mut params: Vec<_> = sink.params.iter().collect();
                params.sort();
                for (key, value) in params {
                    println!("   {}  • {} = {}", child_prefix, key, value);
                }
            }
        }
    }

    println!();
}

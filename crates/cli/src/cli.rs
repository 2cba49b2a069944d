//! CLI argument definitions using clap.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// segpipe - patch-based segmentation pipeline
#[derive(Parser, Debug)]
#[command(
    name = "segpipe",
    author,
    version,
    about = "Patch-based medical image segmentation pipeline",
    long_about = "Trains, evaluates and runs segmentation models on volumes too large \n\
                  to process at once.\n\n\
                  Volumes are split into overlapping patches, predicted patch by patch, \n\
                  reassembled to their original shape and written to configured sinks."
)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true, env = "SEGPIPE_VERBOSE")]
    pub verbose: u8,

    /// Suppress all output except warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log output format
    #[arg(
        long,
        value_enum,
        default_value = "pretty",
        global = true,
        env = "SEGPIPE_LOG_FORMAT"
    )]
    pub log_format: LogFormat,

    /// Prometheus metrics port (0 = disabled)
    #[arg(long, default_value = "0", global = true, env = "SEGPIPE_METRICS_PORT")]
    pub metrics_port: u16,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fit a model on the selected samples
    Train(TrainArgs),

    /// Predict label volumes and write them to the configured sinks
    Predict(PredictArgs),

    /// Fit on one sample set and score another after every epoch
    Evaluate(EvaluateArgs),

    /// Validate configuration file without running
    Validate(ValidateArgs),

    /// Display configuration information
    Info(InfoArgs),
}

/// Options shared by the commands that run the pipeline
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Path to configuration file (TOML or JSON)
    #[arg(
        short,
        long,
        default_value = "segpipe.toml",
        env = "SEGPIPE_CONFIG"
    )]
    pub config: PathBuf,

    /// Sample directory (`<data>/<sample_id>/imaging.npy`)
    #[arg(short, long, env = "SEGPIPE_DATA")]
    pub data: PathBuf,

    /// Samples to use, comma separated (default: every sample in the data directory)
    #[arg(long, value_delimiter = ',')]
    pub samples: Vec<String>,

    /// Override training.epochs
    #[arg(long)]
    pub epochs: Option<usize>,

    /// Override training.batch_queue_size
    #[arg(long, env = "SEGPIPE_QUEUE_DEPTH")]
    pub queue_depth: Option<usize>,

    /// Override training.seed
    #[arg(long)]
    pub seed: Option<u64>,

    /// Validate configuration and exit without running the pipeline
    #[arg(long)]
    pub dry_run: bool,
}

/// Arguments for the `train` command
#[derive(Args, Debug, Clone)]
pub struct TrainArgs {
    #[command(flatten)]
    pub run: RunArgs,

    /// Start from a saved model (path prefix) instead of fresh weights
    #[arg(long)]
    pub model: Option<PathBuf>,

    /// Path prefix the trained model is saved under
    #[arg(long, default_value = "model", env = "SEGPIPE_MODEL_OUT")]
    pub model_out: PathBuf,

    /// Write the epoch history as JSON
    #[arg(long)]
    pub history_out: Option<PathBuf>,
}

/// Arguments for the `predict` command
#[derive(Args, Debug, Clone)]
pub struct PredictArgs {
    #[command(flatten)]
    pub run: RunArgs,

    /// Saved model to predict with (path prefix)
    #[arg(short, long, env = "SEGPIPE_MODEL")]
    pub model: Option<PathBuf>,

    /// Output the run summary as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the `evaluate` command
#[derive(Args, Debug, Clone)]
pub struct EvaluateArgs {
    #[command(flatten)]
    pub run: RunArgs,

    /// Validation samples, comma separated (default: split off the selected samples)
    #[arg(long, value_delimiter = ',')]
    pub validation: Vec<String>,

    /// Share of the selected samples held out for validation when
    /// `--validation` is not given
    #[arg(long, default_value = "0.2")]
    pub validation_fraction: f64,

    /// Start from a saved model (path prefix) instead of fresh weights
    #[arg(long)]
    pub model: Option<PathBuf>,

    /// Save the fitted model under this path prefix
    #[arg(long)]
    pub model_out: Option<PathBuf>,

    /// Write the epoch history as JSON
    #[arg(long)]
    pub history_out: Option<PathBuf>,
}

/// Arguments for the `validate` command
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Path to configuration file to validate
    #[arg(short, long, default_value = "segpipe.toml", env = "SEGPIPE_CONFIG")]
    pub config: PathBuf,

    /// Output validation result as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the `info` command
#[derive(Parser, Debug)]
pub struct InfoArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "segpipe.toml", env = "SEGPIPE_CONFIG")]
    pub config: PathBuf,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,

    /// Show sink configuration
    #[arg(long)]
    pub sinks: bool,
}

/// Log output format
#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum LogFormat {
    /// JSON structured logging
    Json,
    /// Human-readable pretty format
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
}

impl From<LogFormat> for observability::LogFormat {
    fn from(format: LogFormat) -> Self {
        match format {
            LogFormat::Json => Self::Json,
            LogFormat::Pretty => Self::Pretty,
            LogFormat::Compact => Self::Compact,
        }
    }
}

//! Sink construction from configuration and fan-out to several sinks.

use std::sync::Arc;

use contracts::{ContractError, LabelVolume, PredictionSink, SampleId, SinkConfig, SinkType};
use tracing::{debug, info, instrument, warn};

use crate::error::DispatcherError;
use crate::metrics::{MetricsSnapshot, SinkMetrics};
use crate::sinks::{FileSink, LogSink};

/// A sink built from configuration
pub enum ConfiguredSink {
    Log(LogSink),
    File(FileSink),
}

impl PredictionSink for ConfiguredSink {
    fn name(&self) -> &str {
        match self {
            Self::Log(sink) => sink.name(),
            Self::File(sink) => sink.name(),
        }
    }

    async fn write(
        &mut self,
        sample_id: &SampleId,
        volume: &LabelVolume,
    ) -> Result<(), ContractError> {
        match self {
            Self::Log(sink) => sink.write(sample_id, volume).await,
            Self::File(sink) => sink.write(sample_id, volume).await,
        }
    }

    async fn flush(&mut self) -> Result<(), ContractError> {
        match self {
            Self::Log(sink) => sink.flush().await,
            Self::File(sink) => sink.flush().await,
        }
    }

    async fn close(&mut self) -> Result<(), ContractError> {
        match self {
            Self::Log(sink) => sink.close().await,
            Self::File(sink) => sink.close().await,
        }
    }
}

/// Create a sink from configuration
#[instrument(
    name = "dispatcher_create_sink",
    skip(config),
    fields(sink = %config.name, sink_type = ?config.sink_type)
)]
pub fn create_sink(config: &SinkConfig) -> Result<ConfiguredSink, DispatcherError> {
    match config.sink_type {
        SinkType::Log => Ok(ConfiguredSink::Log(LogSink::new(&config.name))),
        SinkType::File => {
            let sink = FileSink::from_params(&config.name, &config.params)
                .map_err(|e| DispatcherError::sink_creation(&config.name, e.to_string()))?;
            Ok(ConfiguredSink::File(sink))
        }
    }
}

/// Fan-out over several sinks.
///
/// Every sink receives every prediction, in configuration order. A failing
/// sink does not stop the remaining ones; the first error is returned once
/// all sinks were tried.
pub struct SinkSet {
    name: String,
    sinks: Vec<(ConfiguredSink, Arc<SinkMetrics>)>,
}

impl SinkSet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sinks: Vec::new(),
        }
    }

    /// Build every configured sink
    pub fn from_configs(configs: &[SinkConfig]) -> Result<Self, DispatcherError> {
        let mut set = Self::new("sinks");
        for config in configs {
            if set.sinks.iter().any(|(sink, _)| sink.name() == config.name) {
                return Err(DispatcherError::DuplicateSink {
                    name: config.name.clone(),
                });
            }
            set.push(create_sink(config)?);
        }
        info!(sinks = set.len(), "sink set ready");
        Ok(set)
    }

    pub fn push(&mut self, sink: ConfiguredSink) {
        self.sinks.push((sink, Arc::new(SinkMetrics::new())));
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Per-sink metrics, in configuration order
    pub fn metrics(&self) -> Vec<(String, MetricsSnapshot)> {
        self.sinks
            .iter()
            .map(|(sink, metrics)| (sink.name().to_string(), metrics.snapshot()))
            .collect()
    }
}

/// Keep the first error, log the rest
fn keep_first(first: &mut Option<ContractError>, sink: &str, err: ContractError) {
    if first.is_some() {
        warn!(sink = %sink, error = %err, "additional sink failure");
    } else {
        *first = Some(err);
    }
}

impl PredictionSink for SinkSet {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(
        name = "sink_set_write",
        skip(self, volume),
        fields(sinks = self.sinks.len(), sample_id = %sample_id)
    )]
    async fn write(
        &mut self,
        sample_id: &SampleId,
        volume: &LabelVolume,
    ) -> Result<(), ContractError> {
        let mut first_error = None;
        for (sink, metrics) in &mut self.sinks {
            match sink.write(sample_id, volume).await {
                Ok(()) => metrics.record_write(volume.len()),
                Err(err) => {
                    metrics.inc_failure_count();
                    keep_first(&mut first_error, sink.name(), err);
                }
            }
        }
        debug!("prediction dispatched");
        first_error.map_or(Ok(()), Err)
    }

    async fn flush(&mut self) -> Result<(), ContractError> {
        let mut first_error = None;
        for (sink, _) in &mut self.sinks {
            if let Err(err) = sink.flush().await {
                keep_first(&mut first_error, sink.name(), err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn close(&mut self) -> Result<(), ContractError> {
        let mut first_error = None;
        for (sink, _) in &mut self.sinks {
            if let Err(err) = sink.close().await {
                keep_first(&mut first_error, sink.name(), err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

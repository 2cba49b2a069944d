//! LogSink - logs a prediction summary via tracing

use contracts::{ContractError, LabelVolume, PredictionSink, SampleId, VolumeShape};
use tracing::{info, instrument};

/// Sink that logs per-prediction summaries
pub struct LogSink {
    name: String,
    written: u64,
}

impl LogSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            written: 0,
        }
    }

    /// Predictions logged so far
    pub fn written(&self) -> u64 {
        self.written
    }

    fn log_summary(&self, sample_id: &SampleId, volume: &LabelVolume) {
        let shape = VolumeShape::from(volume.shape());
        let histogram = class_histogram(volume);
        let foreground: usize = histogram.iter().skip(1).sum();

        info!(
            sink = %self.name,
            sample_id = %sample_id,
            shape = %shape,
            classes_present = histogram.iter().filter(|&&n| n > 0).count(),
            foreground_voxels = foreground,
            ?histogram,
            "prediction received"
        );
    }
}

/// Voxel count per label, indexed by label
pub fn class_histogram(volume: &LabelVolume) -> Vec<usize> {
    let mut counts = Vec::new();
    for &label in volume {
        let label = usize::from(label);
        if label >= counts.len() {
            counts.resize(label + 1, 0);
        }
        counts[label] += 1;
    }
    counts
}

impl PredictionSink for LogSink {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(
        name = "log_sink_write",
        skip(self, volume),
        fields(sink = %self.name, sample_id = %sample_id)
    )]
    async fn write(
        &mut self,
        sample_id: &SampleId,
        volume: &LabelVolume,
    ) -> Result<(), ContractError> {
        self.log_summary(sample_id, volume);
        self.written += 1;
        Ok(())
    }

    #[instrument(name = "log_sink_flush", skip(self))]
    async fn flush(&mut self) -> Result<(), ContractError> {
        // Nothing buffered
        Ok(())
    }

    #[instrument(name = "log_sink_close", skip(self))]
    async fn close(&mut self) -> Result<(), ContractError> {
        info!(sink = %self.name, written = self.written, "LogSink closed");
        Ok(())
    }
}

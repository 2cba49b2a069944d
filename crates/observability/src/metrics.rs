//! Pipeline run metrics.
//!
//! Recording helpers push to the global `metrics` recorder; the
//! [`RunMetricsAggregator`] keeps the same numbers in memory for the end of
//! run summary.

use metrics::{counter, gauge, histogram};

/// Record one sample leaving the predict loop
pub fn record_sample_predicted(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("segpipe_samples_predicted_total", "status" => status).increment(1);
}

/// Record one reconstructed volume
///
/// ```ignore
/// use observability::metrics::record_reconstruction;
///
/// let started = Instant::now();
/// let volume = reconstruct(patches.view(), &shape, &geometry, policy)?;
/// record_reconstruction(patch_count, started.elapsed().as_secs_f64() * 1000.0);
/// ```
pub fn record_reconstruction(patches: usize, elapsed_ms: f64) {
    counter!("segpipe_patches_reassembled_total").increment(patches as u64);
    histogram!("segpipe_reconstruction_ms").record(elapsed_ms);
}

/// Record files deleted by the resource janitor
pub fn record_cleanup(files_removed: usize) {
    counter!("segpipe_cleanup_files_removed_total").increment(files_removed as u64);
}

/// Record the losses of a finished training epoch
pub fn record_epoch(epoch: usize, loss: f64, val_loss: Option<f64>) {
    gauge!("segpipe_epoch").set(epoch as f64);
    gauge!("segpipe_epoch_loss").set(loss);
    if let Some(val_loss) = val_loss {
        gauge!("segpipe_epoch_val_loss").set(val_loss);
    }
}

/// In-memory aggregate of a predict run
#[derive(Debug, Clone, Default)]
pub struct RunMetricsAggregator {
    /// Samples written to the sink
    pub samples_succeeded: u64,

    /// Samples that failed at any stage
    pub samples_failed: u64,

    /// Patches per reconstructed sample
    pub patch_stats: RunningStats,

    /// Reconstruction wall time per sample
    pub reconstruction_ms: RunningStats,
}

impl RunMetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_reconstruction(&mut self, patches: usize, elapsed_ms: f64) {
        self.patch_stats.push(patches as f64);
        self.reconstruction_ms.push(elapsed_ms);
    }

    pub fn record_outcome(&mut self, success: bool) {
        if success {
            self.samples_succeeded += 1;
        } else {
            self.samples_failed += 1;
        }
    }

    pub fn summary(&self) -> RunSummary {
        let total = self.samples_succeeded + self.samples_failed;
        RunSummary {
            samples_succeeded: self.samples_succeeded,
            samples_failed: self.samples_failed,
            failure_rate: if total > 0 {
                self.samples_failed as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            patches_per_sample: StatsSummary::from(&self.patch_stats),
            reconstruction_ms: StatsSummary::from(&self.reconstruction_ms),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Summary of a predict run
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub samples_succeeded: u64,
    pub samples_failed: u64,
    pub failure_rate: f64,
    pub patches_per_sample: StatsSummary,
    pub reconstruction_ms: StatsSummary,
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Prediction Summary ===")?;
        writeln!(f, "Samples written: {}", self.samples_succeeded)?;
        writeln!(
            f,
            "Samples failed: {} ({:.2}%)",
            self.samples_failed, self.failure_rate
        )?;
        writeln!(f, "Patches per sample: {}", self.patches_per_sample)?;
        writeln!(f, "Reconstruction (ms): {}", self.reconstruction_ms)?;
        Ok(())
    }
}

/// Summary of a [`RunningStats`]
#[derive(Debug, Clone, Default)]
pub struct StatsSummary {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
}

impl From<&RunningStats> for StatsSummary {
    fn from(stats: &RunningStats) -> Self {
        Self {
            count: stats.count,
            min: stats.min,
            max: stats.max,
            mean: stats.mean(),
            std_dev: stats.std_dev(),
        }
    }
}

impl std::fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.count == 0 {
            write!(f, "N/A")
        } else {
            write!(
                f,
                "min={:.3}, max={:.3}, mean={:.3}, std={:.3} (n={})",
                self.min, self.max, self.mean, self.std_dev, self.count
            )
        }
    }
}

/// Online mean and variance (Welford)
#[derive(Debug, Clone, Default)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl RunningStats {
    pub fn push(&mut self, value: f64) {
        self.count += 1;

        if self.count == 1 {
            self.min = value;
            self.max = value;
            self.mean = value;
            self.m2 = 0.0;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);

            let delta = value - self.mean;
            self.mean += delta / self.count as f64;
            let delta2 = value - self.mean;
            self.m2 += delta * delta2;
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.mean
        }
    }

    /// Sample variance
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }
}

//! Pipeline orchestrator - drives train, predict and evaluate.
//!
//! Batches are pulled from a [`BatchStream`] through a bounded prefetch
//! queue. Predictions of patch-based analysis modes are reassembled with the
//! shape recorded by the preprocessor, discretized, post-processed and
//! emitted one sample at a time. Temporary batch files are removed after
//! every sample and after every train/evaluate stage, whatever the outcome.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use contracts::{
    AnalysisMode, Batch, BatchStream, ContractError, EpochRecord, History, LabelVolume, Metric,
    ModelPaths, OverlapPolicy, PipelineBlueprint, PipelineHook, PostProcessor, PredictionSink,
    SampleId, ScoreVolume, SegmentationModel, StreamMode, TrainingConfig,
};
use ingestion::BatchPrefetcher;
use ndarray::{concatenate, ArrayD, ArrayViewD, Axis};
use observability::{RunMetricsAggregator, RunSummary};
use patching::{discretize, reconstruct, PatchGeometry, ShapeCache};
use tracing::{debug, info, instrument, warn};

use crate::error::{PipelineError, PipelineMode, SampleStage};
use crate::janitor::ResourceJanitor;
use crate::postprocess::build_post_processors;
use crate::scoring::MetricRegistry;

/// Outcome of a predict run
#[derive(Debug, Default)]
pub struct PredictReport {
    /// `(sample, labels)` in input order (direct mode only)
    pub predictions: Vec<(SampleId, LabelVolume)>,

    /// Samples that reached the output
    pub emitted: Vec<SampleId>,

    /// Per-sample failures, plus cleanup and flush failures
    pub failures: Vec<PipelineError>,
}

impl PredictReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// The predictions, or the first recorded failure
    pub fn into_result(self) -> Result<Vec<(SampleId, LabelVolume)>, PipelineError> {
        match self.failures.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(self.predictions),
        }
    }
}

/// Collects predictions in memory for direct output
#[derive(Default)]
struct Collector {
    predictions: Vec<(SampleId, LabelVolume)>,
}

impl PredictionSink for Collector {
    fn name(&self) -> &str {
        "direct"
    }

    async fn write(
        &mut self,
        sample_id: &SampleId,
        volume: &LabelVolume,
    ) -> Result<(), ContractError> {
        self.predictions.push((sample_id.clone(), volume.clone()));
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), ContractError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ContractError> {
        Ok(())
    }
}

/// Running means over one pass of a stream
#[derive(Debug, Default)]
struct PassStats {
    batches: usize,
    loss_sum: f64,
    metric_sums: BTreeMap<String, f64>,
}

impl PassStats {
    fn push(&mut self, loss: f32, metrics: BTreeMap<String, f32>) {
        self.batches += 1;
        self.loss_sum += f64::from(loss);
        for (name, value) in metrics {
            *self.metric_sums.entry(name).or_default() += f64::from(value);
        }
    }

    fn loss(&self) -> f32 {
        if self.batches == 0 {
            return 0.0;
        }
        (self.loss_sum / self.batches as f64) as f32
    }

    fn metrics(&self) -> BTreeMap<String, f32> {
        let n = self.batches.max(1) as f64;
        self.metric_sums
            .iter()
            .map(|(name, sum)| (name.clone(), (sum / n) as f32))
            .collect()
    }
}

/// Main pipeline orchestrator
pub struct Pipeline<M, B> {
    model: M,
    stream: B,
    shape_cache: Arc<ShapeCache>,
    mode: AnalysisMode,
    /// Present for patch-based analysis modes
    geometry: Option<PatchGeometry>,
    policy: OverlapPolicy,
    training: TrainingConfig,
    janitor: ResourceJanitor,
    hooks: Vec<Box<dyn PipelineHook>>,
    post_processors: Vec<Box<dyn PostProcessor>>,
    metrics: MetricRegistry,
    initial_weights: Vec<f32>,
    run_metrics: RunMetricsAggregator,
}

impl<M, B> Pipeline<M, B>
where
    M: SegmentationModel,
    B: BatchStream,
{
    /// Assemble a pipeline.
    ///
    /// `shape_cache` must be the cache `stream` records shapes in. The model's
    /// current parameters become the target of [`Pipeline::reset_weights`].
    ///
    /// # Errors
    /// `Config` for an invalid patch geometry (`InvalidOverlap`, zero window)
    /// or an unknown metric identifier.
    pub fn new(
        model: M,
        stream: B,
        shape_cache: Arc<ShapeCache>,
        blueprint: &PipelineBlueprint,
    ) -> Result<Self, PipelineError> {
        let analysis = &blueprint.analysis;
        let geometry = if analysis.mode.is_patchwise() {
            Some(PatchGeometry::new(&analysis.patch_shape, &analysis.overlap)?)
        } else {
            None
        };
        let metrics = MetricRegistry::from_names(&blueprint.training.metrics)?;
        let initial_weights = model.weights();

        info!(
            model = model.name(),
            mode = ?analysis.mode,
            policy = ?analysis.overlap_policy,
            metrics = ?metrics.names(),
            "Pipeline initialized"
        );

        Ok(Self {
            model,
            stream,
            shape_cache,
            mode: analysis.mode,
            geometry,
            policy: analysis.overlap_policy,
            training: blueprint.training.clone(),
            janitor: ResourceJanitor::from_config(&blueprint.cache),
            hooks: Vec::new(),
            post_processors: build_post_processors(&blueprint.postprocess),
            metrics,
            initial_weights,
            run_metrics: RunMetricsAggregator::new(),
        })
    }

    /// Append a hook; hooks run in registration order
    pub fn with_hook(mut self, hook: impl PipelineHook + 'static) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }

    pub fn add_hook(&mut self, hook: Box<dyn PipelineHook>) {
        self.hooks.push(hook);
    }

    /// Append a post-processor after the configured ones
    pub fn add_post_processor(&mut self, processor: Box<dyn PostProcessor>) {
        self.post_processors.push(processor);
    }

    pub fn register_metric(&mut self, metric: Box<dyn Metric>) {
        self.metrics.register(metric);
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn stream(&self) -> &B {
        &self.stream
    }

    pub fn shape_cache(&self) -> &Arc<ShapeCache> {
        &self.shape_cache
    }

    pub fn analysis_mode(&self) -> AnalysisMode {
        self.mode
    }

    pub fn geometry(&self) -> Option<&PatchGeometry> {
        self.geometry.as_ref()
    }

    pub fn janitor(&self) -> &ResourceJanitor {
        &self.janitor
    }

    /// Aggregate of every predict call so far
    pub fn run_summary(&self) -> RunSummary {
        self.run_metrics.summary()
    }

    // ========================================================================
    // Train / Evaluate
    // ========================================================================

    /// Fit the model for the configured number of epochs.
    #[instrument(name = "pipeline_train", skip(self, samples), fields(samples = samples.len()))]
    pub async fn train(&mut self, samples: &[SampleId]) -> Result<History, PipelineError> {
        let result = self.fit(PipelineMode::Train, samples, None).await;
        self.finish_stage(PipelineMode::Train, result)
    }

    /// Fit on `training` and score `validation` after every epoch.
    #[instrument(
        name = "pipeline_evaluate",
        skip(self, training, validation),
        fields(training = training.len(), validation = validation.len())
    )]
    pub async fn evaluate(
        &mut self,
        training: &[SampleId],
        validation: &[SampleId],
    ) -> Result<History, PipelineError> {
        let result = self
            .fit(PipelineMode::Evaluate, training, Some(validation))
            .await;
        self.finish_stage(PipelineMode::Evaluate, result)
    }

    async fn fit(
        &mut self,
        mode: PipelineMode,
        training: &[SampleId],
        validation: Option<&[SampleId]>,
    ) -> Result<History, PipelineError> {
        let shuffle = self.training.shuffle;
        let mut history = History::default();

        self.notify(|hook| hook.on_train_begin());
        for epoch in 0..self.training.epochs {
            self.notify(|hook| hook.on_epoch_begin(epoch));

            let pass = self
                .run_pass(mode, training, StreamMode::training(shuffle))
                .await?;
            let mut record = EpochRecord {
                epoch,
                loss: pass.loss(),
                metrics: pass.metrics(),
                ..Default::default()
            };

            if let Some(validation) = validation {
                let pass = self
                    .run_pass(mode, validation, StreamMode::validation(shuffle))
                    .await?;
                record.val_loss = Some(pass.loss());
                record.val_metrics = pass.metrics();
            }

            observability::record_epoch(epoch, f64::from(record.loss), record.val_loss.map(f64::from));
            info!(
                %mode,
                epoch,
                loss = record.loss,
                val_loss = ?record.val_loss,
                metrics = ?record.metrics,
                "Epoch finished"
            );

            self.notify(|hook| hook.on_epoch_end(&record));
            history.epochs.push(record);
        }
        self.notify(|hook| hook.on_train_end(&history));

        Ok(history)
    }

    /// One pass over `samples`: a parameter update per batch, or a loss
    /// evaluation per batch for validation streams. Batch files prepared for
    /// the pass are removed once it completes.
    async fn run_pass(
        &mut self,
        mode: PipelineMode,
        samples: &[SampleId],
        stream_mode: StreamMode,
    ) -> Result<PassStats, PipelineError> {
        let batches = self
            .stream
            .stream(samples, stream_mode)
            .map_err(|e| PipelineError::stage(mode, e))?;
        let mut prefetch = BatchPrefetcher::spawn(batches, self.training.batch_queue_size);

        let mut stats = PassStats::default();
        let mut failure = None;
        while let Some(item) = prefetch.next().await {
            match item.and_then(|batch| self.step(&batch, stream_mode.validation)) {
                Ok((loss, metrics)) => stats.push(loss, metrics),
                Err(e) => {
                    failure = Some(PipelineError::stage(mode, e));
                    break;
                }
            }
        }

        let finished = prefetch.finish().await;
        if let Some(err) = failure {
            return Err(err);
        }
        let snapshot = finished?;

        // every batch file of this pass has been read back
        let removed = self
            .janitor
            .cleanup()
            .map_err(|source| PipelineError::Cleanup { mode, source })?;

        if stats.batches == 0 {
            warn!(%mode, validation = stream_mode.validation, "Pass produced no batches");
        }
        debug!(
            %mode,
            batches = stats.batches,
            max_queue_depth = snapshot.max_depth,
            removed_files = removed,
            "Pass finished"
        );
        Ok(stats)
    }

    fn step(
        &mut self,
        batch: &Batch,
        validation: bool,
    ) -> Result<(f32, BTreeMap<String, f32>), ContractError> {
        let labels = batch.labels.as_ref().ok_or_else(|| {
            ContractError::batch_stream(&batch.sample_id, "training batch carries no labels")
        })?;

        let images = batch.images.view();
        let loss = if validation {
            self.model.test_on_batch(images, labels.view())?
        } else {
            self.model.train_on_batch(images, labels.view())?
        };

        let metrics = if self.metrics.is_empty() {
            BTreeMap::new()
        } else {
            let predicted = self.model.predict(batch.images.view())?;
            self.metrics.score_all(predicted.view(), labels.view())
        };
        Ok((loss, metrics))
    }

    /// Run the janitor; a stage error wins over a cleanup error
    fn finish_stage<T>(
        &self,
        mode: PipelineMode,
        result: Result<T, PipelineError>,
    ) -> Result<T, PipelineError> {
        match (result, self.janitor.cleanup()) {
            (Ok(value), Ok(_)) => Ok(value),
            (Ok(_), Err(source)) => Err(PipelineError::Cleanup { mode, source }),
            (Err(err), Err(cleanup)) => {
                warn!(%mode, error = %cleanup, "Cleanup after failed stage also failed");
                Err(err)
            }
            (Err(err), Ok(_)) => Err(err),
        }
    }

    // ========================================================================
    // Predict
    // ========================================================================

    /// Predict every sample and return the label volumes.
    ///
    /// A failing sample is recorded in the report and the remaining samples
    /// are still predicted.
    #[instrument(name = "pipeline_predict_direct", skip(self, samples), fields(samples = samples.len()))]
    pub async fn predict_direct(&mut self, samples: &[SampleId]) -> PredictReport {
        let mut collector = Collector::default();
        let mut report = self.predict_into(samples, &mut collector).await;
        report.predictions = collector.predictions;
        report
    }

    /// Predict every sample and write each label volume to `sink`.
    ///
    /// The sink is flushed at the end but not closed.
    #[instrument(
        name = "pipeline_predict",
        skip(self, samples, sink),
        fields(samples = samples.len(), sink = %sink.name())
    )]
    pub async fn predict_to_sink<S: PredictionSink>(
        &mut self,
        samples: &[SampleId],
        sink: &mut S,
    ) -> PredictReport {
        self.predict_into(samples, sink).await
    }

    async fn predict_into<S: PredictionSink>(
        &mut self,
        samples: &[SampleId],
        sink: &mut S,
    ) -> PredictReport {
        let started = Instant::now();
        let mut report = PredictReport::default();

        for sample_id in samples {
            self.notify(|hook| hook.on_sample_begin(sample_id));

            let result = self.predict_sample(sample_id, sink).await;
            let success = result.is_ok();
            match result {
                Ok(()) => {
                    self.notify(|hook| hook.on_sample_end(sample_id));
                    report.emitted.push(sample_id.clone());
                }
                Err(err) => {
                    warn!(sample_id = %sample_id, error = %err, "Sample failed");
                    self.discard_shape(sample_id);
                    report.failures.push(err);
                }
            }
            observability::record_sample_predicted(success);
            self.run_metrics.record_outcome(success);

            if let Err(source) = self.janitor.cleanup() {
                if success {
                    report.failures.push(PipelineError::Cleanup {
                        mode: PipelineMode::Predict,
                        source,
                    });
                } else {
                    warn!(sample_id = %sample_id, error = %source, "Cleanup after failed sample also failed");
                }
            }
        }

        if let Err(e) = sink.flush().await {
            report
                .failures
                .push(PipelineError::stage(PipelineMode::Predict, e));
        }

        info!(
            emitted = report.emitted.len(),
            failed = report.failures.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Prediction finished"
        );
        report
    }

    /// Fetching -> Infer -> Reassemble -> Discretize -> PostProcess -> Emit
    async fn predict_sample<S: PredictionSink>(
        &mut self,
        sample_id: &SampleId,
        sink: &mut S,
    ) -> Result<(), PipelineError> {
        let scores = self.infer(sample_id).await?;
        let volume = self.reassemble(sample_id, scores)?;

        let mut labels = discretize(volume.view())
            .map_err(|e| PipelineError::sample(sample_id, SampleStage::Discretize, e))?;

        for processor in &self.post_processors {
            processor
                .apply(&mut labels)
                .map_err(|e| PipelineError::sample(sample_id, SampleStage::PostProcess, e))?;
        }

        sink.write(sample_id, &labels)
            .await
            .map_err(|e| PipelineError::sample(sample_id, SampleStage::Emit, e))?;

        debug!(sample_id = %sample_id, shape = ?labels.shape(), "Prediction emitted");
        Ok(())
    }

    /// Model scores of every batch of one sample, stacked on the patch axis
    async fn infer(&mut self, sample_id: &SampleId) -> Result<ArrayD<f32>, PipelineError> {
        let fetch_err = |e| PipelineError::sample(sample_id, SampleStage::Fetching, e);

        let batches = self
            .stream
            .stream(std::slice::from_ref(sample_id), StreamMode::inference())
            .map_err(fetch_err)?;
        let mut prefetch = BatchPrefetcher::spawn(batches, self.training.batch_queue_size);

        let mut outputs = Vec::new();
        let mut failure = None;
        while let Some(item) = prefetch.next().await {
            let batch = match item {
                Ok(batch) if batch.sample_id == *sample_id => batch,
                Ok(batch) => {
                    failure = Some(fetch_err(ContractError::batch_stream(
                        sample_id,
                        format!("stream yielded a batch of '{}'", batch.sample_id),
                    )));
                    break;
                }
                Err(e) => {
                    failure = Some(fetch_err(e));
                    break;
                }
            };
            match self.model.predict(batch.images.view()) {
                Ok(scores) => outputs.push(scores),
                Err(e) => {
                    failure = Some(PipelineError::sample(sample_id, SampleStage::Infer, e));
                    break;
                }
            }
        }

        let finished = prefetch.finish().await;
        if let Some(err) = failure {
            return Err(err);
        }
        finished?;

        if outputs.is_empty() {
            return Err(fetch_err(ContractError::batch_stream(
                sample_id,
                "stream yielded no batches",
            )));
        }
        stack(outputs).map_err(|e| PipelineError::sample(sample_id, SampleStage::Infer, e))
    }

    /// Undo the decomposition (patch modes) or drop the unit batch axis
    fn reassemble(
        &mut self,
        sample_id: &SampleId,
        scores: ArrayD<f32>,
    ) -> Result<ScoreVolume, PipelineError> {
        let stage_err = |e| PipelineError::sample(sample_id, SampleStage::Reassemble, e);

        let Some(geometry) = &self.geometry else {
            if scores.shape().first() != Some(&1) {
                let got = &scores.shape()[..scores.ndim().min(1)];
                return Err(stage_err(ContractError::patch_shape(
                    "full-volume batch axis",
                    &[1],
                    got,
                )));
            }
            return Ok(scores.index_axis_move(Axis(0), 0));
        };

        let shape = self.shape_cache.pop(sample_id).map_err(stage_err)?;
        let patches = scores.len_of(Axis(0));
        let started = Instant::now();
        let volume = reconstruct(scores.view(), &shape, geometry, self.policy).map_err(stage_err)?;

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        observability::record_reconstruction(patches, elapsed_ms);
        self.run_metrics.record_reconstruction(patches, elapsed_ms);
        Ok(volume)
    }

    /// Drop a record a failed sample left behind, so predicting it again
    /// does not hit `DuplicateShape`
    fn discard_shape(&self, sample_id: &SampleId) {
        if self.geometry.is_some() && self.shape_cache.pop(sample_id).is_ok() {
            debug!(sample_id = %sample_id, "Discarded shape record of failed sample");
        }
    }

    // ========================================================================
    // Model management
    // ========================================================================

    /// Descriptor and weight paths for a prefix
    pub fn model_paths(&self, prefix: impl AsRef<Path>) -> ModelPaths {
        let (descriptor, weights) = self.model.file_extensions();
        ModelPaths::from_prefix(prefix, descriptor, weights)
    }

    /// Write `<prefix>.model.<ext>` and `<prefix>.weights.<ext>`
    pub fn dump(&self, prefix: impl AsRef<Path>) -> Result<ModelPaths, ContractError> {
        let paths = self.model_paths(prefix);
        self.model.save(&paths)?;
        info!(
            descriptor = %paths.descriptor.display(),
            weights = %paths.weights.display(),
            "Model dumped"
        );
        Ok(paths)
    }

    /// Restore the model written by [`Pipeline::dump`]
    pub fn load(&mut self, prefix: impl AsRef<Path>) -> Result<ModelPaths, ContractError> {
        let paths = self.model_paths(prefix);
        self.model.load(&paths)?;
        info!(weights = %paths.weights.display(), "Model loaded");
        Ok(paths)
    }

    /// Restore the parameters the model had when the pipeline was built
    pub fn reset_weights(&mut self) -> Result<(), ContractError> {
        self.model.set_weights(&self.initial_weights)
    }

    fn notify(&mut self, mut event: impl FnMut(&mut dyn PipelineHook)) {
        for hook in &mut self.hooks {
            event(hook.as_mut());
        }
    }
}

/// Concatenate per-batch outputs along the patch axis
fn stack(mut outputs: Vec<ArrayD<f32>>) -> Result<ArrayD<f32>, ContractError> {
    if outputs.len() == 1 {
        if let Some(single) = outputs.pop() {
            return Ok(single);
        }
    }
    let views: Vec<ArrayViewD<'_, f32>> = outputs.iter().map(|o| o.view()).collect();
    concatenate(Axis(0), &views)
        .map_err(|e| ContractError::Other(format!("cannot stack model outputs: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CentroidModel;
    use contracts::{BatchIter, Overlap, PostProcessConfig, Sample};
    use dispatcher::LogSink;
    use ingestion::{InMemorySource, Preprocessor};
    use ndarray::{Dimension, IxDyn};
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Scores class 1 with the first channel's intensity, class 0 with its
    /// complement
    #[derive(Default)]
    struct ThresholdModel {
        calls: usize,
        fail_on_call: Option<usize>,
    }

    impl SegmentationModel for ThresholdModel {
        fn name(&self) -> &str {
            "threshold"
        }

        fn predict(&mut self, images: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, ContractError> {
            self.calls += 1;
            if self.fail_on_call == Some(self.calls) {
                return Err(ContractError::model("threshold", "device lost"));
            }
            let last = images.ndim() - 1;
            let intensity = images.index_axis(Axis(last), 0);
            let mut dims = images.shape()[..last].to_vec();
            dims.push(2);
            Ok(ArrayD::from_shape_fn(IxDyn(&dims), |idx| {
                let v = intensity[&idx.slice()[..last]];
                if idx[last] == 1 {
                    v
                } else {
                    1.0 - v
                }
            }))
        }

        fn train_on_batch(
            &mut self,
            _images: ArrayViewD<'_, f32>,
            _labels: ArrayViewD<'_, f32>,
        ) -> Result<f32, ContractError> {
            Ok(0.5)
        }

        fn test_on_batch(
            &mut self,
            _images: ArrayViewD<'_, f32>,
            _labels: ArrayViewD<'_, f32>,
        ) -> Result<f32, ContractError> {
            Ok(0.25)
        }

        fn file_extensions(&self) -> (&'static str, &'static str) {
            ("json", "bin")
        }

        fn save(&self, _paths: &ModelPaths) -> Result<(), ContractError> {
            Ok(())
        }

        fn load(&mut self, _paths: &ModelPaths) -> Result<(), ContractError> {
            Ok(())
        }

        fn weights(&self) -> Vec<f32> {
            Vec::new()
        }

        fn set_weights(&mut self, _weights: &[f32]) -> Result<(), ContractError> {
            Ok(())
        }
    }

    /// Records hook transitions
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl PipelineHook for Recorder {
        fn on_train_begin(&mut self) {
            self.0.lock().unwrap().push("train_begin".into());
        }

        fn on_epoch_begin(&mut self, epoch: usize) {
            self.0.lock().unwrap().push(format!("epoch_begin {epoch}"));
        }

        fn on_epoch_end(&mut self, record: &EpochRecord) {
            self.0.lock().unwrap().push(format!("epoch_end {}", record.epoch));
        }

        fn on_train_end(&mut self, history: &History) {
            self.0
                .lock()
                .unwrap()
                .push(format!("train_end {}", history.epochs.len()));
        }

        fn on_sample_begin(&mut self, sample_id: &SampleId) {
            self.0.lock().unwrap().push(format!("begin {sample_id}"));
        }

        fn on_sample_end(&mut self, sample_id: &SampleId) {
            self.0.lock().unwrap().push(format!("end {sample_id}"));
        }
    }

    /// Counts prepared batch files left in a directory at every epoch end
    struct BatchFileCounter {
        dir: std::path::PathBuf,
        prefix: String,
        counts: Arc<Mutex<Vec<usize>>>,
    }

    impl PipelineHook for BatchFileCounter {
        fn on_epoch_end(&mut self, _record: &EpochRecord) {
            let left = std::fs::read_dir(&self.dir)
                .map(|entries| {
                    entries
                        .filter_map(Result::ok)
                        .filter(|e| {
                            ingestion::is_batch_file(&self.prefix, &e.file_name().to_string_lossy())
                        })
                        .count()
                })
                .unwrap_or(0);
            self.counts.lock().unwrap().push(left);
        }
    }

    /// Yields one patch per sample without recording its shape
    struct ShapelessStream;

    impl BatchStream for ShapelessStream {
        fn stream(&self, samples: &[SampleId], _mode: StreamMode) -> Result<BatchIter, ContractError> {
            let batches: Vec<_> = samples
                .iter()
                .map(|id| {
                    Ok(Batch {
                        sample_id: id.clone(),
                        images: ArrayD::zeros(IxDyn(&[1, 40, 40, 1])),
                        labels: None,
                    })
                })
                .collect();
            Ok(Box::new(batches.into_iter()))
        }
    }

    struct FailingSink;

    impl PredictionSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        async fn write(&mut self, _id: &SampleId, _volume: &LabelVolume) -> Result<(), ContractError> {
            Err(ContractError::sink_write("failing", "disk full"))
        }

        async fn flush(&mut self) -> Result<(), ContractError> {
            Ok(())
        }

        async fn close(&mut self) -> Result<(), ContractError> {
            Ok(())
        }
    }

    fn blueprint(mode: &str) -> PipelineBlueprint {
        let mut bp: PipelineBlueprint = serde_json::from_value(serde_json::json!({
            "data": { "three_dim": false, "classes": 2 },
            "analysis": { "mode": mode, "patch_shape": [40, 40], "batch_size": 5 },
            "training": { "epochs": 2, "metrics": [], "seed": 7 }
        }))
        .unwrap();
        bp.analysis.overlap = Overlap::Voxels(vec![10, 10]);
        bp
    }

    /// Bright lower half; labels match the intensities
    fn sample(id: &str) -> Sample {
        let image = ArrayD::from_shape_fn(IxDyn(&[100, 100, 1]), |idx| {
            if idx[0] >= 50 {
                0.8
            } else {
                0.2
            }
        });
        Sample {
            id: id.into(),
            image,
            segmentation: Some(ArrayD::from_shape_fn(IxDyn(&[100, 100]), |idx| {
                u16::from(idx[0] >= 50)
            })),
        }
    }

    fn expected_mask() -> LabelVolume {
        ArrayD::from_shape_fn(IxDyn(&[100, 100]), |idx| u16::from(idx[0] >= 50))
    }

    fn pipeline<M: SegmentationModel>(
        bp: &PipelineBlueprint,
        samples: &[Sample],
        model: M,
    ) -> Pipeline<M, Preprocessor> {
        let mut source = InMemorySource::new();
        for s in samples {
            source.insert(s.clone());
        }
        let cache = Arc::new(ShapeCache::new());
        let stream = Preprocessor::new(Arc::new(source), Arc::clone(&cache), bp).unwrap();
        Pipeline::new(model, stream, cache, bp).unwrap()
    }

    fn ids(names: &[&str]) -> Vec<SampleId> {
        names.iter().map(|&n| SampleId::from(n)).collect()
    }

    #[tokio::test]
    async fn predict_patchwise_restores_the_mask() {
        for policy in [OverlapPolicy::LastWriteWins, OverlapPolicy::Average] {
            let mut bp = blueprint("patchwise_grid");
            bp.analysis.overlap_policy = policy;
            let mut pipeline = pipeline(&bp, &[sample("a"), sample("b")], ThresholdModel::default());

            let report = pipeline.predict_direct(&ids(&["a", "b"])).await;
            let predictions = report.into_result().unwrap();

            assert_eq!(predictions.len(), 2);
            assert_eq!(predictions[0].0, "a");
            for (_, labels) in &predictions {
                assert_eq!(labels, &expected_mask(), "policy {policy:?}");
            }
            assert!(pipeline.shape_cache().is_empty());

            let summary = pipeline.run_summary();
            assert_eq!(summary.samples_succeeded, 2);
            assert_eq!(summary.patches_per_sample.mean, 16.0);
        }
    }

    #[tokio::test]
    async fn full_volume_prediction_drops_the_batch_axis() {
        let bp = blueprint("full_volume");
        let mut pipeline = pipeline(&bp, &[sample("a")], ThresholdModel::default());
        assert!(pipeline.geometry().is_none());

        let predictions = pipeline.predict_direct(&ids(&["a"])).await.into_result().unwrap();
        assert_eq!(predictions[0].1, expected_mask());
    }

    #[tokio::test]
    async fn failed_sample_leaves_others_emitted() {
        let bp = blueprint("patchwise_grid");
        let mut pipeline = pipeline(&bp, &[sample("a"), sample("b")], ThresholdModel::default());

        let report = pipeline.predict_direct(&ids(&["a", "ghost", "b"])).await;

        assert_eq!(report.emitted, ids(&["a", "b"]));
        assert_eq!(report.predictions.len(), 2);
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(
            &report.failures[0],
            PipelineError::Sample { sample_id, stage: SampleStage::Fetching, .. } if sample_id == "ghost"
        ));
        assert!(report.into_result().is_err());
    }

    #[tokio::test]
    async fn missing_shape_fails_at_reassemble() {
        let bp = blueprint("patchwise_grid");
        let mut pipeline = Pipeline::new(
            ThresholdModel::default(),
            ShapelessStream,
            Arc::new(ShapeCache::new()),
            &bp,
        )
        .unwrap();

        let report = pipeline.predict_direct(&ids(&["a"])).await;
        assert!(matches!(
            report.into_result(),
            Err(PipelineError::Sample {
                stage: SampleStage::Reassemble,
                source: ContractError::MissingShape { .. },
                ..
            })
        ));
    }

    #[tokio::test]
    async fn model_failure_cleans_up_and_allows_retry() {
        let dir = tempdir().unwrap();
        let mut bp = blueprint("patchwise_grid");
        bp.cache.prepare_batches = true;
        bp.cache.temp_dir = dir.path().to_path_buf();
        let model = ThresholdModel {
            fail_on_call: Some(1),
            ..Default::default()
        };
        let mut pipeline = pipeline(&bp, &[sample("a")], model);

        let report = pipeline.predict_direct(&ids(&["a"])).await;
        assert!(matches!(
            &report.failures[0],
            PipelineError::Sample { stage: SampleStage::Infer, .. }
        ));
        assert!(pipeline.shape_cache().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        // no stale shape record is left behind
        let report = pipeline.predict_direct(&ids(&["a"])).await;
        assert!(report.is_success());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn hooks_see_sample_transitions_in_order() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let bp = blueprint("patchwise_grid");
        let mut pipeline = pipeline(&bp, &[sample("a")], ThresholdModel::default())
            .with_hook(Recorder(Arc::clone(&events)));

        pipeline.predict_direct(&ids(&["a", "ghost"])).await;
        assert_eq!(*events.lock().unwrap(), vec!["begin a", "end a", "begin ghost"]);
    }

    #[tokio::test]
    async fn sink_errors_fail_the_emit_stage() {
        let bp = blueprint("patchwise_grid");
        let mut pipeline = pipeline(&bp, &[sample("a")], ThresholdModel::default());

        let report = pipeline.predict_to_sink(&ids(&["a"]), &mut FailingSink).await;
        assert!(matches!(
            &report.failures[0],
            PipelineError::Sample { stage: SampleStage::Emit, .. }
        ));
        assert!(report.emitted.is_empty());

        let mut sink = LogSink::new("log");
        let report = pipeline.predict_to_sink(&ids(&["a"]), &mut sink).await;
        assert!(report.is_success());
        assert!(report.predictions.is_empty());
        assert_eq!(sink.written(), 1);
    }

    #[tokio::test]
    async fn post_processors_run_after_argmax() {
        let mut bp = blueprint("patchwise_grid");
        bp.postprocess = vec![PostProcessConfig::LabelRemap {
            mapping: vec![[0, 1], [1, 0]],
        }];
        let mut pipeline = pipeline(&bp, &[sample("a")], ThresholdModel::default());

        let predictions = pipeline.predict_direct(&ids(&["a"])).await.into_result().unwrap();
        let inverted = expected_mask().mapv(|l| 1 - l);
        assert_eq!(predictions[0].1, inverted);
    }

    #[tokio::test]
    async fn train_runs_every_epoch() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut bp = blueprint("patchwise_crop");
        bp.training.epochs = 3;
        bp.training.metrics = vec!["categorical_accuracy".into()];
        let model = CentroidModel::new(2, 1, 0.5).unwrap();
        let mut pipeline = pipeline(&bp, &[sample("a"), sample("b")], model)
            .with_hook(Recorder(Arc::clone(&events)));

        let history = pipeline.train(&ids(&["a", "b"])).await.unwrap();

        assert_eq!(history.epochs.len(), 3);
        assert!(history.losses().iter().all(|l| l.is_finite()));
        assert!(history.epochs[2].metrics.contains_key("categorical_accuracy"));
        assert!(history.epochs[2].val_loss.is_none());

        let events = events.lock().unwrap();
        assert_eq!(events.first().map(String::as_str), Some("train_begin"));
        assert_eq!(events.last().map(String::as_str), Some("train_end 3"));
        assert_eq!(events.iter().filter(|e| e.starts_with("epoch_end")).count(), 3);
    }

    #[tokio::test]
    async fn evaluate_fills_validation_fields() {
        let mut bp = blueprint("patchwise_grid");
        bp.training.metrics = vec!["dice_soft".into()];
        let mut pipeline = pipeline(&bp, &[sample("a"), sample("b")], ThresholdModel::default());

        let history = pipeline.evaluate(&ids(&["a"]), &ids(&["b"])).await.unwrap();
        let last = history.last().unwrap();
        assert_eq!(last.loss, 0.5);
        assert_eq!(last.val_loss, Some(0.25));
        assert!(last.val_metrics.contains_key("dice_soft"));
    }

    #[tokio::test]
    async fn prepared_batches_do_not_pile_up_across_epochs() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"keep").unwrap();
        let mut bp = blueprint("patchwise_grid");
        bp.training.epochs = 4;
        bp.cache.prepare_batches = true;
        bp.cache.temp_dir = dir.path().to_path_buf();

        let counts = Arc::new(Mutex::new(Vec::new()));
        let counter = BatchFileCounter {
            dir: dir.path().to_path_buf(),
            prefix: bp.cache.batch_prefix.clone(),
            counts: Arc::clone(&counts),
        };
        let mut pipeline = pipeline(&bp, &[sample("a"), sample("b")], ThresholdModel::default())
            .with_hook(counter);

        let history = pipeline.evaluate(&ids(&["a"]), &ids(&["b"])).await.unwrap();
        assert_eq!(history.epochs.len(), 4);
        assert_eq!(*counts.lock().unwrap(), vec![0, 0, 0, 0]);
        assert!(dir.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn stage_failure_still_cleans_up() {
        let dir = tempdir().unwrap();
        let mut bp = blueprint("patchwise_grid");
        bp.cache.prepare_batches = true;
        bp.cache.temp_dir = dir.path().to_path_buf();
        let mut unlabeled = sample("unlabeled");
        unlabeled.segmentation = None;
        let mut pipeline = pipeline(&bp, &[sample("a"), unlabeled], ThresholdModel::default());

        let err = pipeline.train(&ids(&["a", "unlabeled"])).await.unwrap_err();
        assert!(matches!(err, PipelineError::Stage { mode: PipelineMode::Train, .. }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn invalid_overlap_is_rejected_at_construction() {
        let mut bp = blueprint("patchwise_grid");
        bp.analysis.overlap = Overlap::Voxels(vec![40, 10]);

        let result = Pipeline::new(
            ThresholdModel::default(),
            ShapelessStream,
            Arc::new(ShapeCache::new()),
            &bp,
        );
        assert!(matches!(
            result,
            Err(PipelineError::Config(ContractError::InvalidOverlap { axis: 0, .. }))
        ));
    }

    #[tokio::test]
    async fn dump_load_and_reset_weights() {
        let dir = tempdir().unwrap();
        let mut bp = blueprint("patchwise_crop");
        bp.training.epochs = 1;
        let model = CentroidModel::new(2, 1, 1.0).unwrap();
        let mut pipeline = pipeline(&bp, &[sample("a")], model);
        let initial = pipeline.model().weights();

        pipeline.train(&ids(&["a"])).await.unwrap();
        let trained = pipeline.model().weights();
        assert_ne!(trained, initial);

        let paths = pipeline.dump(dir.path().join("fold0")).unwrap();
        assert!(paths.descriptor.ends_with("fold0.model.json"));
        assert!(paths.weights.exists());

        pipeline.reset_weights().unwrap();
        assert_eq!(pipeline.model().weights(), initial);

        pipeline.load(dir.path().join("fold0")).unwrap();
        assert_eq!(pipeline.model().weights(), trained);
    }
}

//! # Integration Tests
//!
//! End-to-end tests over an on-disk `.npy` dataset.
//!
//! Covers:
//! - configuration round trips
//! - train, evaluate and predict through the real stream, model and sinks
//! - batch file cleanup and per-sample failure isolation

#[cfg(test)]
mod contract_tests {
    use config_loader::{ConfigFormat, ConfigLoader};

    #[test]
    fn test_contracts_compile() {
        let _ = contracts::ConfigVersion::V1;
    }

    #[test]
    fn test_default_blueprint_round_trips() {
        let bp = ConfigLoader::load_from_str(
            "[data]\nclasses = 2\n\n[analysis]\nmode = \"full_volume\"\n",
            ConfigFormat::Toml,
        )
        .unwrap();
        let toml = ConfigLoader::to_toml(&bp).unwrap();
        let bp2 = ConfigLoader::load_from_str(&toml, ConfigFormat::Toml).unwrap();
        assert_eq!(bp.analysis.mode, bp2.analysis.mode);
        assert_eq!(bp.training.epochs, bp2.training.epochs);
        assert_eq!(bp.cache.batch_prefix, bp2.cache.batch_prefix);
    }
}

#[cfg(test)]
mod e2e_tests {
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;

    use config_loader::{ConfigFormat, ConfigLoader};
    use contracts::{
        ContractError, LabelVolume, PipelineBlueprint, SampleId, SegmentationModel,
    };
    use dispatcher::SinkSet;
    use ingestion::{NpyDirSource, Preprocessor, VolumeSource, IMAGE_FILE, SEGMENTATION_FILE};
    use ndarray::{Array2, ArrayD};
    use ndarray_npy::{read_npy, write_npy};
    use patching::ShapeCache;
    use pipeline::{CentroidModel, Pipeline, PipelineError, SampleStage};
    use tempfile::{tempdir, TempDir};

    const SIDE: usize = 60;

    type SegPipeline = Pipeline<CentroidModel, Preprocessor>;

    /// Upper half dark background, lower half bright foreground
    fn write_dataset(root: &Path, names: &[&str]) {
        for name in names {
            let dir = root.join(name);
            fs::create_dir_all(&dir).unwrap();
            let image = Array2::from_shape_fn((SIDE, SIDE), |(r, _)| {
                if r >= SIDE / 2 { 0.8f32 } else { 0.2 }
            });
            let labels = Array2::from_shape_fn((SIDE, SIDE), |(r, _)| u16::from(r >= SIDE / 2));
            write_npy(dir.join(IMAGE_FILE), &image).unwrap();
            write_npy(dir.join(SEGMENTATION_FILE), &labels).unwrap();
        }
    }

    fn truth() -> LabelVolume {
        Array2::from_shape_fn((SIDE, SIDE), |(r, _)| u16::from(r >= SIDE / 2)).into_dyn()
    }

    struct Workspace {
        dir: TempDir,
    }

    impl Workspace {
        fn new(names: &[&str]) -> Self {
            let dir = tempdir().unwrap();
            write_dataset(&dir.path().join("data"), names);
            Self { dir }
        }

        fn path(&self, name: &str) -> std::path::PathBuf {
            self.dir.path().join(name)
        }

        /// Grid analysis with prepared batch files and a file sink
        fn config(&self, extra: &str) -> String {
            format!(
                r#"
[data]
three_dim = false
channels = 1
classes = 2

[analysis]
mode = "patchwise_grid"
patch_shape = [32, 32]
overlap = {{ voxels = [8, 8] }}
overlap_policy = "average"
batch_size = 4

[training]
epochs = 2
metrics = ["dice_classwise"]
seed = 11

[cache]
prepare_batches = true
temp_dir = '{batches}'
batch_prefix = "e2e"

[[sinks]]
name = "files"
sink_type = "file"
params = {{ base_path = '{out}', format = "npy" }}
{extra}
"#,
                batches = self.path("batches").display(),
                out = self.path("out").display(),
            )
        }

        fn blueprint(&self, extra: &str) -> PipelineBlueprint {
            ConfigLoader::load_from_str(&self.config(extra), ConfigFormat::Toml).unwrap()
        }

        fn pipeline(&self, blueprint: &PipelineBlueprint) -> (SegPipeline, Vec<SampleId>) {
            let source = Arc::new(NpyDirSource::new(
                self.path("data"),
                blueprint.data.spatial_rank(),
            ));
            let ids = source.sample_ids();
            let cache = Arc::new(ShapeCache::new());
            let stream = Preprocessor::new(source, Arc::clone(&cache), blueprint).unwrap();
            let model = CentroidModel::new(2, 1, 0.5).unwrap();
            let pipeline = Pipeline::new(model, stream, cache, blueprint).unwrap();
            (pipeline, ids)
        }

        fn leftover_batch_files(&self) -> usize {
            let Ok(entries) = fs::read_dir(self.path("batches")) else {
                return 0;
            };
            entries
                .filter_map(|e| e.ok())
                .filter(|e| ingestion::is_batch_file("e2e", &e.file_name().to_string_lossy()))
                .count()
        }
    }

    #[tokio::test]
    async fn test_train_then_predict_to_files() {
        let ws = Workspace::new(&["case_a", "case_b", "case_c"]);
        let bp = ws.blueprint("");
        let (mut pipeline, ids) = ws.pipeline(&bp);
        assert_eq!(ids.len(), 3);

        let history = pipeline.train(&ids).await.unwrap();
        assert_eq!(history.epochs.len(), 2);
        let last = history.last().unwrap();
        assert!(last.loss.is_finite());
        assert!(last.metrics["dice_classwise"] > 0.99);
        assert_eq!(ws.leftover_batch_files(), 0);

        let mut sinks = SinkSet::from_configs(&bp.sinks).unwrap();
        let report = pipeline.predict_to_sink(&ids, &mut sinks).await;
        assert!(report.is_success(), "{:?}", report.failures);
        assert_eq!(report.emitted, ids);
        assert_eq!(ws.leftover_batch_files(), 0);
        assert!(pipeline.shape_cache().is_empty());

        for id in &ids {
            let written: ArrayD<u16> = read_npy(ws.path("out").join(format!("{id}.npy"))).unwrap();
            assert_eq!(written, truth(), "prediction for {id}");
        }
        let (_, snapshot) = &sinks.metrics()[0];
        assert_eq!(snapshot.write_count, 3);

        let summary = pipeline.run_summary();
        assert_eq!(summary.samples_succeeded, 3);
        assert_eq!(summary.samples_failed, 0);
    }

    #[tokio::test]
    async fn test_missing_sample_does_not_stop_others() {
        let ws = Workspace::new(&["case_a", "case_b"]);
        let bp = ws.blueprint("");
        let (mut pipeline, mut ids) = ws.pipeline(&bp);
        ids.insert(1, SampleId::from("ghost"));

        let report = pipeline.predict_direct(&ids).await;

        assert_eq!(report.predictions.len(), 2);
        assert_eq!(report.emitted, vec![SampleId::from("case_a"), SampleId::from("case_b")]);
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(
            &report.failures[0],
            PipelineError::Sample { sample_id, stage: SampleStage::Fetching, .. } if sample_id == "ghost"
        ));
        assert!(pipeline.shape_cache().is_empty());
        assert_eq!(ws.leftover_batch_files(), 0);
    }

    #[tokio::test]
    async fn test_evaluate_full_volume_reports_validation() {
        let ws = Workspace::new(&["case_a", "case_b", "case_c"]);
        let mut bp = ws.blueprint("");
        bp.analysis.mode = contracts::AnalysisMode::FullVolume;
        bp.training.metrics = vec!["categorical_accuracy".to_string()];
        ConfigLoader::validate(&bp).unwrap();
        let (mut pipeline, ids) = ws.pipeline(&bp);

        let history = pipeline.evaluate(&ids[..2], &ids[2..]).await.unwrap();

        assert_eq!(history.epochs.len(), 2);
        for record in &history.epochs {
            assert!(record.val_loss.is_some());
            assert!(record.val_metrics["categorical_accuracy"] > 0.99);
        }
        assert_eq!(ws.leftover_batch_files(), 0);
    }

    #[tokio::test]
    async fn test_label_remap_from_config() {
        let ws = Workspace::new(&["case_a"]);
        let bp = ws.blueprint(
            r#"
[[postprocess]]
type = "label_remap"
mapping = [[0, 1], [1, 0]]
"#,
        );
        let (mut pipeline, ids) = ws.pipeline(&bp);

        let predictions = pipeline.predict_direct(&ids).await.into_result().unwrap();

        let inverted = truth().mapv(|v| 1 - v);
        assert_eq!(predictions[0].1, inverted);
    }

    #[tokio::test]
    async fn test_saved_model_restores_in_new_pipeline() {
        let ws = Workspace::new(&["case_a", "case_b"]);
        let bp = ws.blueprint("");
        let (mut trained, ids) = ws.pipeline(&bp);
        trained.train(&ids).await.unwrap();
        trained.dump(ws.path("model")).unwrap();

        let (mut fresh, _) = ws.pipeline(&bp);
        assert_ne!(fresh.model().weights(), trained.model().weights());
        fresh.load(ws.path("model")).unwrap();
        assert_eq!(fresh.model().weights(), trained.model().weights());
    }

    #[test]
    fn test_overlap_as_large_as_window_is_rejected() {
        let ws = Workspace::new(&[]);
        let config = ws.config("").replace("voxels = [8, 8]", "voxels = [32, 8]");
        let err = ConfigLoader::load_from_str(&config, ConfigFormat::Toml).unwrap_err();
        assert!(matches!(err, ContractError::InvalidOverlap { axis: 0, overlap: 32, window: 32 }));
    }
}

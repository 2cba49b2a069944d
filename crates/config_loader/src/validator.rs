//! Configuration validation
//!
//! Rules:
//! - channels > 0, classes >= 2
//! - patch shape rank matches the data rank and every extent is positive
//! - overlap resolves against the patch shape
//! - batch size, batch queue size and epochs are positive
//! - metric ids are known
//! - label remaps stay inside the class range
//! - sink names are non-empty and unique
//! - the batch file prefix is non-empty and names no directory

use std::collections::HashSet;

use contracts::{ContractError, PipelineBlueprint, PostProcessConfig, KNOWN_METRICS};

/// Validate a PipelineBlueprint
///
/// Returns the first error encountered.
pub fn validate(blueprint: &PipelineBlueprint) -> Result<(), ContractError> {
    validate_data(blueprint)?;
    validate_analysis(blueprint)?;
    validate_training(blueprint)?;
    validate_postprocess(blueprint)?;
    validate_sinks(blueprint)?;
    validate_cache(blueprint)?;
    Ok(())
}

fn validate_data(blueprint: &PipelineBlueprint) -> Result<(), ContractError> {
    let data = &blueprint.data;
    if data.channels == 0 {
        return Err(ContractError::config_validation(
            "data.channels",
            "channels must be > 0",
        ));
    }
    if data.classes < 2 {
        return Err(ContractError::config_validation(
            "data.classes",
            format!("classes must be >= 2 (background included), got {}", data.classes),
        ));
    }
    Ok(())
}

fn validate_analysis(blueprint: &PipelineBlueprint) -> Result<(), ContractError> {
    let analysis = &blueprint.analysis;

    if analysis.batch_size == 0 {
        return Err(ContractError::config_validation(
            "analysis.batch_size",
            "batch_size must be > 0",
        ));
    }

    // Full-volume analysis never looks at the window
    if !analysis.mode.is_patchwise() {
        return Ok(());
    }

    let rank = blueprint.data.spatial_rank();
    if analysis.patch_shape.len() != rank {
        return Err(ContractError::config_validation(
            "analysis.patch_shape",
            format!(
                "expected {rank} extents for three_dim = {}, got {}",
                blueprint.data.three_dim,
                analysis.patch_shape.len()
            ),
        ));
    }
    if let Some(axis) = analysis.patch_shape.iter().position(|&e| e == 0) {
        return Err(ContractError::config_validation(
            format!("analysis.patch_shape[{axis}]"),
            "patch extent must be > 0",
        ));
    }

    analysis.overlap.resolve(&analysis.patch_shape)?;
    Ok(())
}

fn validate_training(blueprint: &PipelineBlueprint) -> Result<(), ContractError> {
    let training = &blueprint.training;

    if training.epochs == 0 {
        return Err(ContractError::config_validation(
            "training.epochs",
            "epochs must be > 0",
        ));
    }
    if training.batch_queue_size == 0 {
        return Err(ContractError::config_validation(
            "training.batch_queue_size",
            "batch_queue_size must be > 0",
        ));
    }
    for metric in &training.metrics {
        if !KNOWN_METRICS.contains(&metric.as_str()) {
            return Err(ContractError::config_validation(
                "training.metrics",
                format!(
                    "unknown metric '{metric}', expected one of: {}",
                    KNOWN_METRICS.join(", ")
                ),
            ));
        }
    }
    Ok(())
}

fn validate_postprocess(blueprint: &PipelineBlueprint) -> Result<(), ContractError> {
    let classes = blueprint.data.classes;
    for (idx, step) in blueprint.postprocess.iter().enumerate() {
        match step {
            PostProcessConfig::LabelRemap { mapping } => {
                if let Some([from, to]) = mapping
                    .iter()
                    .find(|[from, to]| usize::from(*from) >= classes || usize::from(*to) >= classes)
                {
                    return Err(ContractError::config_validation(
                        format!("postprocess[{idx}].mapping"),
                        format!("remap {from} -> {to} leaves the class range 0..{classes}"),
                    ));
                }
            }
        }
    }
    Ok(())
}

fn validate_sinks(blueprint: &PipelineBlueprint) -> Result<(), ContractError> {
    let mut seen = HashSet::new();
    for (idx, sink) in blueprint.sinks.iter().enumerate() {
        if sink.name.is_empty() {
            return Err(ContractError::config_validation(
                format!("sinks[{idx}].name"),
                "sink name cannot be empty",
            ));
        }
        if !seen.insert(sink.name.as_str()) {
            return Err(ContractError::config_validation(
                format!("sinks[name={}]", sink.name),
                "duplicate sink name",
            ));
        }
    }
    Ok(())
}

fn validate_cache(blueprint: &PipelineBlueprint) -> Result<(), ContractError> {
    let prefix = &blueprint.cache.batch_prefix;
    if prefix.trim().is_empty() {
        return Err(ContractError::config_validation(
            "cache.batch_prefix",
            "batch_prefix cannot be empty",
        ));
    }
    let separator = prefix.contains(['/', '\\', std::path::MAIN_SEPARATOR]);
    if separator || prefix == "." || prefix == ".." {
        return Err(ContractError::config_validation(
            "cache.batch_prefix",
            format!("batch_prefix '{prefix}' must be a plain file name prefix"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_toml;

    fn blueprint(extra: &str) -> PipelineBlueprint {
        let base = r#"
[data]
three_dim = false
classes = 3

[analysis]
patch_shape = [40, 40]
overlap = { voxels = [10, 10] }
"#;
        parse_toml(&format!("{base}\n{extra}")).unwrap()
    }

    fn field_of(err: ContractError) -> String {
        match err {
            ContractError::ConfigValidation { field, .. } => field,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(validate(&blueprint("")).is_ok());
    }

    #[test]
    fn test_zero_channels() {
        let mut bp = blueprint("");
        bp.data.channels = 0;
        assert_eq!(field_of(validate(&bp).unwrap_err()), "data.channels");
    }

    #[test]
    fn test_single_class() {
        let mut bp = blueprint("");
        bp.data.classes = 1;
        assert_eq!(field_of(validate(&bp).unwrap_err()), "data.classes");
    }

    #[test]
    fn test_patch_rank_follows_three_dim() {
        let mut bp = blueprint("");
        bp.data.three_dim = true;
        assert_eq!(field_of(validate(&bp).unwrap_err()), "analysis.patch_shape");
    }

    #[test]
    fn test_full_volume_ignores_patch_shape() {
        let mut bp = blueprint("");
        bp.analysis.mode = contracts::AnalysisMode::FullVolume;
        bp.analysis.patch_shape.clear();
        assert!(validate(&bp).is_ok());
    }

    #[test]
    fn test_zero_extent() {
        let mut bp = blueprint("");
        bp.analysis.patch_shape = vec![40, 0];
        assert_eq!(field_of(validate(&bp).unwrap_err()), "analysis.patch_shape[1]");
    }

    #[test]
    fn test_overlap_not_smaller_than_window() {
        let mut bp = blueprint("");
        bp.analysis.overlap = contracts::Overlap::Voxels(vec![10, 40]);
        assert!(matches!(
            validate(&bp),
            Err(ContractError::InvalidOverlap { axis: 1, .. })
        ));
    }

    #[test]
    fn test_zero_queue_and_epochs() {
        let mut bp = blueprint("");
        bp.training.batch_queue_size = 0;
        assert_eq!(field_of(validate(&bp).unwrap_err()), "training.batch_queue_size");

        let mut bp = blueprint("");
        bp.training.epochs = 0;
        assert_eq!(field_of(validate(&bp).unwrap_err()), "training.epochs");

        let mut bp = blueprint("");
        bp.analysis.batch_size = 0;
        assert_eq!(field_of(validate(&bp).unwrap_err()), "analysis.batch_size");
    }

    #[test]
    fn test_unknown_metric() {
        let bp = blueprint(
            r#"
[training]
metrics = ["dice_soft", "hausdorff"]
"#,
        );
        let err = validate(&bp).unwrap_err();
        assert!(err.to_string().contains("hausdorff"));
    }

    #[test]
    fn test_remap_out_of_range() {
        let bp = blueprint(
            r#"
[[postprocess]]
type = "label_remap"
mapping = [[1, 5]]
"#,
        );
        assert_eq!(field_of(validate(&bp).unwrap_err()), "postprocess[0].mapping");
    }

    #[test]
    fn test_duplicate_sink_names() {
        let bp = blueprint(
            r#"
[[sinks]]
name = "out"
sink_type = "log"

[[sinks]]
name = "out"
sink_type = "file"
"#,
        );
        let err = validate(&bp).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_empty_sink_name() {
        let bp = blueprint(
            r#"
[[sinks]]
name = ""
sink_type = "log"
"#,
        );
        assert_eq!(field_of(validate(&bp).unwrap_err()), "sinks[0].name");
    }

    #[test]
    fn test_batch_prefix_must_be_a_plain_name() {
        let bp = blueprint(
            r#"
[cache]
prepare_batches = true
batch_prefix = ""
"#,
        );
        assert_eq!(field_of(validate(&bp).unwrap_err()), "cache.batch_prefix");

        for prefix in ["  ", "../batch", "tmp/batch", "..", r"dir\batch"] {
            let mut bp = blueprint("");
            bp.cache.batch_prefix = prefix.to_string();
            assert_eq!(
                field_of(validate(&bp).unwrap_err()),
                "cache.batch_prefix",
                "prefix {prefix:?}"
            );
        }

        let mut bp = blueprint("");
        bp.cache.batch_prefix = "fold-0_run".to_string();
        assert!(validate(&bp).is_ok());
    }
}

//! Built-in post-processors.

use std::collections::HashMap;

use contracts::{ContractError, LabelVolume, PostProcessConfig, PostProcessor};

/// Build the configured post-processors, keeping their order
pub fn build_post_processors(configs: &[PostProcessConfig]) -> Vec<Box<dyn PostProcessor>> {
    configs
        .iter()
        .map(|config| match config {
            PostProcessConfig::LabelRemap { mapping } => {
                Box::new(LabelRemap::new(mapping.iter().map(|&[from, to]| (from, to))))
                    as Box<dyn PostProcessor>
            }
        })
        .collect()
}

/// Relabels classes through a lookup table.
///
/// All pairs apply simultaneously, so `[[1, 2], [2, 1]]` swaps two classes.
/// Labels without an entry are kept.
#[derive(Debug, Clone, Default)]
pub struct LabelRemap {
    mapping: HashMap<u16, u16>,
}

impl LabelRemap {
    pub fn new(pairs: impl IntoIterator<Item = (u16, u16)>) -> Self {
        Self {
            mapping: pairs.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }
}

impl PostProcessor for LabelRemap {
    fn name(&self) -> &str {
        "label_remap"
    }

    fn apply(&self, volume: &mut LabelVolume) -> Result<(), ContractError> {
        if self.mapping.is_empty() {
            return Ok(());
        }
        volume.mapv_inplace(|label| self.mapping.get(&label).copied().unwrap_or(label));
        Ok(())
    }
}

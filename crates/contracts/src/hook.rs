//! Training history and pipeline hooks

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::SampleId;

/// Aggregated results of one epoch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// Zero-based epoch index
    pub epoch: usize,

    /// Mean training loss over the epoch's batches
    pub loss: f32,

    /// Mean training metric values
    pub metrics: BTreeMap<String, f32>,

    /// Mean validation loss (evaluate only)
    pub val_loss: Option<f32>,

    /// Mean validation metric values (evaluate only)
    pub val_metrics: BTreeMap<String, f32>,
}

/// Per-epoch records of a train or evaluate stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub epochs: Vec<EpochRecord>,
}

impl History {
    pub fn last(&self) -> Option<&EpochRecord> {
        self.epochs.last()
    }

    /// Training loss per epoch
    pub fn losses(&self) -> Vec<f32> {
        self.epochs.iter().map(|e| e.loss).collect()
    }
}

/// Handler invoked at pipeline state transitions.
///
/// Hooks are called in registration order. Every method has an empty default
/// so a hook only implements the transitions it cares about.
pub trait PipelineHook: Send {
    fn on_train_begin(&mut self) {}

    fn on_epoch_begin(&mut self, _epoch: usize) {}

    fn on_epoch_end(&mut self, _record: &EpochRecord) {}

    fn on_train_end(&mut self, _history: &History) {}

    fn on_sample_begin(&mut self, _sample_id: &SampleId) {}

    fn on_sample_end(&mut self, _sample_id: &SampleId) {}
}

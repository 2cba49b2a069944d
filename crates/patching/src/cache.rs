//! Per-sample store of original volume shapes.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use contracts::{ContractError, SampleId, VolumeShape};
use parking_lot::Mutex;
use tracing::trace;

/// Keyed store correlating a sample with its pre-decomposition shape.
///
/// A record is written once when the sample is cut into patches and removed
/// once when its patches are reassembled. `pop` is the only way to read a
/// record. Mutations happen under a lock so the producer side (possibly a
/// prefetch worker) and the orchestrator can share one cache via `Arc`.
#[derive(Debug, Default)]
pub struct ShapeCache {
    records: Mutex<HashMap<SampleId, VolumeShape>>,
}

impl ShapeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the shape of a freshly decomposed sample.
    ///
    /// # Errors
    /// `DuplicateShape` if an unconsumed record already exists for the id.
    pub fn put(&self, sample_id: SampleId, shape: VolumeShape) -> Result<(), ContractError> {
        let mut records = self.records.lock();
        match records.entry(sample_id) {
            Entry::Occupied(entry) => Err(ContractError::DuplicateShape {
                sample_id: entry.key().clone(),
            }),
            Entry::Vacant(entry) => {
                trace!(sample_id = %entry.key(), shape = %shape, "shape recorded");
                entry.insert(shape);
                Ok(())
            }
        }
    }

    /// Remove and return the shape recorded for a sample.
    ///
    /// # Errors
    /// `MissingShape` if the sample was never decomposed or was already
    /// reconstructed.
    pub fn pop(&self, sample_id: &SampleId) -> Result<VolumeShape, ContractError> {
        let shape = self.records.lock().remove(sample_id);
        shape.ok_or_else(|| ContractError::MissingShape {
            sample_id: sample_id.clone(),
        })
    }

    pub fn contains(&self, sample_id: &SampleId) -> bool {
        self.records.lock().contains_key(sample_id)
    }

    /// Number of unconsumed records
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

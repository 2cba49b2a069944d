//! Bounded prefetch queue between batch production and the orchestrator.
//!
//! The batch iterator runs on a blocking worker and pushes into an
//! `async_channel::bounded` queue; the producer blocks while the queue is
//! full. Dropping the prefetcher closes the queue and the worker stops at its
//! next send.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_channel::{bounded, Receiver};
use contracts::{Batch, BatchIter, ContractError};
use metrics::gauge;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::IngestionError;

/// Queue depth gauge name
pub const BATCH_QUEUE_DEPTH: &str = "segpipe_batch_queue_depth";

/// Prefetch counters
#[derive(Debug, Default)]
pub struct PrefetchMetrics {
    /// Batches placed in the queue
    pub batches_queued: AtomicU64,

    /// Batches handed to the consumer
    pub batches_consumed: AtomicU64,

    /// Errors forwarded from the batch iterator
    pub errors: AtomicU64,

    /// Largest queue length seen right after a send; never above capacity
    pub max_depth: AtomicUsize,
}

impl PrefetchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> PrefetchSnapshot {
        PrefetchSnapshot {
            batches_queued: self.batches_queued.load(Ordering::Relaxed),
            batches_consumed: self.batches_consumed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            max_depth: self.max_depth.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PrefetchMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefetchSnapshot {
    pub batches_queued: u64,
    pub batches_consumed: u64,
    pub errors: u64,
    pub max_depth: usize,
}

/// Consumer side of a running prefetch worker.
pub struct BatchPrefetcher {
    rx: Receiver<Result<Batch, ContractError>>,
    worker: JoinHandle<()>,
    metrics: Arc<PrefetchMetrics>,
    capacity: usize,
}

impl BatchPrefetcher {
    /// Start pulling `batches` on a blocking worker.
    ///
    /// Must be called from within a tokio runtime. The first error yielded by
    /// the iterator is forwarded and ends production.
    pub fn spawn(batches: BatchIter, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        let metrics = Arc::new(PrefetchMetrics::new());

        let worker_metrics = Arc::clone(&metrics);
        let worker = tokio::task::spawn_blocking(move || {
            for item in batches {
                let failed = item.is_err();
                if tx.send_blocking(item).is_err() {
                    debug!("prefetch consumer gone, stopping producer");
                    return;
                }
                worker_metrics
                    .max_depth
                    .fetch_max(tx.len(), Ordering::Relaxed);
                if failed {
                    worker_metrics.errors.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                worker_metrics.batches_queued.fetch_add(1, Ordering::Relaxed);
            }
            trace!("batch iterator exhausted");
        });

        Self {
            rx,
            worker,
            metrics,
            capacity,
        }
    }

    /// Next batch, or `None` once the producer is done
    pub async fn next(&mut self) -> Option<Result<Batch, ContractError>> {
        let item = self.rx.recv().await.ok()?;

        self.metrics.batches_consumed.fetch_add(1, Ordering::Relaxed);
        gauge!(BATCH_QUEUE_DEPTH).set(self.rx.len() as f64);
        Some(item)
    }

    /// Wait for the worker to exit.
    ///
    /// Closes the queue first, so a producer blocked on a full queue stops.
    ///
    /// # Errors
    /// `Worker` if the producer panicked.
    pub async fn finish(self) -> Result<PrefetchSnapshot, IngestionError> {
        self.rx.close();
        self.worker.await.map_err(|e| IngestionError::Worker {
            message: e.to_string(),
        })?;
        Ok(self.metrics.snapshot())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Batches currently waiting in the queue
    pub fn queued(&self) -> usize {
        self.rx.len()
    }

    pub fn metrics(&self) -> Arc<PrefetchMetrics> {
        Arc::clone(&self.metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::SampleId;
    use ndarray::{ArrayD, IxDyn};
    use std::time::Duration;

    fn batch(i: usize) -> Batch {
        Batch {
            sample_id: SampleId::from(format!("s{i}")),
            images: ArrayD::zeros(IxDyn(&[1, 2, 1])),
            labels: None,
        }
    }

    fn counting(n: usize) -> BatchIter {
        Box::new((0..n).map(|i| Ok(batch(i))))
    }

    #[tokio::test]
    async fn delivers_in_order() {
        let mut prefetch = BatchPrefetcher::spawn(counting(5), 2);
        let mut seen = Vec::new();
        while let Some(item) = prefetch.next().await {
            seen.push(item.unwrap().sample_id.to_string());
        }
        assert_eq!(seen, vec!["s0", "s1", "s2", "s3", "s4"]);

        let snapshot = prefetch.finish().await.unwrap();
        assert_eq!(snapshot.batches_consumed, 5);
        assert_eq!(snapshot.batches_queued, 5);
        assert!(snapshot.max_depth <= 2);
    }

    #[tokio::test]
    async fn depth_reaches_capacity_but_never_more() {
        let mut prefetch = BatchPrefetcher::spawn(counting(20), 3);
        let metrics = prefetch.metrics();

        // nothing is consumed yet, so the producer fills the queue and blocks
        tokio::time::timeout(Duration::from_secs(5), async {
            while metrics.snapshot().max_depth < 3 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(prefetch.queued(), 3);

        let mut consumed = 0;
        while let Some(item) = prefetch.next().await {
            item.unwrap();
            consumed += 1;
        }
        assert_eq!(consumed, 20);
        assert_eq!(prefetch.finish().await.unwrap().max_depth, 3);
    }

    #[tokio::test]
    async fn queue_never_exceeds_capacity() {
        let prefetch = BatchPrefetcher::spawn(counting(100), 3);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(prefetch.queued() <= 3);
        assert!(prefetch.metrics().snapshot().batches_queued <= 3);

        // the blocked producer stops once the queue closes
        prefetch.finish().await.unwrap();
    }

    #[tokio::test]
    async fn error_ends_production() {
        let items: BatchIter = Box::new(
            vec![
                Ok(batch(0)),
                Err(ContractError::batch_stream(&"s1".into(), "broken")),
                Ok(batch(2)),
            ]
            .into_iter(),
        );
        let mut prefetch = BatchPrefetcher::spawn(items, 4);

        assert!(prefetch.next().await.unwrap().is_ok());
        assert!(prefetch.next().await.unwrap().is_err());
        assert!(prefetch.next().await.is_none());
        assert_eq!(prefetch.finish().await.unwrap().errors, 1);
    }

    #[tokio::test]
    async fn panicking_producer_is_reported() {
        let items: BatchIter = Box::new((0..3).map(|i| {
            if i == 1 {
                panic!("decoder exploded");
            }
            Ok(batch(i))
        }));
        let mut prefetch = BatchPrefetcher::spawn(items, 1);

        assert!(prefetch.next().await.unwrap().is_ok());
        assert!(prefetch.next().await.is_none());
        assert!(matches!(
            prefetch.finish().await,
            Err(IngestionError::Worker { .. })
        ));
    }
}

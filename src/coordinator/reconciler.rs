use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};

use crate::backend::Backend;
use crate::errors::LedgerError;
use crate::event_sourcing::projection::ReadModelProjector;
use crate::metrics::Metrics;

// ============================================================================
// Reconciler - Re-drives Projection for Lagging Streams
// ============================================================================
//
// A record that ends in ProjectionFailed leaves the read model behind the
// log. The reconciler finds such streams two ways:
//
// 1. Partial writes reported by the coordinator through the RepairQueue
// 2. A backend scan for rows whose last_applied_sequence < stream head
//    (covers partial writes from other processes and from before a restart)
//
// Each lagging stream is rebuilt from the log and persisted.
//
// ============================================================================

/// A stream known to be behind, with the sequence that failed to project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRepair {
    pub stream_id: String,
    pub sequence: i64,
}

/// Sending side handed to the coordinator.
///
/// Bounded; a repair that does not fit is dropped, and the backend scan
/// still finds the lagging stream.
#[derive(Clone)]
pub struct RepairQueue {
    sender: mpsc::Sender<PendingRepair>,
}

impl RepairQueue {
    pub fn enqueue(&self, repair: PendingRepair) {
        match self.sender.try_send(repair) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(repair)) => {
                tracing::debug!(
                    stream_id = %repair.stream_id,
                    sequence = repair.sequence,
                    "Repair queue full, leaving stream to the backend scan"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!("Reconciler stopped, repair left to the next backend scan");
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub interval: Duration,
    /// Max streams taken from one backend scan
    pub scan_limit: usize,
    /// Pending repairs held between passes
    pub queue_capacity: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            scan_limit: 100,
            queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileStats {
    pub lagging: usize,
    pub repaired: usize,
    pub failed: usize,
    pub duration: Duration,
}

pub struct Reconciler {
    projector: Arc<ReadModelProjector>,
    backend: Arc<dyn Backend>,
    queue: Mutex<mpsc::Receiver<PendingRepair>>,
    config: ReconcilerConfig,
    metrics: Arc<Metrics>,
}

impl Reconciler {
    pub fn new(
        projector: Arc<ReadModelProjector>,
        backend: Arc<dyn Backend>,
        config: ReconcilerConfig,
        metrics: Arc<Metrics>,
    ) -> (Self, RepairQueue) {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));

        let reconciler = Self {
            projector,
            backend,
            queue: Mutex::new(receiver),
            config,
            metrics,
        };

        (reconciler, RepairQueue { sender })
    }

    /// One pass: drain the queue, scan the backend, repair what is behind.
    pub async fn run_once(&self) -> Result<ReconcileStats, LedgerError> {
        let started = Instant::now();

        // stream id -> sequence the read model must reach (0 = unknown, always repair)
        let mut targets: BTreeMap<String, i64> = BTreeMap::new();
        {
            let mut queue = self.queue.lock().await;
            while let Ok(repair) = queue.try_recv() {
                let target = targets.entry(repair.stream_id).or_insert(0);
                *target = (*target).max(repair.sequence);
            }
        }

        match self.backend.lagging_streams(self.config.scan_limit).await {
            Ok(streams) => {
                for stream_id in streams {
                    targets.insert(stream_id, 0);
                }
            }
            Err(error) if targets.is_empty() => return Err(LedgerError::from_backend(error)),
            Err(error) => {
                tracing::warn!(error = %error, "Lagging stream scan failed, repairing queued streams only");
            }
        }

        let mut stats = ReconcileStats { lagging: targets.len(), ..Default::default() };

        for (stream_id, target) in targets {
            if target > 0 {
                match self.projector.current(&stream_id).await {
                    Ok(row) if row.last_applied_sequence >= target => {
                        tracing::debug!(stream_id = %stream_id, "Queued stream already caught up");
                        continue;
                    }
                    _ => {}
                }
            }

            match self.projector.repair(&stream_id).await {
                Ok(_) => stats.repaired += 1,
                Err(error) => {
                    stats.failed += 1;
                    tracing::error!(
                        stream_id = %stream_id,
                        error = %error,
                        "Failed to repair read model, will retry next pass"
                    );
                }
            }
        }

        stats.duration = started.elapsed();
        self.metrics.record_reconcile_pass(stats.lagging, stats.repaired, stats.failed);

        if stats.lagging > 0 {
            tracing::info!(
                lagging = stats.lagging,
                repaired = stats.repaired,
                failed = stats.failed,
                duration_ms = stats.duration.as_millis() as u64,
                "Reconciliation pass complete"
            );
        }

        Ok(stats)
    }

    /// Run passes on the configured interval until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(interval_secs = self.config.interval.as_secs(), "Reconciler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(error) = self.run_once().await {
                        tracing::error!(error = %error, "Reconciliation pass failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::FlakyBackend;
    use crate::backend::BackendError;
    use crate::event_sourcing::core::NewEvent;
    use crate::event_sourcing::store::EventStore;
    use crate::utils::RetryConfig;
    use serde_json::json;

    struct Fixture {
        backend: Arc<FlakyBackend>,
        store: Arc<EventStore>,
        projector: Arc<ReadModelProjector>,
        reconciler: Arc<Reconciler>,
        queue: RepairQueue,
    }

    fn fixture() -> Fixture {
        let backend = FlakyBackend::new();
        let metrics = Arc::new(Metrics::new().unwrap());
        let store = Arc::new(EventStore::new(backend.clone(), metrics.clone()));
        let projector = Arc::new(ReadModelProjector::new(
            store.clone(),
            backend.clone(),
            RetryConfig::none(),
            metrics.clone(),
        ));
        let config = ReconcilerConfig {
            interval: Duration::from_millis(10),
            scan_limit: 10,
            queue_capacity: 1,
        };
        let (reconciler, queue) = Reconciler::new(projector.clone(), backend.clone(), config, metrics);

        Fixture { backend, store, projector, reconciler: Arc::new(reconciler), queue }
    }

    async fn append_top_up(store: &EventStore, stream_id: &str, amount: f64) -> i64 {
        store
            .append(NewEvent::new(stream_id, "top-up", json!({ "amount": amount })))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_scan_repairs_unprojected_streams() {
        let f = fixture();
        append_top_up(&f.store, "A", 5.0).await;
        append_top_up(&f.store, "A", 5.0).await;
        append_top_up(&f.store, "B", 1.0).await;

        let stats = f.reconciler.run_once().await.unwrap();

        assert_eq!(stats.lagging, 2);
        assert_eq!(stats.repaired, 2);
        assert_eq!(f.projector.current("A").await.unwrap().balance, 10.0);
        assert_eq!(f.projector.current("B").await.unwrap().last_applied_sequence, 1);

        let second = f.reconciler.run_once().await.unwrap();
        assert_eq!(second.lagging, 0);
    }

    #[tokio::test]
    async fn test_queued_stream_already_caught_up_is_skipped() {
        let f = fixture();
        let sequence = append_top_up(&f.store, "A", 5.0).await;
        f.projector.repair("A").await.unwrap();
        let upserts_before = f.backend.upserts();

        f.queue.enqueue(PendingRepair { stream_id: "A".into(), sequence });
        let stats = f.reconciler.run_once().await.unwrap();

        assert_eq!(stats.repaired, 0);
        assert_eq!(f.backend.upserts(), upserts_before);
    }

    #[tokio::test]
    async fn test_full_queue_drops_repair_but_scan_finds_stream() {
        let f = fixture();
        let a = append_top_up(&f.store, "A", 1.0).await;
        let b = append_top_up(&f.store, "B", 2.0).await;

        f.queue.enqueue(PendingRepair { stream_id: "A".into(), sequence: a });
        f.queue.enqueue(PendingRepair { stream_id: "B".into(), sequence: b });

        let stats = f.reconciler.run_once().await.unwrap();

        assert_eq!(stats.repaired, 2);
        assert_eq!(f.projector.current("B").await.unwrap().balance, 2.0);
    }

    #[tokio::test]
    async fn test_failed_repair_is_counted_and_retried_next_pass() {
        let f = fixture();
        append_top_up(&f.store, "A", 5.0).await;
        f.backend.fail_next_upserts(1, BackendError::Unavailable("down".into()));

        let first = f.reconciler.run_once().await.unwrap();
        assert_eq!(first.failed, 1);

        let second = f.reconciler.run_once().await.unwrap();
        assert_eq!(second.repaired, 1);
        assert_eq!(f.projector.current("A").await.unwrap().balance, 5.0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let f = fixture();
        append_top_up(&f.store, "A", 7.0).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reconciler = f.reconciler.clone();
        let task = tokio::spawn(async move { reconciler.run(shutdown_rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();

        assert_eq!(f.projector.current("A").await.unwrap().balance, 7.0);
    }
}

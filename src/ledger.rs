use std::sync::Arc;

use crate::backend::Backend;
use crate::config::Config;
use crate::coordinator::{DualWriteCoordinator, Reconciler};
use crate::event_sourcing::{EventStore, ReadModelProjector};
use crate::metrics::Metrics;

/// The write path wired together over one backend.
pub struct Ledger {
    pub store: Arc<EventStore>,
    pub projector: Arc<ReadModelProjector>,
    pub coordinator: Arc<DualWriteCoordinator>,
    pub reconciler: Arc<Reconciler>,
}

impl Ledger {
    pub fn new(backend: Arc<dyn Backend>, config: &Config, metrics: Arc<Metrics>) -> Self {
        let store = Arc::new(
            EventStore::new(backend.clone(), metrics.clone()).with_page_size(config.read_page_size),
        );

        let projector = Arc::new(ReadModelProjector::new(
            store.clone(),
            backend.clone(),
            config.projection_retry(),
            metrics.clone(),
        ));

        let (reconciler, repairs) =
            Reconciler::new(projector.clone(), backend, config.reconciler(), metrics.clone());

        let coordinator = Arc::new(
            DualWriteCoordinator::new(store.clone(), projector.clone(), config.append_retry(), metrics)
                .with_repair_queue(repairs),
        );

        Self {
            store,
            projector,
            coordinator,
            reconciler: Arc::new(reconciler),
        }
    }
}

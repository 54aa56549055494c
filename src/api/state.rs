use std::sync::Arc;

use crate::admission::AdmissionController;
use crate::catalog::ManifestResolver;
use crate::config::Config;
use crate::observability::Metrics;
use crate::store::Store;
use crate::worker::WorkerContext;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    pub resolver: ManifestResolver,
    pub admission: Arc<AdmissionController>,
    pub worker_ctx: Arc<WorkerContext>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        store: Store,
        resolver: ManifestResolver,
        admission: Arc<AdmissionController>,
        worker_ctx: Arc<WorkerContext>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            store,
            resolver,
            admission,
            worker_ctx,
            metrics,
        }
    }
}

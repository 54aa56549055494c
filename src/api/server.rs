use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    routing::{delete, get, post},
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::decompression::RequestDecompressionLayer;
use tracing::info;

use super::state::AppState;
use super::{requests, services, uploads};
use crate::admission::AdmissionController;
use crate::catalog::ManifestResolver;
use crate::config::Config;
use crate::observability::Metrics;
use crate::queue;
use crate::sandbox::Runner;
use crate::store::Store;
use crate::worker::{self, WorkerContext};
use crate::workspace::WorkspaceBuilder;

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Assemble the node: store (with restart recovery), resolver, sandbox
/// runner, queue, worker pool, admission. Returns the API state and the
/// worker task handles.
pub async fn build_node(config: Config) -> Result<(AppState, Vec<JoinHandle<()>>), AnyError> {
    let config = Arc::new(config);
    let metrics = Arc::new(Metrics::new());

    info!(path = %config.server.store_path.display(), "opening store");
    let store = Store::open(&config.server.store_path)?;

    let resolver = ManifestResolver::new(config.manifest_path(), config.data.data_root.clone());

    let runner = Arc::new(
        Runner::initialize(&config.execution, config.data.data_root.clone()).await,
    );

    let (job_queue, receiver) = queue::channel(config.execution.queue_capacity);

    let worker_ctx = Arc::new(WorkerContext {
        store: store.clone(),
        resolver: resolver.clone(),
        privacy: config.privacy.clone(),
        workspaces: WorkspaceBuilder::new(
            config.data.work_dir.clone(),
            config.data.data_root.clone(),
        ),
        runner: runner.clone(),
        metrics: metrics.clone(),
        node_id: config.node.node_id.clone(),
        audit_enabled: config.audit.enabled,
    });

    let workers = worker::spawn_workers(
        config.execution.worker_count,
        worker_ctx.clone(),
        receiver,
    );

    // Jobs interrupted by the previous process: running rows become
    // failed, queued rows go back on the queue in submission order.
    let requeue = store.recover_interrupted(&config.node.node_id)?;
    if !requeue.is_empty() {
        info!(count = requeue.len(), "re-enqueueing jobs from previous run");
        for job_id in requeue {
            job_queue.send(job_id).await?;
        }
    }

    let admission = Arc::new(AdmissionController::new(
        &config,
        store.clone(),
        resolver.clone(),
        job_queue,
        metrics.clone(),
    ));

    let state = AppState::new(config, store, resolver, admission, worker_ctx, metrics);
    Ok((state, workers))
}

/// All routes, shared between the server and the router-level tests.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/jobs", post(services::submit_job))
        .route("/api/v1/jobs", get(services::list_jobs))
        .route("/api/v1/jobs/{job_id}", get(services::get_job))
        .route("/api/v1/jobs/{job_id}", delete(services::cancel_job))
        .route("/api/v1/jobs/{job_id}/audit", get(services::job_audit))
        .route("/api/v1/uploads/scripts", post(uploads::upload_script))
        .route("/api/v1/uploads/data", post(uploads::upload_data))
        .route("/api/v1/uploads", get(uploads::list_uploads))
        .route("/api/v1/catalogs", get(services::list_catalogs))
        .route("/api/v1/node", get(services::node_info))
        .route("/api/v1/nodes", post(services::register_node))
        .route("/api/v1/nodes", get(services::list_nodes))
        .route("/api/v1/requests", post(requests::create_request))
        .route("/api/v1/requests", get(requests::list_requests))
        .route(
            "/api/v1/requests/{request_id}/approve",
            post(requests::approve_request),
        )
        .route(
            "/api/v1/requests/{request_id}/deny",
            post(requests::deny_request),
        )
        .route("/health", get(services::health))
        .with_state(state)
        // Transparent gzip/deflate request decompression for large scripts
        .layer(RequestDecompressionLayer::new())
}

/// Run the node until shutdown.
pub async fn run(config: Config, address: Option<SocketAddr>) -> Result<(), AnyError> {
    let bind_addr = address.unwrap_or(config.server.bind_addr);
    let (state, _workers) = build_node(config).await?;
    let store = state.store.clone();
    let app = build_router(state);

    let listener = TcpListener::bind(bind_addr).await?;
    info!(%bind_addr, "fednode API listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    store.persist()?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install signal handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}

//! Job submission, status, listing, cancellation, and discovery
//! handlers. These are thin: validation and side effects live in the
//! admission controller, worker pipeline, and store.

use axum::{
    Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use serde_json::json;
use uuid::Uuid;

use super::error::ApiError;
use super::models::{
    CancelResponse, HealthResponse, JobView, ListJobsQuery, NodeInfoResponse, RegisterNodeBody,
    SubmitJobRequest, SubmitJobResponse,
};
use super::state::AppState;
use crate::admission::Submission;
use crate::job::JobStatus;
use crate::store::NodeRecord;
use crate::worker::{self, CancelOutcome};

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

/// Primary submission endpoint (POST /api/v1/jobs)
///
/// Admission side effects: job row committed as `queued`, id enqueued
/// for the worker pool, audit row written. A full queue refuses with
/// 503 and leaves nothing behind.
pub async fn submit_job(
    State(state): State<AppState>,
    Json(body): Json<SubmitJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let submission = Submission {
        target_node_id: body.target_node_id,
        data_catalog: body.data_catalog,
        script_kind: body.script_kind,
        script_content: body.script_content,
        parameters: body.parameters.unwrap_or_else(|| json!({})),
        filters: body.filters.unwrap_or_else(|| json!({})),
        uploaded_file_ids: body.uploaded_file_ids.unwrap_or_default(),
        // Authentication is a collaborator concern; requester identity
        // arrives with the token when the issuer fronts this API.
        requester_node_id: "external".to_string(),
        analysis_request_id: None,
    };

    let job = state.admission.admit(submission)?;

    let response = SubmitJobResponse {
        job_id: job.job_id,
        status: "submitted".to_string(),
    };
    Ok((axum::http::StatusCode::ACCEPTED, Json(response)))
}

/// Job status endpoint (GET /api/v1/jobs/{job_id})
///
/// Applies the release-gate projection: completed rows whose cohort is
/// below the currently effective threshold present as `blocked`.
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .store
        .get_job(&job_id)?
        .ok_or_else(|| ApiError::NotFound(format!("job {job_id}")))?;

    let effective_min = effective_min_cohort(&state, &job.catalog_id);
    Ok(Json(JobView::project(job, effective_min)))
}

/// GET /api/v1/jobs?status=&limit=, newest first.
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(
            JobStatus::parse(raw)
                .ok_or_else(|| ApiError::InvalidPayload(format!("unknown status: {raw}")))?,
        ),
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT);

    let jobs = state.store.list_jobs(status, limit)?;

    // One manifest load for the whole listing.
    let node_default = state.config.privacy.min_cohort_size;
    let thresholds: std::collections::HashMap<String, i64> = state
        .resolver
        .load()
        .map(|catalogs| {
            catalogs
                .into_iter()
                .map(|c| {
                    let min = c.effective_min_cohort_size(node_default);
                    (c.id, min)
                })
                .collect()
        })
        .unwrap_or_default();

    let views: Vec<JobView> = jobs
        .into_iter()
        .map(|job| {
            let effective_min = thresholds
                .get(&job.catalog_id)
                .copied()
                .unwrap_or(node_default);
            JobView::project(job, effective_min)
        })
        .collect();

    Ok(Json(views))
}

/// DELETE /api/v1/jobs/{job_id}: cancel.
///
/// Idempotent: repeating the call after the job is terminal returns a
/// stable message and mutates nothing.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = worker::cancel_job(&state.worker_ctx, job_id).await?;

    let response = match outcome {
        CancelOutcome::NotFound => {
            return Err(ApiError::NotFound(format!("job {job_id}")));
        }
        CancelOutcome::CancelledWhileQueued => CancelResponse {
            job_id,
            status: JobStatus::Cancelled,
            message: "job cancelled".to_string(),
        },
        CancelOutcome::StopRequested => CancelResponse {
            job_id,
            status: JobStatus::Running,
            message: "stop requested; the job will be cancelled shortly".to_string(),
        },
        CancelOutcome::AlreadyTerminal(status) => CancelResponse {
            job_id,
            status,
            message: format!("job already {status}; nothing to cancel"),
        },
    };

    Ok(Json(response))
}

/// GET /api/v1/catalogs: the resolved catalog list.
pub async fn list_catalogs(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let catalogs = state
        .resolver
        .load()
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    Ok(Json(catalogs))
}

/// GET /api/v1/node: identity and load, broadcast in discovery.
pub async fn node_info(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let (total_jobs, active_jobs) = state.store.count_jobs()?;

    Ok(Json(NodeInfoResponse {
        node_id: state.config.node.node_id.clone(),
        node_name: state.config.node.node_name.clone(),
        institution: state.config.node.institution.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        sandbox_backend: state.worker_ctx.runner.backend_name().to_string(),
        uptime_seconds: state.metrics.uptime_seconds(),
        active_jobs,
        total_jobs,
        counters: state.metrics.snapshot(),
    }))
}

/// GET /api/v1/jobs/{job_id}/audit: the job's audit trail, in append
/// order.
pub async fn job_audit(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    if state.store.get_job(&job_id)?.is_none() {
        return Err(ApiError::NotFound(format!("job {job_id}")));
    }
    Ok(Json(state.store.audit_for_job(&job_id)?))
}

/// POST /api/v1/nodes: register a peer node.
pub async fn register_node(
    State(state): State<AppState>,
    Json(body): Json<RegisterNodeBody>,
) -> Result<impl IntoResponse, ApiError> {
    if body.node_id.trim().is_empty() {
        return Err(ApiError::InvalidPayload("node_id must not be empty".into()));
    }

    let now = chrono::Utc::now();
    let node = NodeRecord {
        node_id: body.node_id,
        name: body.name,
        institution: body.institution,
        endpoint_url: body.endpoint_url,
        is_active: true,
        last_seen: now,
        registered_at: now,
    };
    state.store.upsert_node(&node)?;

    Ok((axum::http::StatusCode::CREATED, Json(node)))
}

/// GET /api/v1/nodes: known peers.
pub async fn list_nodes(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.list_nodes()?))
}

/// Health check endpoint (GET /health)
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    use std::collections::HashMap;

    let mut components = HashMap::new();
    components.insert("api".to_string(), "healthy".to_string());
    components.insert(
        "store".to_string(),
        match state.store.health_check() {
            Ok(()) => "healthy".to_string(),
            Err(_) => "unhealthy".to_string(),
        },
    );
    components.insert(
        "manifest".to_string(),
        match state.resolver.load() {
            Ok(_) => "healthy".to_string(),
            Err(_) => "unhealthy".to_string(),
        },
    );

    let all_healthy = components.values().all(|status| status == "healthy");
    let status_code = if all_healthy {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if all_healthy { "healthy" } else { "unhealthy" }.to_string(),
        components,
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    (status_code, Json(response))
}

/// Effective threshold for a catalog at read time; falls back to the
/// node default when the catalog is unresolvable.
fn effective_min_cohort(state: &AppState, catalog_id: &str) -> i64 {
    state
        .resolver
        .resolve(catalog_id)
        .map(|catalog| catalog.effective_min_cohort_size(state.config.privacy.min_cohort_size))
        .unwrap_or(state.config.privacy.min_cohort_size)
}

//! Analysis-request endpoints: the human approval workflow upstream of
//! admission. Approval claims the pending request, then admits a job
//! that carries the request id.

use axum::{
    Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use super::error::ApiError;
use super::models::{ApproveResponse, CreateRequestBody, DecideRequestBody, ListRequestsQuery};
use super::state::AppState;
use crate::admission::Submission;
use crate::job::ScriptKind;
use crate::store::{AnalysisRequest, NewAnalysisRequest, RequestStatus};

/// POST /api/v1/requests
pub async fn create_request(
    State(state): State<AppState>,
    Json(body): Json<CreateRequestBody>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(kind) = ScriptKind::parse(&body.script_kind) else {
        return Err(ApiError::InvalidPayload(format!(
            "unknown script kind: {}",
            body.script_kind
        )));
    };
    if body.script_content.trim().is_empty() {
        return Err(ApiError::InvalidPayload("script is empty".into()));
    }

    let request = AnalysisRequest::new(NewAnalysisRequest {
        requester_name: body.requester_name,
        requester_institution: body.requester_institution,
        requester_email: body.requester_email,
        requester_affiliation: body.requester_affiliation,
        analysis_title: body.analysis_title,
        analysis_description: body.analysis_description,
        target_node_id: body.target_node_id,
        data_catalog: body.data_catalog,
        script_kind: kind,
        script_content: body.script_content,
        parameters: body.parameters.unwrap_or_else(|| json!({})),
        filters: body.filters.unwrap_or_else(|| json!({})),
        priority: body.priority,
    });
    state.store.insert_request(&request)?;

    Ok((axum::http::StatusCode::CREATED, Json(request)))
}

/// GET /api/v1/requests?status=
pub async fn list_requests(
    State(state): State<AppState>,
    Query(query): Query<ListRequestsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some("pending") => Some(RequestStatus::Pending),
        Some("approved") => Some(RequestStatus::Approved),
        Some("denied") => Some(RequestStatus::Denied),
        Some("expired") => Some(RequestStatus::Expired),
        Some(other) => {
            return Err(ApiError::InvalidPayload(format!(
                "unknown request status: {other}"
            )));
        }
    };
    Ok(Json(state.store.list_requests(status)?))
}

/// POST /api/v1/requests/{request_id}/approve
///
/// Claims the pending request, then admits a job for it. Admission
/// failures surface to the approver; the claim is not rolled back, so
/// a request is decided at most once.
pub async fn approve_request(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
    Json(body): Json<DecideRequestBody>,
) -> Result<impl IntoResponse, ApiError> {
    let request = state.store.decide_request(
        &request_id,
        RequestStatus::Approved,
        &body.decided_by,
        body.notes,
    )?;

    let submission = Submission {
        target_node_id: request.target_node_id.clone(),
        data_catalog: request.data_catalog.clone(),
        script_kind: request.script_kind.as_str().to_string(),
        script_content: request.script_content.clone(),
        parameters: request.parameters.clone(),
        filters: request.filters.clone(),
        uploaded_file_ids: vec![],
        requester_node_id: request.requester_institution.clone(),
        analysis_request_id: Some(request_id),
    };

    let job = state.admission.admit(submission).map_err(|err| {
        warn!(%request_id, %err, "approved request failed admission");
        ApiError::from(err)
    })?;

    Ok(Json(ApproveResponse {
        request_id,
        status: "approved".to_string(),
        job_id: job.job_id,
    }))
}

/// POST /api/v1/requests/{request_id}/deny
pub async fn deny_request(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
    Json(body): Json<DecideRequestBody>,
) -> Result<impl IntoResponse, ApiError> {
    let request = state.store.decide_request(
        &request_id,
        RequestStatus::Denied,
        &body.decided_by,
        body.notes,
    )?;
    Ok(Json(request))
}

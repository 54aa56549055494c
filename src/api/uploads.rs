//! Upload endpoints: researchers stage script files and data blobs
//! (connectivity maps, lookup tables) ahead of submission and reference
//! them by `file_id`. Extension allow-lists are enforced here; the
//! blobs land in the uploads directory and never move again.

use axum::{
    Json,
    extract::{Query, State},
    response::IntoResponse,
};
use chrono::Utc;
use http_body_util::BodyExt;
use uuid::Uuid;

use super::error::ApiError;
use super::models::{UploadQuery, UploadResponse};
use super::state::AppState;
use crate::store::UploadedFile;

const SCRIPT_EXTENSIONS: &[&str] = &["py", "r"];
const DATA_EXTENSIONS: &[&str] = &["csv", "tsv", "json", "npy", "npz", "mat", "nii", "nii.gz"];

/// POST /api/v1/uploads/scripts?filename=: raw script body.
pub async fn upload_script(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    body: axum::body::Body,
) -> Result<impl IntoResponse, ApiError> {
    store_upload(&state, &query.filename, body, SCRIPT_EXTENSIONS).await
}

/// POST /api/v1/uploads/data?filename=: raw data blob.
pub async fn upload_data(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    body: axum::body::Body,
) -> Result<impl IntoResponse, ApiError> {
    store_upload(&state, &query.filename, body, DATA_EXTENSIONS).await
}

/// GET /api/v1/uploads: metadata for everything staged on this node.
pub async fn list_uploads(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.list_uploads()?))
}

async fn store_upload(
    state: &AppState,
    filename: &str,
    body: axum::body::Body,
    allowed: &[&str],
) -> Result<(axum::http::StatusCode, Json<UploadResponse>), ApiError> {
    let kind = extension_of(filename).ok_or_else(|| {
        ApiError::InvalidPayload(format!("filename has no extension: {filename}"))
    })?;
    if !allowed.contains(&kind.as_str()) {
        return Err(ApiError::InvalidPayload(format!(
            "file type .{kind} not allowed; accepted: {}",
            allowed.join(", ")
        )));
    }

    let data = body
        .collect()
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?
        .to_bytes();
    let limit = state.config.data.max_upload_bytes.as_usize();
    if data.len() > limit {
        return Err(ApiError::PayloadTooLarge(data.len()));
    }
    if data.is_empty() {
        return Err(ApiError::InvalidPayload("empty upload".into()));
    }

    let file_id = Uuid::now_v7();
    let safe_name = sanitize_filename(filename);
    let uploads_dir = &state.config.data.uploads_dir;
    std::fs::create_dir_all(uploads_dir)
        .map_err(|err| ApiError::Internal(format!("uploads directory: {err}")))?;
    let stored_path = uploads_dir.join(format!("{file_id}_{safe_name}"));
    std::fs::write(&stored_path, &data)
        .map_err(|err| ApiError::Internal(format!("upload write failed: {err}")))?;

    let stored_path = std::path::absolute(&stored_path)
        .map_err(|err| ApiError::Internal(err.to_string()))?;

    let upload = UploadedFile {
        file_id,
        original_name: filename.to_string(),
        stored_path: stored_path.to_string_lossy().into_owned(),
        kind: kind.clone(),
        size_bytes: data.len() as u64,
        uploaded_at: Utc::now(),
    };
    state.store.insert_upload(&upload)?;

    let response = UploadResponse {
        file_id,
        original_name: upload.original_name,
        kind,
        size_bytes: upload.size_bytes,
    };
    Ok((axum::http::StatusCode::CREATED, Json(response)))
}

/// Normalized extension, treating `.nii.gz` as one unit.
fn extension_of(filename: &str) -> Option<String> {
    let lower = filename.to_lowercase();
    if lower.ends_with(".nii.gz") {
        return Some("nii.gz".to_string());
    }
    lower.rsplit_once('.').map(|(_, ext)| ext.to_string())
}

fn sanitize_filename(filename: &str) -> String {
    std::path::Path::new(filename)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string())
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

//! API request/response types.
//!
//! The submission contract mirrors what remote research clients send:
//!
//! ```json
//! {
//!   "target_node_id": "hospital-a",
//!   "data_catalog": "clinical_v1",
//!   "script_kind": "python",
//!   "script_content": "from data_loader import load_data, save_results\n...",
//!   "parameters": {"outcome": "updrs_iii"},
//!   "filters": {"site": "boston"},
//!   "uploaded_file_ids": ["0191..."]
//! }
//! ```
//!
//! Job views apply the release-gate projection: a row that completed
//! with a cohort below the currently effective threshold is presented
//! as `blocked` with a redacted message, never with its stored result.

use crate::job::{Job, JobStatus, ScriptKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitJobRequest {
    pub target_node_id: String,
    pub data_catalog: String,
    pub script_kind: String,
    pub script_content: String,
    #[serde(default)]
    pub parameters: Option<Value>,
    #[serde(default)]
    pub filters: Option<Value>,
    #[serde(default)]
    pub uploaded_file_ids: Option<Vec<Uuid>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub job_id: Uuid,
    pub status: String,
}

/// Client-visible projection of a job row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub script_kind: ScriptKind,
    pub script_hash: String,
    pub catalog_id: String,
    pub progress: f64,
    pub result_data: Option<Value>,
    pub error_message: Option<String>,
    pub execution_time_s: Option<f64>,
    pub memory_used_mb: Option<f64>,
    pub records_processed: Option<i64>,
    pub requester_node_id: String,
    pub analysis_request_id: Option<Uuid>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobView {
    /// Project a row for clients. `effective_min_cohort` is re-derived
    /// at read time so policy changes apply to already-stored rows.
    pub fn project(job: Job, effective_min_cohort: i64) -> Self {
        let mut view = Self::from_row(job);

        if view.status == JobStatus::Completed {
            let below_threshold = view
                .records_processed
                .is_none_or(|n| n < effective_min_cohort);
            if below_threshold {
                let n = view
                    .records_processed
                    .map_or_else(|| "unknown".to_string(), |n| n.to_string());
                view.status = JobStatus::Blocked;
                view.result_data = Some(json!({
                    "message": format!(
                        "Results blocked: cohort size ({n}) below minimum ({effective_min_cohort})"
                    ),
                }));
            }
        }

        view
    }

    fn from_row(job: Job) -> Self {
        Self {
            job_id: job.job_id,
            status: job.status,
            script_kind: job.script_kind,
            script_hash: job.script_hash,
            catalog_id: job.catalog_id,
            progress: job.progress,
            result_data: job.result_data,
            error_message: job.error_message,
            execution_time_s: job.execution_time_s,
            memory_used_mb: job.memory_used_mb,
            records_processed: job.records_processed,
            requester_node_id: job.requester_node_id,
            analysis_request_id: job.analysis_request_id,
            submitted_at: job.submitted_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub filename: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub file_id: Uuid,
    pub original_name: String,
    pub kind: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateRequestBody {
    pub requester_name: String,
    pub requester_institution: String,
    pub requester_email: String,
    #[serde(default)]
    pub requester_affiliation: Option<String>,
    pub analysis_title: String,
    pub analysis_description: String,
    pub target_node_id: String,
    pub data_catalog: String,
    pub script_kind: String,
    pub script_content: String,
    #[serde(default)]
    pub parameters: Option<Value>,
    #[serde(default)]
    pub filters: Option<Value>,
    #[serde(default = "default_priority")]
    pub priority: String,
}

fn default_priority() -> String {
    "normal".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ListRequestsQuery {
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecideRequestBody {
    pub decided_by: String,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApproveResponse {
    pub request_id: Uuid,
    pub status: String,
    pub job_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterNodeBody {
    pub node_id: String,
    pub name: String,
    pub institution: String,
    pub endpoint_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NodeInfoResponse {
    pub node_id: String,
    pub node_name: String,
    pub institution: String,
    pub version: String,
    pub sandbox_backend: String,
    pub uptime_seconds: u64,
    pub active_jobs: usize,
    pub total_jobs: usize,
    pub counters: crate::observability::MetricsSnapshot,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub components: HashMap<String, String>,
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::NewJob;

    fn completed_job(records: Option<i64>) -> Job {
        let mut job = Job::new(NewJob {
            script_kind: ScriptKind::Python,
            script_content: "save_results({})".to_string(),
            catalog_id: "clinical_v1".to_string(),
            parameters: json!({}),
            filters: json!({}),
            uploaded_file_ids: vec![],
            requester_node_id: "remote".to_string(),
            executor_node_id: "local".to_string(),
            analysis_request_id: None,
        });
        job.status = JobStatus::Completed;
        job.result_data = Some(json!({"age_mean": 45.2}));
        job.records_processed = records;
        job
    }

    #[test]
    fn projection_passes_adequate_cohorts() {
        let view = JobView::project(completed_job(Some(150)), 10);
        assert_eq!(view.status, JobStatus::Completed);
        assert_eq!(view.result_data.unwrap()["age_mean"], json!(45.2));
    }

    #[test]
    fn projection_blocks_small_cohorts_and_redacts() {
        let view = JobView::project(completed_job(Some(3)), 10);
        assert_eq!(view.status, JobStatus::Blocked);
        let message = view.result_data.unwrap()["message"]
            .as_str()
            .unwrap()
            .to_string();
        assert!(message.contains("cohort size (3)"));
        assert!(message.contains("minimum (10)"));
        assert!(!message.contains("45.2"));
    }

    #[test]
    fn projection_blocks_unknown_cohorts() {
        let view = JobView::project(completed_job(None), 10);
        assert_eq!(view.status, JobStatus::Blocked);
    }

    #[test]
    fn projection_leaves_failed_rows_alone() {
        let mut job = completed_job(Some(3));
        job.status = JobStatus::Failed;
        job.result_data = None;
        let view = JobView::project(job, 10);
        assert_eq!(view.status, JobStatus::Failed);
        assert!(view.result_data.is_none());
    }
}

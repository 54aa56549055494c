//! Core job entity and its lifecycle state machine.
//!
//! A `Job` is one submission of a user script against a data catalog,
//! tracked from admission through a terminal state on the executing node.
//! Rows are owned by the job store; everything immutable at creation time
//! stays immutable, and status changes must follow [`JobStatus::can_transition`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Script kinds the node knows how to stage and execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptKind {
    Python,
    R,
    Sql,
    Jupyter,
}

impl ScriptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptKind::Python => "python",
            ScriptKind::R => "r",
            ScriptKind::Sql => "sql",
            ScriptKind::Jupyter => "jupyter",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "python" => Some(ScriptKind::Python),
            "r" => Some(ScriptKind::R),
            "sql" => Some(ScriptKind::Sql),
            "jupyter" => Some(ScriptKind::Jupyter),
            _ => None,
        }
    }

    /// File extension the staged script gets inside the workspace.
    pub fn extension(&self) -> &'static str {
        match self {
            ScriptKind::Python => "py",
            ScriptKind::R => "r",
            ScriptKind::Sql => "sql",
            ScriptKind::Jupyter => "ipynb",
        }
    }

    /// Host interpreter invocation for the subprocess backend, as
    /// `(program, leading args)`. The script path is appended last.
    pub fn interpreter(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            ScriptKind::Python => ("python3", &[]),
            ScriptKind::R => ("Rscript", &[]),
            ScriptKind::Sql => ("psql", &["-f"]),
            ScriptKind::Jupyter => ("jupyter", &["nbconvert", "--execute"]),
        }
    }

    /// Whether the data-access shim is staged for this kind.
    pub fn uses_shim(&self) -> bool {
        matches!(self, ScriptKind::Python | ScriptKind::Jupyter)
    }
}

impl std::fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job lifecycle states.
///
/// ```text
/// queued ──► running ──► completed | failed | blocked
///    │           │
///    └──────────┴─────► cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Blocked,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Blocked => "blocked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            "blocked" => Some(JobStatus::Blocked),
            _ => None,
        }
    }

    /// Exactly one terminal state is ever written per job.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Blocked
        )
    }

    /// Legal edges of the lifecycle DAG. No backward transitions, no
    /// writes past a terminal state.
    pub fn can_transition(&self, to: JobStatus) -> bool {
        match (self, to) {
            (JobStatus::Queued, JobStatus::Running) => true,
            (JobStatus::Queued, JobStatus::Cancelled) => true,
            (JobStatus::Running, JobStatus::Completed) => true,
            (JobStatus::Running, JobStatus::Failed) => true,
            (JobStatus::Running, JobStatus::Cancelled) => true,
            (JobStatus::Running, JobStatus::Blocked) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One submission of a user script against a catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub script_kind: ScriptKind,
    pub script_content: String,
    /// SHA-256 hex of `script_content`, fixed at admission.
    pub script_hash: String,
    pub catalog_id: String,
    pub parameters: Value,
    pub filters: Value,
    pub uploaded_file_ids: Vec<Uuid>,
    pub requester_node_id: String,
    pub executor_node_id: String,
    pub analysis_request_id: Option<Uuid>,

    pub status: JobStatus,
    pub progress: f64,
    pub result_data: Option<Value>,
    pub error_message: Option<String>,
    pub execution_time_s: Option<f64>,
    pub memory_used_mb: Option<f64>,
    pub records_processed: Option<i64>,

    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Immutable fields of a new submission; everything mutable starts at
/// its queued default.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub script_kind: ScriptKind,
    pub script_content: String,
    pub catalog_id: String,
    pub parameters: Value,
    pub filters: Value,
    pub uploaded_file_ids: Vec<Uuid>,
    pub requester_node_id: String,
    pub executor_node_id: String,
    pub analysis_request_id: Option<Uuid>,
}

impl Job {
    pub fn new(new: NewJob) -> Self {
        let script_hash = script_hash(&new.script_content);
        Self {
            job_id: Uuid::now_v7(),
            script_kind: new.script_kind,
            script_content: new.script_content,
            script_hash,
            catalog_id: new.catalog_id,
            parameters: new.parameters,
            filters: new.filters,
            uploaded_file_ids: new.uploaded_file_ids,
            requester_node_id: new.requester_node_id,
            executor_node_id: new.executor_node_id,
            analysis_request_id: new.analysis_request_id,
            status: JobStatus::Queued,
            progress: 0.0,
            result_data: None,
            error_message: None,
            execution_time_s: None,
            memory_used_mb: None,
            records_processed: None,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// SHA-256 hex digest of script text.
pub fn script_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// What the sandbox runner hands back to the worker for one execution.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub execution_time_s: f64,
    pub memory_used_mb: Option<f64>,
    pub records_processed: Option<i64>,
    pub logs: String,
}

//! Admission control: validates a submission, fixes the script hash,
//! commits the job row as `queued`, hands the id to the queue, and
//! writes the audit row. A refused submission leaves nothing behind;
//! the queue slot is reserved before the row is inserted.

use crate::catalog::{CatalogError, ManifestResolver};
use crate::config::Config;
use crate::job::{Job, NewJob, ScriptKind};
use crate::observability::Metrics;
use crate::queue::{JobQueue, QueueError};
use crate::store::{AuditEntry, Store, StoreError};
use serde_json::{Value, json};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("unknown script kind: {0}")]
    UnknownScriptKind(String),

    #[error("script kind not allowed on this node: {0}")]
    KindNotAllowed(ScriptKind),

    #[error("script is empty")]
    EmptyScript,

    #[error("script too large: {size} bytes (limit {limit})")]
    ScriptTooLarge { size: usize, limit: u64 },

    #[error("unknown target node: {0}")]
    UnknownTargetNode(String),

    #[error("unknown data catalog: {0}")]
    UnknownCatalog(String),

    #[error("unknown uploaded file: {0}")]
    UnknownUploadedFile(Uuid),

    #[error(transparent)]
    Overloaded(#[from] QueueError),

    #[error("catalog manifest error: {0}")]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One validated submission, as received from the API or an approved
/// analysis request.
#[derive(Debug, Clone)]
pub struct Submission {
    pub target_node_id: String,
    pub data_catalog: String,
    pub script_kind: String,
    pub script_content: String,
    pub parameters: Value,
    pub filters: Value,
    pub uploaded_file_ids: Vec<Uuid>,
    pub requester_node_id: String,
    pub analysis_request_id: Option<Uuid>,
}

pub struct AdmissionController {
    store: Store,
    resolver: ManifestResolver,
    queue: JobQueue,
    metrics: Arc<Metrics>,
    allowed_kinds: Vec<ScriptKind>,
    max_script_bytes: u64,
    node_id: String,
    audit_enabled: bool,
}

impl AdmissionController {
    pub fn new(
        config: &Config,
        store: Store,
        resolver: ManifestResolver,
        queue: JobQueue,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            resolver,
            queue,
            metrics,
            allowed_kinds: config.execution.allowed_script_kinds.clone(),
            max_script_bytes: config.execution.max_script_bytes.as_u64(),
            node_id: config.node.node_id.clone(),
            audit_enabled: config.audit.enabled,
        }
    }

    /// Validate and admit one submission. On success the job row exists
    /// as `queued` and its id is on the queue.
    pub fn admit(&self, submission: Submission) -> Result<Job, AdmissionError> {
        let kind = ScriptKind::parse(&submission.script_kind)
            .ok_or_else(|| AdmissionError::UnknownScriptKind(submission.script_kind.clone()))?;
        if !self.allowed_kinds.contains(&kind) {
            return Err(AdmissionError::KindNotAllowed(kind));
        }

        if submission.script_content.trim().is_empty() {
            return Err(AdmissionError::EmptyScript);
        }
        let size = submission.script_content.len();
        if size as u64 > self.max_script_bytes {
            return Err(AdmissionError::ScriptTooLarge {
                size,
                limit: self.max_script_bytes,
            });
        }

        if submission.target_node_id != self.node_id
            && self.store.get_node(&submission.target_node_id)?.is_none()
        {
            return Err(AdmissionError::UnknownTargetNode(
                submission.target_node_id.clone(),
            ));
        }

        let catalog = match self.resolver.resolve(&submission.data_catalog) {
            Ok(catalog) => catalog,
            Err(CatalogError::NotFound(key)) => {
                return Err(AdmissionError::UnknownCatalog(key));
            }
            Err(err) => return Err(err.into()),
        };

        for file_id in &submission.uploaded_file_ids {
            if self.store.get_upload(file_id)?.is_none() {
                return Err(AdmissionError::UnknownUploadedFile(*file_id));
            }
        }

        // Reserve the queue slot first so a full queue refuses without
        // leaving an orphan row.
        let slot = self.queue.try_reserve()?;

        let job = Job::new(NewJob {
            script_kind: kind,
            script_content: submission.script_content,
            catalog_id: catalog.id.clone(),
            parameters: submission.parameters,
            filters: submission.filters,
            uploaded_file_ids: submission.uploaded_file_ids,
            requester_node_id: submission.requester_node_id,
            executor_node_id: self.node_id.clone(),
            analysis_request_id: submission.analysis_request_id,
        });

        self.store.insert_job(&job)?;
        slot.send(job.job_id);

        if self.audit_enabled {
            let entry = AuditEntry::new("job_submitted", &self.node_id)
                .job(job.job_id)
                .details(json!({
                    "catalog_id": catalog.id,
                    "script_kind": kind,
                    "script_hash": job.script_hash,
                    "requester_node_id": job.requester_node_id,
                }));
            if let Err(err) = self.store.append_audit(entry) {
                error!(%err, "failed to write audit row");
            }
        }
        self.metrics.job_submitted();

        info!(job_id = %job.job_id, catalog = %catalog.id, kind = %kind, "job admitted");
        Ok(job)
    }
}

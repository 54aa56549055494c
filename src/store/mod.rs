//! Fjall-backed persistence for the node's durable state
//!
//! One keyspace with a partition per record family: job rows, the
//! append-only audit trail, uploaded-file metadata, analysis requests,
//! and the peer-node registry. Values are JSON documents; keys are
//! prefix-encoded strings (see [`partitions`]).
//!
//! The job partition is the only one with update semantics, and every
//! mutation there is conditional on the current status: an update that
//! would violate the lifecycle DAG returns [`StoreError::Conflict`] and
//! writes nothing.

mod audit;
mod jobs;
mod nodes;
mod partitions;
mod requests;
mod uploads;

pub use audit::AuditEntry;
pub use nodes::NodeRecord;
pub use requests::{AnalysisRequest, NewAnalysisRequest, RequestStatus};
pub use uploads::UploadedFile;

use crate::job::JobStatus;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("analysis request not found: {0}")]
    RequestNotFound(Uuid),

    #[error("illegal status transition for job {job_id}: {from} -> {to}")]
    Conflict {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("request {request_id} is {status}, not pending")]
    RequestNotPending { request_id: Uuid, status: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Durable node state: jobs, audit, uploads, requests, peer nodes.
#[derive(Clone)]
pub struct Store {
    keyspace: Keyspace,
    pub(crate) jobs: PartitionHandle,
    pub(crate) audit: PartitionHandle,
    pub(crate) uploads: PartitionHandle,
    pub(crate) requests: PartitionHandle,
    pub(crate) nodes: PartitionHandle,
    pub(crate) meta: PartitionHandle,
    pub(crate) audit_seq: Arc<AtomicU64>,
    /// Serializes read-check-write updates (job transitions, request
    /// decisions) so racing writers cannot both pass the status guard.
    /// Shared by every clone of the store.
    pub(crate) row_lock: Arc<Mutex<()>>,
}

impl Store {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening store at: {}", path.display());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let keyspace = fjall::Config::new(path).open()?;

        let jobs = keyspace.open_partition("jobs", PartitionCreateOptions::default())?;
        let audit = keyspace.open_partition("audit", PartitionCreateOptions::default())?;
        let uploads = keyspace.open_partition("uploads", PartitionCreateOptions::default())?;
        let requests = keyspace.open_partition("requests", PartitionCreateOptions::default())?;
        let nodes = keyspace.open_partition("nodes", PartitionCreateOptions::default())?;
        let meta = keyspace.open_partition("meta", PartitionCreateOptions::default())?;

        // Audit rows are globally ordered by a persisted counter.
        let audit_seq = meta
            .get(partitions::encode_meta_key("audit_seq"))?
            .and_then(|bytes| std::str::from_utf8(&bytes).ok()?.parse::<u64>().ok())
            .unwrap_or(0);

        Ok(Self {
            keyspace,
            jobs,
            audit,
            uploads,
            requests,
            nodes,
            meta,
            audit_seq: Arc::new(AtomicU64::new(audit_seq)),
            row_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Persist all pending writes to disk.
    pub fn persist(&self) -> Result<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }

    /// Health check - verify the keyspace is accessible.
    pub fn health_check(&self) -> Result<()> {
        let _ = self.meta.get(partitions::encode_meta_key("audit_seq"))?;
        Ok(())
    }

    pub(crate) fn next_audit_seq(&self) -> Result<u64> {
        let seq = self.audit_seq.fetch_add(1, Ordering::SeqCst);
        self.meta.insert(
            partitions::encode_meta_key("audit_seq"),
            (seq + 1).to_string().into_bytes(),
        )?;
        Ok(seq)
    }
}

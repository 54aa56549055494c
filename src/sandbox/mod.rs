//! Sandboxed script execution.
//!
//! Two backends: a container backend (fresh container per job, no
//! network, capped memory/CPU, read-only data mount) and a subprocess
//! fallback for hosts without a container runtime. Both enforce the
//! per-job wall-clock limit and harvest `output.json` plus captured
//! logs. Which backend runs is decided once at startup.

mod container;
mod runner;
mod subprocess;

pub use runner::{Runner, RunnerSettings};

use crate::job::{RunOutcome, ScriptKind};
use crate::workspace::PreparedWorkspace;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Log excerpt retained on outcomes; the rest stays in the workspace.
pub(crate) const LOG_CAPTURE_LIMIT: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("no {kind} interpreter available on this host")]
    InterpreterMissing { kind: ScriptKind },

    #[error("failed to launch {kind} sandbox: {source}")]
    Spawn {
        kind: ScriptKind,
        source: std::io::Error,
    },

    #[error("sandbox I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cancelled")]
    Cancelled,
}

/// One staged execution, backend-agnostic.
pub(crate) struct RunRequest<'a> {
    pub job_id: Uuid,
    pub kind: ScriptKind,
    /// Container image for the kind; ignored by the subprocess backend.
    pub image: &'a str,
    pub workspace: &'a PreparedWorkspace,
    pub data_root: &'a Path,
    pub timeout: Duration,
}

/// The seam between the runner and its two isolation strategies.
#[async_trait]
pub(crate) trait SandboxBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(
        &self,
        request: RunRequest<'_>,
        cancel: &mut oneshot::Receiver<()>,
    ) -> Result<RunOutcome, RunError>;
}

/// The process-local map of in-flight runs.
///
/// Cancellation takes the sender out of the map, so a cancel racing a
/// completion can never stop the same run twice.
#[derive(Debug, Default)]
pub struct RunningJobs {
    inner: Mutex<HashMap<Uuid, oneshot::Sender<()>>>,
}

impl RunningJobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run; the returned receiver fires when the job is
    /// cancelled.
    pub fn register(&self, job_id: Uuid) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().unwrap().insert(job_id, tx);
        rx
    }

    pub fn deregister(&self, job_id: &Uuid) {
        self.inner.lock().unwrap().remove(job_id);
    }

    /// Signal a running job to stop. Returns false when the job is not
    /// (or no longer) running.
    pub fn cancel(&self, job_id: &Uuid) -> bool {
        match self.inner.lock().unwrap().remove(job_id) {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

pub(crate) fn truncate_log(mut log: String) -> String {
    if log.len() > LOG_CAPTURE_LIMIT {
        // The limit may land inside a multibyte character; cutting
        // there would panic.
        let mut cut = LOG_CAPTURE_LIMIT;
        while !log.is_char_boundary(cut) {
            cut -= 1;
        }
        log.truncate(cut);
        log.push_str("\n... [truncated]");
    }
    log
}

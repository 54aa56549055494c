//! The worker pool: pops admitted jobs from the queue and drives each
//! through the pipeline (static policy check, workspace staging,
//! sandboxed execution, release gate), persisting exactly one terminal
//! state per job. Failures are job-local and never take a worker down.

use crate::catalog::ManifestResolver;
use crate::config::PrivacyConfig;
use crate::job::{Job, JobStatus};
use crate::observability::Metrics;
use crate::policy::{self, ReleaseDecision, ReleasePolicy};
use crate::queue::JobReceiver;
use crate::sandbox::{RunError, Runner};
use crate::store::{AuditEntry, Store, StoreError, UploadedFile};
use crate::workspace::WorkspaceBuilder;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Everything a worker needs to process jobs.
pub struct WorkerContext {
    pub store: Store,
    pub resolver: ManifestResolver,
    pub privacy: PrivacyConfig,
    pub workspaces: WorkspaceBuilder,
    pub runner: Arc<Runner>,
    pub metrics: Arc<Metrics>,
    pub node_id: String,
    pub audit_enabled: bool,
}

impl WorkerContext {
    fn audit(&self, entry: AuditEntry) {
        if !self.audit_enabled {
            return;
        }
        if let Err(err) = self.store.append_audit(entry) {
            error!(%err, "failed to write audit row");
        }
    }
}

/// Spawn the symmetric worker pool over one shared receiver.
pub fn spawn_workers(
    count: usize,
    ctx: Arc<WorkerContext>,
    receiver: JobReceiver,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|worker_id| {
            let ctx = ctx.clone();
            let receiver = receiver.clone();
            tokio::spawn(async move {
                info!(worker_id, "worker started");
                while let Some(job_id) = receiver.recv().await {
                    if let Err(err) = execute_one(&ctx, job_id).await {
                        error!(worker_id, %job_id, %err, "job store failure during execution");
                    }
                }
                info!(worker_id, "worker stopped");
            })
        })
        .collect()
}

/// Drive one job to a terminal state. Only store errors escape; every
/// other failure is persisted onto the job row.
pub async fn execute_one(ctx: &WorkerContext, job_id: Uuid) -> Result<(), StoreError> {
    let Some(job) = ctx.store.get_job(&job_id)? else {
        warn!(%job_id, "dequeued job has no row, skipping");
        return Ok(());
    };
    if job.status != JobStatus::Queued {
        debug!(%job_id, status = %job.status, "skipping non-queued job");
        return Ok(());
    }

    // Racing cancellation may have already turned the row terminal.
    let job = match ctx.store.set_running(&job_id) {
        Ok(job) => job,
        Err(StoreError::Conflict { .. }) => {
            debug!(%job_id, "job no longer queued, skipping");
            return Ok(());
        }
        Err(err) => return Err(err),
    };

    info!(%job_id, kind = %job.script_kind, catalog = %job.catalog_id, "job started");

    let report = policy::validate_script(&job.script_content, job.script_kind);
    if !report.safe {
        let message = format!(
            "script failed security validation; blocked patterns: {}",
            report.blocked_patterns.join(", ")
        );
        commit_terminal(ctx.store.set_failed(&job_id, &message, None))?;
        ctx.audit(
            AuditEntry::new("script_rejected", &ctx.node_id)
                .job(job_id)
                .details(json!({
                    "risk": report.risk,
                    "blocked_patterns": report.blocked_patterns,
                })),
        );
        ctx.metrics.job_failed();
        return Ok(());
    }

    let catalog = match ctx.resolver.resolve(&job.catalog_id) {
        Ok(catalog) => catalog,
        Err(err) => {
            commit_terminal(ctx.store.set_failed(
                &job_id,
                &format!("catalog unavailable: {err}"),
                None,
            ))?;
            ctx.metrics.job_failed();
            return Ok(());
        }
    };
    let min_cohort = catalog.effective_min_cohort_size(ctx.privacy.min_cohort_size);

    let uploads = match load_uploads(ctx, &job) {
        Ok(uploads) => uploads,
        Err(missing) => {
            commit_terminal(ctx.store.set_failed(
                &job_id,
                &format!("uploaded file not found: {missing}"),
                None,
            ))?;
            ctx.metrics.job_failed();
            return Ok(());
        }
    };

    let workspace = match ctx.workspaces.build(&job, min_cohort, &uploads) {
        Ok(workspace) => workspace,
        Err(err) => {
            // Full detail stays in the logs; the row gets a correlation id.
            error!(%job_id, %err, "workspace staging failed");
            commit_terminal(ctx.store.set_failed(
                &job_id,
                &format!("internal error (correlation id {job_id})"),
                None,
            ))?;
            ctx.metrics.job_failed();
            return Ok(());
        }
    };

    match ctx.runner.run(&job, &workspace).await {
        Err(RunError::Cancelled) => {
            match ctx.store.set_cancelled(&job_id) {
                Ok(_) | Err(StoreError::Conflict { .. }) => {}
                Err(err) => return Err(err),
            }
            ctx.metrics.job_cancelled();
            info!(%job_id, "job cancelled during execution");
        }
        Err(err) => {
            commit_terminal(ctx.store.set_failed(&job_id, &err.to_string(), None))?;
            ctx.metrics.job_failed();
        }
        Ok(outcome) if !outcome.success => {
            let message = outcome
                .error
                .unwrap_or_else(|| "script execution failed".to_string());
            commit_terminal(ctx.store.set_failed(
                &job_id,
                &message,
                Some(outcome.execution_time_s),
            ))?;
            ctx.metrics.job_failed();
            info!(%job_id, "job failed");
        }
        Ok(outcome) => {
            let records = outcome
                .records_processed
                .or_else(|| catalog.first_tabular_record_count());
            let release_policy = ReleasePolicy::new(&ctx.privacy, catalog.min_cohort_size);
            let result = outcome.data.unwrap_or(Value::Null);

            match policy::release(&release_policy, &result, records) {
                ReleaseDecision::Released(clean) => {
                    commit_terminal(ctx.store.set_completed(
                        &job_id,
                        clean,
                        outcome.execution_time_s,
                        outcome.memory_used_mb,
                        records,
                    ))?;
                    ctx.metrics.job_completed();
                    info!(%job_id, ?records, "job completed");
                }
                ReleaseDecision::Blocked { reason } => {
                    let payload = policy::blocked_payload(&release_policy, &reason);
                    commit_terminal(ctx.store.set_blocked(
                        &job_id,
                        payload,
                        outcome.execution_time_s,
                        records,
                    ))?;
                    ctx.audit(
                        AuditEntry::new("release_blocked", &ctx.node_id)
                            .job(job_id)
                            .details(json!({
                                "reason": reason,
                                "policy": release_policy.describe(),
                            })),
                    );
                    ctx.metrics.job_blocked();
                    info!(%job_id, %reason, "release blocked");
                }
            }
        }
    }

    Ok(())
}

/// Terminal writes may lose a race against the cancel path; a conflict
/// there means someone else already committed a terminal state.
fn commit_terminal(result: Result<Job, StoreError>) -> Result<(), StoreError> {
    match result {
        Ok(_) | Err(StoreError::Conflict { .. }) => Ok(()),
        Err(err) => Err(err),
    }
}

fn load_uploads(ctx: &WorkerContext, job: &Job) -> Result<Vec<UploadedFile>, Uuid> {
    let mut uploads = Vec::with_capacity(job.uploaded_file_ids.len());
    for file_id in &job.uploaded_file_ids {
        match ctx.store.get_upload(file_id) {
            Ok(Some(upload)) => uploads.push(upload),
            _ => return Err(*file_id),
        }
    }
    Ok(uploads)
}

/// What a cancel request resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was still queued; its row is now cancelled and the
    /// worker that eventually dequeues it will skip it.
    CancelledWhileQueued,
    /// A stop was signalled to the in-flight runner; the owning worker
    /// persists the cancelled state.
    StopRequested,
    /// The job had already reached a terminal state; nothing changed.
    AlreadyTerminal(JobStatus),
    NotFound,
}

/// Cancel a job. Idempotent: terminal jobs report their committed state
/// without mutation.
pub async fn cancel_job(ctx: &WorkerContext, job_id: Uuid) -> Result<CancelOutcome, StoreError> {
    let Some(job) = ctx.store.get_job(&job_id)? else {
        return Ok(CancelOutcome::NotFound);
    };

    let outcome = match job.status {
        status if status.is_terminal() => CancelOutcome::AlreadyTerminal(status),
        JobStatus::Queued => match ctx.store.set_cancelled(&job_id) {
            Ok(_) => {
                ctx.metrics.job_cancelled();
                CancelOutcome::CancelledWhileQueued
            }
            // Lost the race: a worker picked it up or another cancel won.
            Err(StoreError::Conflict { from, .. }) if from.is_terminal() => {
                CancelOutcome::AlreadyTerminal(from)
            }
            Err(StoreError::Conflict { .. }) => {
                ctx.runner.cancel(&job_id);
                CancelOutcome::StopRequested
            }
            Err(err) => return Err(err),
        },
        JobStatus::Running => {
            if ctx.runner.cancel(&job_id) {
                // The owning worker observes the signal and persists
                // the cancelled state (and counts it).
                CancelOutcome::StopRequested
            } else {
                // Not in the running map: either between set_running
                // and launch, or just finished. Try the row directly.
                match ctx.store.set_cancelled(&job_id) {
                    Ok(_) => {
                        ctx.metrics.job_cancelled();
                        CancelOutcome::CancelledWhileQueued
                    }
                    Err(StoreError::Conflict { from, .. }) => {
                        CancelOutcome::AlreadyTerminal(from)
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        _ => unreachable!("non-terminal, non-queued, non-running status"),
    };

    if !matches!(
        outcome,
        CancelOutcome::AlreadyTerminal(_) | CancelOutcome::NotFound
    ) {
        ctx.audit(AuditEntry::new("job_cancelled", &ctx.node_id).job(job_id));
    }

    Ok(outcome)
}

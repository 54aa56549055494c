//! Job rows: insert, conditional status transitions, listing, recovery.

use super::partitions::encode_job_key;
use super::{Result, Store, StoreError};
use crate::job::{Job, JobStatus};
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

impl Store {
    /// Insert a freshly admitted job row.
    pub fn insert_job(&self, job: &Job) -> Result<()> {
        let key = encode_job_key(&job.job_id);
        let value = serde_json::to_vec(job)?;
        self.jobs.insert(key, value)?;
        debug!(job_id = %job.job_id, "job row inserted");
        Ok(())
    }

    pub fn get_job(&self, job_id: &Uuid) -> Result<Option<Job>> {
        match self.jobs.get(encode_job_key(job_id))? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// List jobs newest-first, optionally filtered by status.
    pub fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for item in self.jobs.iter() {
            let (_, value) = item?;
            let job: Job = serde_json::from_slice(&value)?;
            if status.is_none_or(|s| job.status == s) {
                jobs.push(job);
            }
        }
        jobs.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        jobs.truncate(limit);
        Ok(jobs)
    }

    /// Jobs currently queued or running (discovery endpoints).
    pub fn count_jobs(&self) -> Result<(usize, usize)> {
        let mut total = 0;
        let mut active = 0;
        for item in self.jobs.iter() {
            let (_, value) = item?;
            let job: Job = serde_json::from_slice(&value)?;
            total += 1;
            if !job.status.is_terminal() {
                active += 1;
            }
        }
        Ok((total, active))
    }

    /// Apply one guarded status transition. The mutator only runs when
    /// the edge is legal; a violation returns `Conflict` without writing.
    fn transition(
        &self,
        job_id: &Uuid,
        to: JobStatus,
        mutate: impl FnOnce(&mut Job),
    ) -> Result<Job> {
        // The read, edge check, and write must be one atomic step:
        // otherwise a cancel racing the dequeuing worker could both
        // pass the guard and the last write would win without a
        // conflict.
        let _guard = self.row_lock.lock().unwrap();

        let mut job = self
            .get_job(job_id)?
            .ok_or(StoreError::JobNotFound(*job_id))?;

        if !job.status.can_transition(to) {
            return Err(StoreError::Conflict {
                job_id: *job_id,
                from: job.status,
                to,
            });
        }

        job.status = to;
        if to.is_terminal() {
            job.completed_at = Some(Utc::now());
        }
        mutate(&mut job);

        self.jobs
            .insert(encode_job_key(job_id), serde_json::to_vec(&job)?)?;
        debug!(job_id = %job_id, status = %to, "job transitioned");
        Ok(job)
    }

    pub fn set_running(&self, job_id: &Uuid) -> Result<Job> {
        self.transition(job_id, JobStatus::Running, |job| {
            job.started_at = Some(Utc::now());
        })
    }

    pub fn set_completed(
        &self,
        job_id: &Uuid,
        result_data: Value,
        execution_time_s: f64,
        memory_used_mb: Option<f64>,
        records_processed: Option<i64>,
    ) -> Result<Job> {
        self.transition(job_id, JobStatus::Completed, |job| {
            job.result_data = Some(result_data);
            job.execution_time_s = Some(execution_time_s);
            job.memory_used_mb = memory_used_mb;
            job.records_processed = records_processed;
            job.progress = 1.0;
        })
    }

    pub fn set_blocked(
        &self,
        job_id: &Uuid,
        redacted: Value,
        execution_time_s: f64,
        records_processed: Option<i64>,
    ) -> Result<Job> {
        self.transition(job_id, JobStatus::Blocked, |job| {
            job.result_data = Some(redacted);
            job.execution_time_s = Some(execution_time_s);
            job.records_processed = records_processed;
            job.progress = 1.0;
        })
    }

    pub fn set_failed(
        &self,
        job_id: &Uuid,
        error: &str,
        execution_time_s: Option<f64>,
    ) -> Result<Job> {
        self.transition(job_id, JobStatus::Failed, |job| {
            job.error_message = Some(error.to_string());
            job.execution_time_s = execution_time_s;
        })
    }

    pub fn set_cancelled(&self, job_id: &Uuid) -> Result<Job> {
        self.transition(job_id, JobStatus::Cancelled, |_| {})
    }

    /// Startup recovery: rows left `running` by a previous process of
    /// this executor become `failed`; `queued` rows are returned in
    /// submission order for re-enqueue.
    pub fn recover_interrupted(&self, executor_node_id: &str) -> Result<Vec<Uuid>> {
        let mut requeue = Vec::new();
        let mut stale = Vec::new();

        for item in self.jobs.iter() {
            let (_, value) = item?;
            let job: Job = serde_json::from_slice(&value)?;
            if job.executor_node_id != executor_node_id {
                continue;
            }
            match job.status {
                JobStatus::Running => stale.push(job.job_id),
                JobStatus::Queued => requeue.push((job.submitted_at, job.job_id)),
                _ => {}
            }
        }

        for job_id in stale {
            warn!(%job_id, "marking interrupted job as failed");
            self.set_failed(&job_id, "recovered after restart", None)?;
        }

        requeue.sort_by_key(|(submitted_at, _)| *submitted_at);
        Ok(requeue.into_iter().map(|(_, id)| id).collect())
    }
}

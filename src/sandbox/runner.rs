//! Backend selection and the single entry point workers call.

use super::container::ContainerBackend;
use super::subprocess::SubprocessBackend;
use super::{RunError, RunRequest, RunningJobs, SandboxBackend};
use crate::config::{ExecutionConfig, SandboxMode};
use crate::job::{Job, RunOutcome};
use crate::workspace::PreparedWorkspace;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub max_execution_time: Duration,
    pub images: HashMap<String, String>,
    pub data_root: PathBuf,
}

const FALLBACK_IMAGE: &str = "python:3.11-slim";

/// Executes staged workspaces under the backend chosen at startup and
/// tracks in-flight runs for cancellation.
pub struct Runner {
    backend: Box<dyn SandboxBackend>,
    settings: RunnerSettings,
    running: Arc<RunningJobs>,
}

impl Runner {
    /// Pick a backend. `Auto` probes the container runtime and degrades
    /// to subprocess execution when it is unreachable.
    pub async fn initialize(execution: &ExecutionConfig, data_root: PathBuf) -> Self {
        let backend: Box<dyn SandboxBackend> = match execution.backend {
            SandboxMode::Container => {
                if !ContainerBackend::probe().await {
                    warn!(
                        "container backend forced but runtime unreachable; jobs will fail to launch"
                    );
                }
                Box::new(Self::container_backend(execution))
            }
            SandboxMode::Subprocess => Box::new(SubprocessBackend),
            SandboxMode::Auto => {
                if ContainerBackend::probe().await {
                    Box::new(Self::container_backend(execution))
                } else {
                    warn!("container runtime unavailable, falling back to subprocess isolation");
                    Box::new(SubprocessBackend)
                }
            }
        };
        info!(backend = backend.name(), "sandbox runner initialized");

        Self {
            backend,
            settings: RunnerSettings {
                max_execution_time: Duration::from_secs(execution.max_execution_time_secs),
                images: execution.images.clone(),
                data_root,
            },
            running: Arc::new(RunningJobs::new()),
        }
    }

    fn container_backend(execution: &ExecutionConfig) -> ContainerBackend {
        ContainerBackend {
            max_memory_mb: execution.max_memory_mb,
            max_cpu_cores: execution.max_cpu_cores,
            cancel_grace_secs: execution.cancel_grace_secs,
        }
    }

    /// Run one staged job to an outcome. Registers the run for
    /// cancellation for its whole duration.
    pub async fn run(
        &self,
        job: &Job,
        workspace: &PreparedWorkspace,
    ) -> Result<RunOutcome, RunError> {
        let image = self
            .settings
            .images
            .get(job.script_kind.as_str())
            .map(String::as_str)
            .unwrap_or(FALLBACK_IMAGE);

        let request = RunRequest {
            job_id: job.job_id,
            kind: job.script_kind,
            image,
            workspace,
            data_root: &self.settings.data_root,
            timeout: self.settings.max_execution_time,
        };

        let mut cancel = self.running.register(job.job_id);
        let result = self.backend.run(request, &mut cancel).await;
        self.running.deregister(&job.job_id);
        result
    }

    /// Request a running job to stop; false when it is not in flight.
    pub fn cancel(&self, job_id: &Uuid) -> bool {
        self.running.cancel(job_id)
    }

    pub fn active_count(&self) -> usize {
        self.running.active_count()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }
}

/// Read `output.json` into the outcome. A missing or empty file is a
/// failure: the contract requires scripts to write their results there.
pub(crate) fn harvest_output(
    output_path: &Path,
    execution_time_s: f64,
    memory_used_mb: Option<f64>,
    logs: String,
) -> RunOutcome {
    let raw = std::fs::read(output_path).unwrap_or_default();
    if raw.is_empty() {
        return RunOutcome {
            success: false,
            data: None,
            error: Some("script produced no output.json".to_string()),
            execution_time_s,
            memory_used_mb,
            records_processed: None,
            logs,
        };
    }

    match serde_json::from_slice::<Value>(&raw) {
        Ok(data) => {
            let records_processed = data.get("sample_size").and_then(Value::as_i64);
            RunOutcome {
                success: true,
                data: Some(data),
                error: None,
                execution_time_s,
                memory_used_mb,
                records_processed,
                logs,
            }
        }
        Err(err) => RunOutcome {
            success: false,
            data: None,
            error: Some(format!("output.json is not valid JSON: {err}")),
            execution_time_s,
            memory_used_mb,
            records_processed: None,
            logs,
        },
    }
}

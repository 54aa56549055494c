//! Container backend.
//!
//! Each job gets a fresh container from the kind's configured image,
//! with the workspace mounted read-write at `/workspace`, the data root
//! read-only at `/data`, networking disabled, and memory/CPU capped.
//! The docker CLI is the interface to the runtime; memory usage is
//! polled through `docker stats` while the job runs.

use super::{RunError, RunRequest, SandboxBackend, truncate_log};
use crate::job::{RunOutcome, ScriptKind};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, warn};

const WORKSPACE_MOUNT: &str = "/workspace";
const DATA_MOUNT: &str = "/data";
const STATS_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct ContainerBackend {
    pub max_memory_mb: u64,
    pub max_cpu_cores: u32,
    pub cancel_grace_secs: u64,
}

impl ContainerBackend {
    /// Whether a docker daemon answers on this host.
    pub async fn probe() -> bool {
        Command::new("docker")
            .args(["version", "--format", "{{.Server.Version}}"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }

    /// Default in-container invocation per kind.
    fn container_argv(kind: ScriptKind, script_file: &str) -> Vec<String> {
        let script = format!("{WORKSPACE_MOUNT}/{script_file}");
        match kind {
            ScriptKind::Python => vec!["python".into(), script],
            ScriptKind::R => vec!["Rscript".into(), script],
            ScriptKind::Sql => vec!["psql".into(), "-f".into(), script],
            ScriptKind::Jupyter => vec![
                "jupyter".into(),
                "nbconvert".into(),
                "--execute".into(),
                script,
            ],
        }
    }

    /// Graceful stop within the configured window, then force-remove.
    async fn stop_container(&self, name: &str) {
        let _ = Command::new("docker")
            .args(["stop", "-t", &self.cancel_grace_secs.to_string(), name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        remove_container(name).await;
    }
}

#[async_trait]
impl SandboxBackend for ContainerBackend {
    fn name(&self) -> &'static str {
        "container"
    }

    async fn run(
        &self,
        request: RunRequest<'_>,
        cancel: &mut oneshot::Receiver<()>,
    ) -> Result<RunOutcome, RunError> {
        let RunRequest {
            job_id,
            kind,
            image,
            workspace,
            data_root,
            timeout,
        } = request;
        let name = format!("fednode-job-{job_id}");
        let min_cohort = workspace
            .env
            .iter()
            .find(|(key, _)| key == "MIN_COHORT_SIZE")
            .map(|(_, value)| value.clone())
            .unwrap_or_default();

        let mut command = Command::new("docker");
        command
            .arg("run")
            .args(["--name", &name])
            .args(["--network", "none"])
            .args(["--memory", &format!("{}m", self.max_memory_mb)])
            .args(["--cpus", &self.max_cpu_cores.to_string()])
            .args(["-v", &format!("{}:{WORKSPACE_MOUNT}:rw", workspace.dir.display())])
            .args(["-v", &format!("{}:{DATA_MOUNT}:ro", data_root.display())])
            .args(["-w", WORKSPACE_MOUNT])
            .args(["-e", &format!("DATA_ROOT={DATA_MOUNT}")])
            .args(["-e", &format!("JOB_CONFIG={WORKSPACE_MOUNT}/job_config.json")])
            .args(["-e", &format!("OUTPUT_FILE={WORKSPACE_MOUNT}/output.json")])
            .args(["-e", &format!("MIN_COHORT_SIZE={min_cohort}")])
            .args(["-e", &format!("PYTHONPATH={WORKSPACE_MOUNT}")])
            .arg(image)
            .args(Self::container_argv(kind, &workspace.script_file))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let mut child = command
            .spawn()
            .map_err(|source| RunError::Spawn { kind, source })?;

        let stdout = read_stream(child.stdout.take());
        let stderr = read_stream(child.stderr.take());

        let mut peak_memory_mb: Option<f64> = None;
        let mut stats_tick = tokio::time::interval(STATS_POLL_INTERVAL);
        stats_tick.tick().await; // first tick fires immediately

        // The container must be gone before the reader tasks are
        // awaited, or a runaway job would hold its pipes open.
        let waited = loop {
            tokio::select! {
                status = child.wait() => break Some(status?),
                _ = stats_tick.tick() => {
                    if let Some(used) = sample_memory_mb(&name).await {
                        peak_memory_mb = Some(peak_memory_mb.map_or(used, |peak: f64| peak.max(used)));
                    }
                }
                _ = tokio::time::sleep_until((started + timeout).into()) => {
                    warn!(%name, timeout_s = timeout.as_secs(), "container timed out");
                    self.stop_container(&name).await;
                    let _ = child.wait().await;
                    break None;
                }
                _ = &mut *cancel => {
                    debug!(%name, "stop requested, removing container");
                    self.stop_container(&name).await;
                    let _ = child.wait().await;
                    return Err(RunError::Cancelled);
                }
            }
        };

        let execution_time_s = started.elapsed().as_secs_f64();
        let (stdout, stderr) = (stdout.await.unwrap_or_default(), stderr.await.unwrap_or_default());
        let logs = truncate_log(format!("{stdout}{stderr}"));

        let Some(status) = waited else {
            return Ok(RunOutcome {
                success: false,
                data: None,
                error: Some(format!(
                    "execution timed out after {} seconds",
                    timeout.as_secs()
                )),
                execution_time_s,
                memory_used_mb: peak_memory_mb,
                records_processed: None,
                logs,
            });
        };

        remove_container(&name).await;

        if !status.success() {
            let excerpt = truncate_log(stderr);
            return Ok(RunOutcome {
                success: false,
                data: None,
                error: Some(format!("container exited with {status}; logs: {excerpt}")),
                execution_time_s,
                memory_used_mb: peak_memory_mb,
                records_processed: None,
                logs,
            });
        }

        Ok(super::runner::harvest_output(
            &workspace.output_path,
            execution_time_s,
            peak_memory_mb,
            logs,
        ))
    }
}

async fn remove_container(name: &str) {
    let _ = Command::new("docker")
        .args(["rm", "-f", name])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
}

/// One `docker stats` sample, parsed from `12.5MiB / 4GiB` into MB.
async fn sample_memory_mb(name: &str) -> Option<f64> {
    let output = Command::new("docker")
        .args(["stats", "--no-stream", "--format", "{{.MemUsage}}", name])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    parse_mem_usage(text.split('/').next()?.trim())
}

fn parse_mem_usage(value: &str) -> Option<f64> {
    let units: &[(&str, f64)] = &[
        ("GIB", 1024.0),
        ("GB", 1000.0),
        ("MIB", 1.0),
        ("MB", 1.0),
        ("KIB", 1.0 / 1024.0),
        ("KB", 1.0 / 1000.0),
        ("B", 1.0 / (1024.0 * 1024.0)),
    ];
    let upper = value.to_uppercase();
    for (suffix, factor) in units {
        if let Some(number) = upper.strip_suffix(suffix) {
            return number.trim().parse::<f64>().ok().map(|n| n * factor);
        }
    }
    None
}

fn read_stream<R>(stream: Option<R>) -> tokio::task::JoinHandle<String>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(mut stream) = stream {
            let _ = stream.read_to_string(&mut buf).await;
        }
        buf
    })
}

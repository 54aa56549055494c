//! Subprocess fallback backend.
//!
//! Used when no container runtime is reachable: the interpreter runs
//! directly on the host inside the workspace directory, with a minimal
//! environment plus the job environment. Wall-clock timeout is
//! enforced; there is no memory accounting in this mode.

use super::{RunError, RunRequest, SandboxBackend, truncate_log};
use crate::job::{RunOutcome, ScriptKind};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Environment variables inherited from the host besides the job's own.
const INHERITED_ENV: &[&str] = &["PATH", "HOME", "LANG", "LC_ALL", "TMPDIR"];

pub struct SubprocessBackend;

impl SubprocessBackend {
    /// Whether the interpreter for a kind exists on this host.
    pub async fn interpreter_available(kind: ScriptKind) -> bool {
        let (program, _) = kind.interpreter();
        Command::new(program)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

#[async_trait]
impl SandboxBackend for SubprocessBackend {
    fn name(&self) -> &'static str {
        "subprocess"
    }

    async fn run(
        &self,
        request: RunRequest<'_>,
        mut cancel: &mut oneshot::Receiver<()>,
    ) -> Result<RunOutcome, RunError> {
        let RunRequest {
            kind,
            workspace,
            timeout,
            ..
        } = request;

        if !Self::interpreter_available(kind).await {
            return Err(RunError::InterpreterMissing { kind });
        }

        let (program, args) = kind.interpreter();

        let mut command = Command::new(program);
        command
            .args(args)
            .arg(&workspace.script_file)
            .current_dir(&workspace.dir)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for key in INHERITED_ENV {
            if let Ok(value) = std::env::var(key) {
                command.env(key, value);
            }
        }
        for (key, value) in &workspace.env {
            command.env(key, value);
        }

        let started = Instant::now();
        let mut child = command.spawn().map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                RunError::InterpreterMissing { kind }
            } else {
                RunError::Spawn { kind, source }
            }
        })?;

        let stdout = read_stream(child.stdout.take());
        let stderr = read_stream(child.stderr.take());

        // The child must be dead before the reader tasks are awaited,
        // or a runaway script would hold its pipes open.
        let waited = tokio::select! {
            status = child.wait() => Some(status?),
            _ = tokio::time::sleep(timeout) => {
                warn!(timeout_s = timeout.as_secs(), "subprocess timed out");
                kill(&mut child).await;
                None
            }
            _ = &mut cancel => {
                debug!("stop requested, killing subprocess");
                kill(&mut child).await;
                return Err(RunError::Cancelled);
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
                memory_used_mb: None,
                records_processed: None,
                logs,
            });
        };

        if !status.success() {
            let excerpt = truncate_log(stderr);
            return Ok(RunOutcome {
                success: false,
                data: None,
                error: Some(format!(
                    "script exited with {status}; stderr: {excerpt}"
                )),
                execution_time_s,
                memory_used_mb: None,
                records_processed: None,
                logs,
            });
        }

        Ok(super::runner::harvest_output(
            &workspace.output_path,
            execution_time_s,
            None,
            logs,
        ))
    }
}

async fn kill(child: &mut Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
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

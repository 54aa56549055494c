//! Per-job workspace staging.
//!
//! Every job gets a fresh scratch directory under the configured work
//! root containing the user script, the data-access shim (for kinds
//! that use it), `job_config.json`, and a reserved `output.json`. The
//! runner executes inside this directory with the environment computed
//! here; nothing else on the host is visible to the script by
//! construction.

use crate::job::Job;
use crate::store::UploadedFile;
use serde_json::json;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// The shim staged next to Python scripts so `from data_loader import
/// load_data, save_results` works without path manipulation.
const DATA_LOADER_SHIM: &str = include_str!("sandbox/data_loader.py");

pub const JOB_CONFIG_FILE: &str = "job_config.json";
pub const OUTPUT_FILE: &str = "output.json";
pub const SHIM_FILE: &str = "data_loader.py";

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("workspace I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("job config serialization failed: {0}")]
    Config(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

/// A staged, ready-to-run workspace.
#[derive(Debug, Clone)]
pub struct PreparedWorkspace {
    pub dir: PathBuf,
    /// Script file name within `dir`, e.g. `script.py`.
    pub script_file: String,
    pub output_path: PathBuf,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct WorkspaceBuilder {
    work_dir: PathBuf,
    data_root: PathBuf,
}

impl WorkspaceBuilder {
    pub fn new(work_dir: impl Into<PathBuf>, data_root: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            data_root: data_root.into(),
        }
    }

    /// Stage the workspace for one job. `min_cohort_size` is the
    /// effective threshold (catalog override applied) surfaced to the
    /// script via the environment; `uploads` are the job's staged
    /// uploaded-file pointers.
    pub fn build(
        &self,
        job: &Job,
        min_cohort_size: i64,
        uploads: &[UploadedFile],
    ) -> Result<PreparedWorkspace> {
        let dir = self.work_dir.join(job.job_id.to_string());
        std::fs::create_dir_all(&dir).map_err(|source| WorkspaceError::Io {
            path: dir.clone(),
            source,
        })?;

        let script_file = format!("script.{}", job.script_kind.extension());
        write(&dir.join(&script_file), job.script_content.as_bytes())?;

        if job.script_kind.uses_shim() {
            write(&dir.join(SHIM_FILE), DATA_LOADER_SHIM.as_bytes())?;
        }

        let uploaded_files: Vec<_> = uploads
            .iter()
            .map(|u| {
                json!({
                    "file_id": u.file_id,
                    "original_name": u.original_name,
                    "path": u.stored_path,
                    "kind": u.kind,
                })
            })
            .collect();

        let config = json!({
            "job_id": job.job_id,
            "script_kind": job.script_kind,
            "parameters": job.parameters,
            "filters": job.filters,
            "catalog_id": job.catalog_id,
            "uploaded_file_ids": job.uploaded_file_ids,
            "uploaded_files": uploaded_files,
        });
        let config_path = dir.join(JOB_CONFIG_FILE);
        write(&config_path, serde_json::to_vec_pretty(&config)?.as_slice())?;

        // Reserved for the script; its absence after a run means no result.
        let output_path = dir.join(OUTPUT_FILE);
        write(&output_path, b"")?;

        let data_root = absolute(&self.data_root)?;
        let dir = absolute(&dir)?;
        let config_path = absolute(&config_path)?;
        let output_path = absolute(&output_path)?;

        let mut env = vec![
            ("DATA_ROOT".to_string(), path_str(&data_root)),
            ("JOB_CONFIG".to_string(), path_str(&config_path)),
            ("OUTPUT_FILE".to_string(), path_str(&output_path)),
            ("MIN_COHORT_SIZE".to_string(), min_cohort_size.to_string()),
        ];
        if job.script_kind.uses_shim() {
            env.push(("PYTHONPATH".to_string(), path_str(&dir)));
        }

        debug!(job_id = %job.job_id, dir = %dir.display(), "workspace staged");

        Ok(PreparedWorkspace {
            dir,
            script_file,
            output_path,
            env,
        })
    }
}

fn write(path: &Path, content: &[u8]) -> Result<()> {
    std::fs::write(path, content).map_err(|source| WorkspaceError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).map_err(|source| WorkspaceError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

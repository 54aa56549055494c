use crate::humanize::ByteSize;
use crate::job::ScriptKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub privacy: PrivacyConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

/// Node identity broadcast in discovery
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default = "default_node_name")]
    pub node_name: String,
    #[serde(default = "default_institution")]
    pub institution: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            node_name: default_node_name(),
            institution: default_institution(),
        }
    }
}

fn default_node_id() -> String {
    "default-node".to_string()
}

fn default_node_name() -> String {
    "Default Node".to_string()
}

fn default_institution() -> String {
    "Default Institution".to_string()
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            store_path: default_store_path(),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    "0.0.0.0:8080".parse().unwrap()
}

fn default_store_path() -> PathBuf {
    PathBuf::from("data/store")
}

/// Filesystem layout: where datasets, workspaces and uploads live
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DataConfig {
    /// Root for all catalog file paths; paths escaping it are rejected.
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,
    /// Catalog manifest; relative paths resolve under `data_root`.
    #[serde(default = "default_manifest_path")]
    pub manifest_path: PathBuf,
    /// Parent of per-job workspaces.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Where uploaded script/data blobs are stored.
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: PathBuf,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: ByteSize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            manifest_path: default_manifest_path(),
            work_dir: default_work_dir(),
            uploads_dir: default_uploads_dir(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

fn default_data_root() -> PathBuf {
    PathBuf::from("data")
}

fn default_manifest_path() -> PathBuf {
    PathBuf::from("data_manifest.json")
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("work")
}

fn default_uploads_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_max_upload_bytes() -> ByteSize {
    ByteSize(100 * 1024 * 1024) // 100 MB
}

/// Sandbox backend selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxMode {
    /// Container when the runtime is reachable, subprocess otherwise.
    #[default]
    Auto,
    Container,
    Subprocess,
}

/// Execution limits and worker-pool sizing
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub backend: SandboxMode,
    /// Hard wall-clock limit per job, in seconds.
    #[serde(default = "default_max_execution_time_secs")]
    pub max_execution_time_secs: u64,
    /// Container memory cap; advisory in subprocess mode.
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,
    #[serde(default = "default_max_cpu_cores")]
    pub max_cpu_cores: u32,
    /// Script kinds admission accepts.
    #[serde(default = "default_allowed_script_kinds")]
    pub allowed_script_kinds: Vec<ScriptKind>,
    #[serde(default = "default_max_script_bytes")]
    pub max_script_bytes: ByteSize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Container image per script kind.
    #[serde(default = "default_images")]
    pub images: HashMap<String, String>,
    /// Grace window between a stop request and a forced kill, in seconds.
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            backend: SandboxMode::default(),
            max_execution_time_secs: default_max_execution_time_secs(),
            max_memory_mb: default_max_memory_mb(),
            max_cpu_cores: default_max_cpu_cores(),
            allowed_script_kinds: default_allowed_script_kinds(),
            max_script_bytes: default_max_script_bytes(),
            queue_capacity: default_queue_capacity(),
            worker_count: default_worker_count(),
            images: default_images(),
            cancel_grace_secs: default_cancel_grace_secs(),
        }
    }
}

fn default_max_execution_time_secs() -> u64 {
    3600
}

fn default_max_memory_mb() -> u64 {
    4096
}

fn default_max_cpu_cores() -> u32 {
    4
}

fn default_allowed_script_kinds() -> Vec<ScriptKind> {
    vec![ScriptKind::Python, ScriptKind::R]
}

fn default_max_script_bytes() -> ByteSize {
    ByteSize(256 * 1024) // 256 KB
}

fn default_queue_capacity() -> usize {
    64
}

fn default_worker_count() -> usize {
    2
}

fn default_images() -> HashMap<String, String> {
    let mut images = HashMap::new();
    images.insert("python".to_string(), "python:3.11-slim".to_string());
    images.insert("r".to_string(), "r-base:4.3.2".to_string());
    images.insert("sql".to_string(), "postgres:13".to_string());
    images.insert(
        "jupyter".to_string(),
        "jupyter/scipy-notebook:latest".to_string(),
    );
    images
}

fn default_cancel_grace_secs() -> u64 {
    10
}

/// Release-gate policy knobs
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PrivacyConfig {
    /// Node-wide minimum cohort size; a catalog may override it for its
    /// own jobs.
    #[serde(default = "default_min_cohort_size")]
    pub min_cohort_size: i64,
    /// Decimal places kept on released floats.
    #[serde(default = "default_result_precision")]
    pub result_precision: u32,
    #[serde(default)]
    pub enable_noise: bool,
    #[serde(default = "default_noise_epsilon")]
    pub noise_epsilon: f64,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            min_cohort_size: default_min_cohort_size(),
            result_precision: default_result_precision(),
            enable_noise: false,
            noise_epsilon: default_noise_epsilon(),
        }
    }
}

fn default_min_cohort_size() -> i64 {
    10
}

fn default_result_precision() -> u32 {
    3
}

fn default_noise_epsilon() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_enabled")]
    pub enabled: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: default_audit_enabled(),
        }
    }
}

fn default_audit_enabled() -> bool {
    true
}

impl Config {
    /// Manifest path resolved against `data_root` when relative.
    pub fn manifest_path(&self) -> PathBuf {
        if self.data.manifest_path.is_absolute() {
            self.data.manifest_path.clone()
        } else {
            self.data.data_root.join(&self.data.manifest_path)
        }
    }
}

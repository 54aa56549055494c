//! Catalog manifest resolution
//!
//! A node publishes its datasets through a declarative JSON manifest:
//! `{ "catalogs": [ { id, name, description, data_type, privacy_level,
//! min_cohort_size?, files: [ { name, path, type, columns?,
//! record_count? } ], metadata? } ] }`.
//!
//! The resolver loads the manifest on demand, confines every file path
//! to the configured data root, and fills in what the manifest leaves
//! out: column kinds inferred from the first data chunk of tabular
//! files, and record counts from row counting. Files that cannot be
//! opened are marked `exists = false` and contribute nothing.

mod columns;

pub use columns::{count_rows, infer_columns};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog not found: {0}")]
    NotFound(String),

    #[error("manifest unreadable at {path}: {source}")]
    ManifestIo {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("manifest malformed: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("path escapes data root: {0}")]
    PathEscape(PathBuf),
}

pub type Result<T> = std::result::Result<T, CatalogError>;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Manifest {
    #[serde(default)]
    pub catalogs: Vec<CatalogDescriptor>,
}

/// One published dataset: a named, typed collection of data files.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CatalogDescriptor {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_data_type")]
    pub data_type: String,
    #[serde(default = "default_privacy_level")]
    pub privacy_level: String,
    /// Overrides the node-wide cohort threshold when present.
    #[serde(default)]
    pub min_cohort_size: Option<i64>,
    #[serde(default)]
    pub files: Vec<FileDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

fn default_data_type() -> String {
    "tabular".to_string()
}

fn default_privacy_level() -> String {
    "private".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileDescriptor {
    /// Logical name user scripts address the file by; unique per catalog.
    pub name: String,
    /// Manifest-relative path, resolved under the data root.
    pub path: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub columns: Option<Vec<ColumnInfo>>,
    #[serde(default)]
    pub record_count: Option<i64>,
    #[serde(default = "default_exists")]
    pub exists: bool,
}

fn default_exists() -> bool {
    true
}

impl FileDescriptor {
    pub fn is_tabular(&self) -> bool {
        matches!(self.kind.as_str(), "csv" | "tsv")
    }

    fn delimiter(&self) -> char {
        if self.kind == "tsv" { '\t' } else { ',' }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ColumnKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    Int,
    Float,
    Bool,
    Datetime,
    String,
}

impl CatalogDescriptor {
    /// Catalog override wins over the node default.
    pub fn effective_min_cohort_size(&self, node_default: i64) -> i64 {
        self.min_cohort_size.unwrap_or(node_default)
    }

    /// Row count of the first tabular file that has one; the fallback
    /// cohort size when a script result carries no `sample_size`.
    pub fn first_tabular_record_count(&self) -> Option<i64> {
        self.files
            .iter()
            .find(|f| f.is_tabular() && f.exists)
            .and_then(|f| f.record_count)
    }
}

/// Loads the manifest on demand and resolves catalog keys to enriched
/// descriptors.
#[derive(Debug, Clone)]
pub struct ManifestResolver {
    manifest_path: PathBuf,
    data_root: PathBuf,
}

impl ManifestResolver {
    pub fn new(manifest_path: impl Into<PathBuf>, data_root: impl Into<PathBuf>) -> Self {
        Self {
            manifest_path: manifest_path.into(),
            data_root: data_root.into(),
        }
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    /// Load and enrich every catalog in the manifest.
    pub fn load(&self) -> Result<Vec<CatalogDescriptor>> {
        let raw =
            std::fs::read_to_string(&self.manifest_path).map_err(|source| {
                CatalogError::ManifestIo {
                    path: self.manifest_path.clone(),
                    source,
                }
            })?;
        let manifest: Manifest = serde_json::from_str(&raw)?;

        let mut catalogs = manifest.catalogs;
        for catalog in &mut catalogs {
            for file in &mut catalog.files {
                self.enrich_file(&catalog.id, file);
            }
        }
        Ok(catalogs)
    }

    /// Resolve a catalog by id or, failing that, by name.
    pub fn resolve(&self, key: &str) -> Result<CatalogDescriptor> {
        let catalogs = self.load()?;
        catalogs
            .iter()
            .find(|c| c.id == key)
            .or_else(|| catalogs.iter().find(|c| c.name == key))
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(key.to_string()))
    }

    /// Resolve a manifest-relative file path under the data root,
    /// rejecting `..` traversal and absolute paths that leave it.
    pub fn resolve_path(&self, relative: &str) -> Result<PathBuf> {
        let candidate = Path::new(relative);
        if candidate
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(CatalogError::PathEscape(candidate.to_path_buf()));
        }
        let full = if candidate.is_absolute() {
            if !candidate.starts_with(&self.data_root) {
                return Err(CatalogError::PathEscape(candidate.to_path_buf()));
            }
            candidate.to_path_buf()
        } else {
            self.data_root.join(candidate)
        };
        Ok(full)
    }

    fn enrich_file(&self, catalog_id: &str, file: &mut FileDescriptor) {
        let path = match self.resolve_path(&file.path) {
            Ok(path) => path,
            Err(err) => {
                warn!(catalog_id, file = %file.name, %err, "rejecting catalog file path");
                file.exists = false;
                return;
            }
        };

        if !path.is_file() {
            file.exists = false;
            return;
        }
        file.exists = true;

        if !file.is_tabular() {
            return;
        }

        if file.columns.is_none() {
            match infer_columns(&path, file.delimiter()) {
                Ok(columns) => {
                    debug!(catalog_id, file = %file.name, n = columns.len(), "inferred columns");
                    file.columns = Some(columns);
                }
                Err(err) => {
                    warn!(catalog_id, file = %file.name, %err, "column inference failed");
                    file.exists = false;
                    return;
                }
            }
        }

        if file.record_count.is_none() {
            match count_rows(&path) {
                Ok(count) => file.record_count = Some(count),
                Err(err) => {
                    warn!(catalog_id, file = %file.name, %err, "record count failed");
                }
            }
        }
    }
}

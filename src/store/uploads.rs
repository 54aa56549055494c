//! Uploaded-file metadata. The blobs themselves live in the uploads
//! directory; rows here are immutable once written.

use super::partitions::encode_upload_key;
use super::{Result, Store};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadedFile {
    pub file_id: Uuid,
    pub original_name: String,
    pub stored_path: String,
    /// Normalized extension from the allow-list, e.g. `csv` or `nii.gz`.
    pub kind: String,
    pub size_bytes: u64,
    pub uploaded_at: DateTime<Utc>,
}

impl Store {
    pub fn insert_upload(&self, upload: &UploadedFile) -> Result<()> {
        self.uploads.insert(
            encode_upload_key(&upload.file_id),
            serde_json::to_vec(upload)?,
        )?;
        Ok(())
    }

    pub fn get_upload(&self, file_id: &Uuid) -> Result<Option<UploadedFile>> {
        match self.uploads.get(encode_upload_key(file_id))? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    pub fn list_uploads(&self) -> Result<Vec<UploadedFile>> {
        let mut uploads = Vec::new();
        for item in self.uploads.iter() {
            let (_, value) = item?;
            uploads.push(serde_json::from_slice(&value)?);
        }
        Ok(uploads)
    }
}

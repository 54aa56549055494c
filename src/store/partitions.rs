/// Key layout and encoding utilities for fjall partitions
///
/// Partition structure:
/// - `jobs`: job:{job_id} -> Job (JSON); v7 ids keep keys time-ordered
/// - `audit`: audit:{seq:020} -> AuditEntry (JSON)
/// - `uploads`: upload:{file_id} -> UploadedFile (JSON)
/// - `requests`: request:{request_id} -> AnalysisRequest (JSON)
/// - `nodes`: node:{node_id} -> NodeRecord (JSON)
/// - `meta`: meta:{key} -> value (string)
use uuid::Uuid;

pub fn encode_job_key(job_id: &Uuid) -> Vec<u8> {
    format!("job:{job_id}").into_bytes()
}

pub fn encode_audit_key(seq: u64) -> Vec<u8> {
    format!("audit:{seq:020}").into_bytes()
}

pub fn encode_upload_key(file_id: &Uuid) -> Vec<u8> {
    format!("upload:{file_id}").into_bytes()
}

pub fn encode_request_key(request_id: &Uuid) -> Vec<u8> {
    format!("request:{request_id}").into_bytes()
}

pub fn encode_node_key(node_id: &str) -> Vec<u8> {
    format!("node:{node_id}").into_bytes()
}

pub fn encode_meta_key(key: &str) -> Vec<u8> {
    format!("meta:{key}").into_bytes()
}

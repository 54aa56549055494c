//! Analysis requests: the human-readable approval workflow upstream of
//! job admission. Approval is the only edge that touches the core: it
//! admits a job carrying `analysis_request_id`; nothing on the job ever
//! mutates the request back.

use super::partitions::encode_request_key;
use super::{Result, Store, StoreError};
use crate::job::ScriptKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Approved => "approved",
            RequestStatus::Denied => "denied",
            RequestStatus::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub request_id: Uuid,
    pub requester_name: String,
    pub requester_institution: String,
    pub requester_email: String,
    pub requester_affiliation: Option<String>,
    pub analysis_title: String,
    pub analysis_description: String,
    pub target_node_id: String,
    pub data_catalog: String,
    pub script_kind: ScriptKind,
    pub script_content: String,
    pub parameters: Value,
    pub filters: Value,
    pub priority: String,
    pub status: RequestStatus,
    pub approved_by: Option<String>,
    pub approval_notes: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAnalysisRequest {
    pub requester_name: String,
    pub requester_institution: String,
    pub requester_email: String,
    pub requester_affiliation: Option<String>,
    pub analysis_title: String,
    pub analysis_description: String,
    pub target_node_id: String,
    pub data_catalog: String,
    pub script_kind: ScriptKind,
    pub script_content: String,
    pub parameters: Value,
    pub filters: Value,
    pub priority: String,
}

impl AnalysisRequest {
    pub fn new(new: NewAnalysisRequest) -> Self {
        Self {
            request_id: Uuid::now_v7(),
            requester_name: new.requester_name,
            requester_institution: new.requester_institution,
            requester_email: new.requester_email,
            requester_affiliation: new.requester_affiliation,
            analysis_title: new.analysis_title,
            analysis_description: new.analysis_description,
            target_node_id: new.target_node_id,
            data_catalog: new.data_catalog,
            script_kind: new.script_kind,
            script_content: new.script_content,
            parameters: new.parameters,
            filters: new.filters,
            priority: new.priority,
            status: RequestStatus::Pending,
            approved_by: None,
            approval_notes: None,
            approved_at: None,
            expires_at: None,
            submitted_at: Utc::now(),
        }
    }
}

impl Store {
    pub fn insert_request(&self, request: &AnalysisRequest) -> Result<()> {
        self.requests.insert(
            encode_request_key(&request.request_id),
            serde_json::to_vec(request)?,
        )?;
        Ok(())
    }

    pub fn get_request(&self, request_id: &Uuid) -> Result<Option<AnalysisRequest>> {
        match self.requests.get(encode_request_key(request_id))? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    pub fn list_requests(&self, status: Option<RequestStatus>) -> Result<Vec<AnalysisRequest>> {
        let mut requests: Vec<AnalysisRequest> = Vec::new();
        for item in self.requests.iter() {
            let (_, value) = item?;
            let request: AnalysisRequest = serde_json::from_slice(&value)?;
            if status.is_none_or(|s| request.status == s) {
                requests.push(request);
            }
        }
        requests.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        Ok(requests)
    }

    /// Move a pending request to `approved` or `denied`. Anything else
    /// is a conflict; requests never leave a decided state.
    pub fn decide_request(
        &self,
        request_id: &Uuid,
        status: RequestStatus,
        decided_by: &str,
        notes: Option<String>,
    ) -> Result<AnalysisRequest> {
        // Same read-check-write shape as job transitions; two racing
        // approvals must not both pass the pending check.
        let _guard = self.row_lock.lock().unwrap();

        let mut request = self
            .get_request(request_id)?
            .ok_or(StoreError::RequestNotFound(*request_id))?;

        if request.status != RequestStatus::Pending {
            return Err(StoreError::RequestNotPending {
                request_id: *request_id,
                status: request.status.as_str().to_string(),
            });
        }

        request.status = status;
        request.approved_by = Some(decided_by.to_string());
        request.approval_notes = notes;
        request.approved_at = Some(Utc::now());

        self.requests.insert(
            encode_request_key(request_id),
            serde_json::to_vec(&request)?,
        )?;
        Ok(request)
    }
}

//! Operator request model.
//!
//! Ops requests are the single source of truth for operator intent. They
//! are appended by external callers and state-transitioned only by the
//! applier: `queued → applied` or `queued → failed`, never backward.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of operator request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestType {
    Stop,
    Pause,
    Resume,
    ReleaseLease,
    ResetDoc,
    ResetWorkspace,
    ClearStages,
    Run,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "STOP",
            Self::Pause => "PAUSE",
            Self::Resume => "RESUME",
            Self::ReleaseLease => "RELEASE_LEASE",
            Self::ResetDoc => "RESET_DOC",
            Self::ResetWorkspace => "RESET_WORKSPACE",
            Self::ClearStages => "CLEAR_STAGES",
            Self::Run => "RUN",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "STOP" => Some(Self::Stop),
            "PAUSE" => Some(Self::Pause),
            "RESUME" => Some(Self::Resume),
            "RELEASE_LEASE" => Some(Self::ReleaseLease),
            "RESET_DOC" => Some(Self::ResetDoc),
            "RESET_WORKSPACE" => Some(Self::ResetWorkspace),
            "CLEAR_STAGES" => Some(Self::ClearStages),
            "RUN" => Some(Self::Run),
            _ => None,
        }
    }
}

/// Scope a request applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeType {
    Global,
    Workspace,
    Document,
}

impl ScopeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Workspace => "workspace",
            Self::Document => "document",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "global" => Some(Self::Global),
            "workspace" => Some(Self::Workspace),
            "document" => Some(Self::Document),
            _ => None,
        }
    }
}

/// Lifecycle status of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Queued,
    Applied,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Applied => "applied",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "applied" => Some(Self::Applied),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Payload of a RUN request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_items: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
}

/// A persisted operator intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpsRequest {
    pub request_id: String,
    pub request_type: RequestType,
    pub scope_type: ScopeType,
    /// Workspace name or document id, depending on scope.
    pub scope_id: Option<String>,
    pub status: RequestStatus,
    pub payload: Option<serde_json::Value>,
    pub requested_by: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
}

impl OpsRequest {
    /// Create a new queued request.
    pub fn new(
        request_type: RequestType,
        scope_type: ScopeType,
        scope_id: Option<String>,
        payload: Option<serde_json::Value>,
        requested_by: Option<String>,
    ) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            request_type,
            scope_type,
            scope_id,
            status: RequestStatus::Queued,
            payload,
            requested_by,
            failure_reason: None,
            created_at: Utc::now(),
            applied_at: None,
        }
    }

    /// Global request without scope id.
    pub fn global(request_type: RequestType, requested_by: Option<String>) -> Self {
        Self::new(request_type, ScopeType::Global, None, None, requested_by)
    }

    /// Workspace-scoped request.
    pub fn for_workspace(
        request_type: RequestType,
        workspace: &str,
        requested_by: Option<String>,
    ) -> Self {
        Self::new(
            request_type,
            ScopeType::Workspace,
            Some(workspace.to_string()),
            None,
            requested_by,
        )
    }

    /// Document-scoped request.
    pub fn for_document(
        request_type: RequestType,
        doc_id: &str,
        requested_by: Option<String>,
    ) -> Self {
        Self::new(
            request_type,
            ScopeType::Document,
            Some(doc_id.to_string()),
            None,
            requested_by,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_type_roundtrip() {
        for t in [
            RequestType::Stop,
            RequestType::Pause,
            RequestType::Resume,
            RequestType::ReleaseLease,
            RequestType::ResetDoc,
            RequestType::ResetWorkspace,
            RequestType::ClearStages,
            RequestType::Run,
        ] {
            assert_eq!(RequestType::from_str(t.as_str()), Some(t));
        }
        assert_eq!(RequestType::from_str("NOPE"), None);
    }

    #[test]
    fn test_scope_roundtrip() {
        for s in [ScopeType::Global, ScopeType::Workspace, ScopeType::Document] {
            assert_eq!(ScopeType::from_str(s.as_str()), Some(s));
        }
    }

    #[test]
    fn test_new_request_is_queued() {
        let req = OpsRequest::global(RequestType::Stop, Some("admin".to_string()));
        assert_eq!(req.status, RequestStatus::Queued);
        assert!(req.applied_at.is_none());
        assert_eq!(req.scope_type, ScopeType::Global);
    }

    #[test]
    fn test_run_payload_parses_partial() {
        let payload: RunPayload = serde_json::from_str(r#"{"max_items": 5}"#).unwrap();
        assert_eq!(payload.max_items, Some(5));
        assert!(payload.workspace.is_none());
        assert!(payload.doc_id.is_none());
    }
}

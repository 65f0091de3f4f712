use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ApplicationStatus, ApplicationToken, ChatRole, DocumentId, SessionId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurnRequest {
    pub message: String,
    pub session_id: SessionId,
}

/// Full affordance state: which action buttons the chat view offers.
/// Every field is required; this is the stored form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffordanceFlags {
    pub show_form_button: bool,
    pub show_upload_button: bool,
    pub show_update_button: bool,
    pub show_cancel_button: bool,
}

/// Partial affordance update. A field that is `None` leaves the stored value
/// unchanged; only `Some` fields are applied. Distinct from [`AffordanceFlags`]
/// so "not mentioned" and "explicitly false" cannot be conflated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffordancePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_form_button: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_upload_button: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_update_button: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_cancel_button: Option<bool>,
}

impl AffordanceFlags {
    pub fn apply(&mut self, patch: &AffordancePatch) {
        if let Some(v) = patch.show_form_button {
            self.show_form_button = v;
        }
        if let Some(v) = patch.show_upload_button {
            self.show_upload_button = v;
        }
        if let Some(v) = patch.show_update_button {
            self.show_update_button = v;
        }
        if let Some(v) = patch.show_cancel_button {
            self.show_cancel_button = v;
        }
    }

    /// The wire form of the full state: a patch mentioning every flag.
    pub fn into_patch(self) -> AffordancePatch {
        AffordancePatch {
            show_form_button: Some(self.show_form_button),
            show_upload_button: Some(self.show_upload_button),
            show_update_button: Some(self.show_update_button),
            show_cancel_button: Some(self.show_cancel_button),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurnResponse {
    pub response: String,
    #[serde(flatten)]
    pub flags: AffordancePatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatHistoryResponse {
    pub history: Vec<ChatMessage>,
    #[serde(flatten)]
    pub flags: AffordancePatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationSubmitResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_id: Option<ApplicationToken>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentDescriptor {
    pub id: DocumentId,
    pub name: String,
    pub storage_path: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentUploadResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<DocumentDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentListResponse {
    pub documents: Vec<DocumentDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationSummary {
    pub application_id: ApplicationToken,
    pub status: ApplicationStatus,
    pub created_at: DateTime<Utc>,
}

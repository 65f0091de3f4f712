use chrono::Utc;

use shared::{
    domain::{ApplicationToken, ChatRole, SessionId},
    protocol::{AffordanceFlags, AffordancePatch, ChatMessage},
};

/// Which of the four view regions is rendered. Exactly one is active; every
/// transition is immediate and lossy for unsaved state in the view being left.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum View {
    #[default]
    Chat,
    ApplicationForm,
    DocumentUpload,
    Results,
}

/// Session-scoped client state shared by all views. Views never mutate each
/// other; everything goes through these operations. The container is plain
/// data so tests (and alternative shells) can construct it directly.
#[derive(Debug, Clone)]
pub struct SessionState {
    session_id: SessionId,
    upload_token: Option<ApplicationToken>,
    application_id: Option<ApplicationToken>,
    transcript: Vec<ChatMessage>,
    view: View,
    flags: AffordanceFlags,
    loading: bool,
}

impl SessionState {
    /// Fresh state with a generated session identifier.
    pub fn new() -> Self {
        Self::with_session_id(SessionId::new(format!(
            "session_{}",
            Utc::now().timestamp_millis()
        )))
    }

    pub fn with_session_id(session_id: SessionId) -> Self {
        Self {
            session_id,
            upload_token: None,
            application_id: None,
            transcript: Vec::new(),
            view: View::default(),
            flags: AffordanceFlags::default(),
            loading: false,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn upload_token(&self) -> Option<&ApplicationToken> {
        self.upload_token.as_ref()
    }

    pub fn application_id(&self) -> Option<&ApplicationToken> {
        self.application_id.as_ref()
    }

    pub fn transcript(&self) -> &[ChatMessage] {
        &self.transcript
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn flags(&self) -> AffordanceFlags {
        self.flags
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    /// Token used for document operations: the upload token when set and
    /// non-empty, the session identifier otherwise. Derived on every call;
    /// callers must not cache it across mutations.
    pub fn effective_token(&self) -> &str {
        match &self.upload_token {
            Some(token) if !token.as_str().is_empty() => token.as_str(),
            _ => self.session_id.as_str(),
        }
    }

    pub fn set_view(&mut self, view: View) {
        self.view = view;
    }

    pub fn set_session_id(&mut self, session_id: SessionId) {
        self.session_id = session_id;
    }

    pub fn set_upload_token(&mut self, token: Option<ApplicationToken>) {
        self.upload_token = token;
    }

    pub fn set_application_id(&mut self, application_id: Option<ApplicationToken>) {
        self.application_id = application_id;
    }

    /// Appends to the transcript. Never deduplicates, never reorders, never
    /// caps length.
    pub fn append_message(&mut self, role: ChatRole, content: impl Into<String>) {
        self.transcript.push(ChatMessage::new(role, content));
    }

    /// Wholesale replacement used when hydrating from the backend. Local
    /// messages that were never persisted do not survive this call.
    pub fn replace_history(&mut self, messages: Vec<ChatMessage>) {
        self.transcript = messages;
    }

    /// Merge update: flags absent from the patch keep their current value.
    pub fn apply_flags(&mut self, patch: &AffordancePatch) {
        self.flags.apply(patch);
    }

    pub fn set_loading(&mut self, loading: bool) {
        self.loading = loading;
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

use std::sync::Arc;

use reqwest::Client;
use serde::de::DeserializeOwned;
use shared::{
    domain::{ApplicationToken, ChatRole, DocumentId},
    error::ApiError,
    protocol::{
        AffordanceFlags, AffordancePatch, ApplicationSubmitResponse, ApplicationSummary,
        ChatHistoryResponse, ChatMessage, ChatTurnRequest, ChatTurnResponse, DocumentDescriptor,
        DocumentListResponse, DocumentUploadResponse,
    },
};
use tokio::sync::{broadcast, Mutex};
use tracing::debug;
use url::Url;

pub mod error;
pub mod session;

pub use error::{ClientError, ErrorCategory};
pub use session::{SessionState, View};

/// State-change notifications for shells that render from events rather than
/// polling snapshots.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    ViewChanged(View),
    ReplyReceived { message: ChatMessage },
    TranscriptReplaced { message_count: usize },
    FlagsUpdated(AffordanceFlags),
    ApplicationSubmitted { application_id: ApplicationToken },
    UploadTokenVerified { token: ApplicationToken },
    DocumentStored { document: DocumentDescriptor },
    DocumentDeleted { document_id: DocumentId },
    ApplicationCancelled { token: ApplicationToken },
    Error(String),
}

/// Async client around the session state container: owns the single mutable
/// copy of [`SessionState`], performs the backend requests, and keeps the
/// loading flag honest on success and error paths alike.
pub struct IntakeClient {
    http: Client,
    server_url: String,
    inner: Mutex<SessionState>,
    events: broadcast::Sender<ClientEvent>,
}

impl IntakeClient {
    pub fn new(server_url: impl Into<String>) -> Result<Arc<Self>, ClientError> {
        Self::with_state(server_url, SessionState::new())
    }

    pub fn with_state(
        server_url: impl Into<String>,
        state: SessionState,
    ) -> Result<Arc<Self>, ClientError> {
        let server_url = server_url.into();
        let parsed = Url::parse(&server_url)
            .map_err(|error| ClientError::InvalidServerUrl(format!("{server_url}: {error}")))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(ClientError::InvalidServerUrl(format!(
                "{server_url}: expected an http or https url"
            )));
        }

        let (events, _) = broadcast::channel(256);
        Ok(Arc::new(Self {
            http: Client::new(),
            server_url: server_url.trim_end_matches('/').to_string(),
            inner: Mutex::new(state),
            events,
        }))
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Point-in-time copy of the session state for rendering.
    pub async fn snapshot(&self) -> SessionState {
        self.inner.lock().await.clone()
    }

    pub async fn set_view(&self, view: View) {
        self.inner.lock().await.set_view(view);
        let _ = self.events.send(ClientEvent::ViewChanged(view));
    }

    /// Explicit reset of the upload token; document operations fall back to
    /// the session identifier from the next call on.
    pub async fn clear_upload_token(&self) {
        self.inner.lock().await.set_upload_token(None);
    }

    /// Local affordance update from a view action; merge semantics identical
    /// to server-driven patches.
    pub async fn apply_flags(&self, patch: &AffordancePatch) {
        let flags = {
            let mut inner = self.inner.lock().await;
            inner.apply_flags(patch);
            inner.flags()
        };
        let _ = self.events.send(ClientEvent::FlagsUpdated(flags));
    }

    pub async fn effective_token(&self) -> String {
        self.inner.lock().await.effective_token().to_string()
    }

    pub async fn send_chat_message(&self, text: &str) -> Result<ChatMessage, ClientError> {
        self.begin_request().await?;
        let result = self.send_chat_message_inner(text).await;
        self.finish_request().await;
        self.report(&result);
        result
    }

    pub async fn refresh_history(&self) -> Result<usize, ClientError> {
        self.begin_request().await?;
        let result = self.refresh_history_inner().await;
        self.finish_request().await;
        self.report(&result);
        result
    }

    pub async fn submit_application(
        &self,
        fields: &[(String, String)],
    ) -> Result<ApplicationSubmitResponse, ClientError> {
        self.begin_request().await?;
        let result = self.submit_application_inner(fields).await;
        self.finish_request().await;
        self.report(&result);
        result
    }

    pub async fn verify_token(&self, raw_token: &str) -> Result<ApplicationSummary, ClientError> {
        self.begin_request().await?;
        let result = self.verify_token_inner(raw_token).await;
        self.finish_request().await;
        self.report(&result);
        result
    }

    pub async fn upload_document(
        &self,
        filename: &str,
        content_type: Option<&str>,
        content: Vec<u8>,
    ) -> Result<DocumentUploadResponse, ClientError> {
        self.begin_request().await?;
        let result = self
            .upload_document_inner(filename, content_type, content)
            .await;
        self.finish_request().await;
        self.report(&result);
        result
    }

    pub async fn list_documents(&self) -> Result<Vec<DocumentDescriptor>, ClientError> {
        self.begin_request().await?;
        let result = self.list_documents_inner().await;
        self.finish_request().await;
        self.report(&result);
        result
    }

    pub async fn delete_document(&self, document_id: &DocumentId) -> Result<(), ClientError> {
        self.begin_request().await?;
        let result = self.delete_document_inner(document_id).await;
        self.finish_request().await;
        self.report(&result);
        result
    }

    pub async fn cancel_application(&self) -> Result<ApplicationToken, ClientError> {
        self.begin_request().await?;
        let result = self.cancel_application_inner().await;
        self.finish_request().await;
        self.report(&result);
        result
    }

    pub async fn fetch_application(
        &self,
        application_id: &ApplicationToken,
    ) -> Result<serde_json::Value, ClientError> {
        self.begin_request().await?;
        let result = self.fetch_application_inner(application_id).await;
        self.finish_request().await;
        self.report(&result);
        result
    }

    /// Atomic check-and-set on the loading flag: a dispatch while another
    /// request is in flight fails fast and leaves all state untouched.
    async fn begin_request(&self) -> Result<(), ClientError> {
        let mut inner = self.inner.lock().await;
        if inner.is_loading() {
            return Err(ClientError::RequestInFlight);
        }
        inner.set_loading(true);
        Ok(())
    }

    async fn finish_request(&self) {
        self.inner.lock().await.set_loading(false);
    }

    fn report<T>(&self, result: &Result<T, ClientError>) {
        if let Err(error) = result {
            let _ = self.events.send(ClientEvent::Error(error.to_string()));
        }
    }

    async fn send_chat_message_inner(&self, text: &str) -> Result<ChatMessage, ClientError> {
        let session_id = {
            let mut inner = self.inner.lock().await;
            inner.append_message(ChatRole::User, text);
            inner.session_id().clone()
        };

        let response = self
            .http
            .post(format!("{}/api/chat", self.server_url))
            .json(&ChatTurnRequest {
                message: text.to_string(),
                session_id,
            })
            .send()
            .await?;
        let turn: ChatTurnResponse = parse_response(response).await?;

        let reply = ChatMessage::new(ChatRole::Assistant, turn.response.clone());
        let flags = {
            let mut inner = self.inner.lock().await;
            inner.append_message(ChatRole::Assistant, turn.response);
            inner.apply_flags(&turn.flags);
            inner.flags()
        };

        let _ = self.events.send(ClientEvent::ReplyReceived {
            message: reply.clone(),
        });
        let _ = self.events.send(ClientEvent::FlagsUpdated(flags));
        Ok(reply)
    }

    async fn refresh_history_inner(&self) -> Result<usize, ClientError> {
        let session_id = self.inner.lock().await.session_id().clone();
        let response = self
            .http
            .get(format!(
                "{}/api/chat/history/{}",
                self.server_url, session_id
            ))
            .send()
            .await?;
        let history: ChatHistoryResponse = parse_response(response).await?;

        let message_count = history.history.len();
        let flags = {
            let mut inner = self.inner.lock().await;
            inner.replace_history(history.history);
            inner.apply_flags(&history.flags);
            inner.flags()
        };

        let _ = self
            .events
            .send(ClientEvent::TranscriptReplaced { message_count });
        let _ = self.events.send(ClientEvent::FlagsUpdated(flags));
        Ok(message_count)
    }

    async fn submit_application_inner(
        &self,
        fields: &[(String, String)],
    ) -> Result<ApplicationSubmitResponse, ClientError> {
        let session_id = self.inner.lock().await.session_id().clone();

        let mut form = reqwest::multipart::Form::new()
            .text("session_id", session_id.as_str().to_string());
        for (name, value) in fields {
            form = form.text(name.clone(), value.clone());
        }

        let response = self
            .http
            .post(format!("{}/api/application", self.server_url))
            .multipart(form)
            .send()
            .await?;
        let submitted: ApplicationSubmitResponse = parse_response(response).await?;

        if submitted.success {
            if let Some(application_id) = &submitted.application_id {
                {
                    let mut inner = self.inner.lock().await;
                    inner.set_application_id(Some(application_id.clone()));
                    inner.set_view(View::Chat);
                }
                let _ = self.events.send(ClientEvent::ApplicationSubmitted {
                    application_id: application_id.clone(),
                });
                let _ = self.events.send(ClientEvent::ViewChanged(View::Chat));
            }
        }
        Ok(submitted)
    }

    async fn verify_token_inner(
        &self,
        raw_token: &str,
    ) -> Result<ApplicationSummary, ClientError> {
        // Canonical form only; the server stays the authority on validity.
        let cleaned = ApplicationToken::cleaned(raw_token);
        let response = self
            .http
            .get(format!("{}/api/application/{}", self.server_url, cleaned))
            .send()
            .await?;
        let summary: ApplicationSummary = parse_response(response).await?;

        {
            let mut inner = self.inner.lock().await;
            inner.set_upload_token(Some(summary.application_id.clone()));
            inner.set_view(View::DocumentUpload);
        }
        let _ = self.events.send(ClientEvent::UploadTokenVerified {
            token: summary.application_id.clone(),
        });
        let _ = self
            .events
            .send(ClientEvent::ViewChanged(View::DocumentUpload));
        Ok(summary)
    }

    async fn upload_document_inner(
        &self,
        filename: &str,
        content_type: Option<&str>,
        content: Vec<u8>,
    ) -> Result<DocumentUploadResponse, ClientError> {
        let (session_id, token) = {
            let inner = self.inner.lock().await;
            (
                inner.session_id().clone(),
                inner.effective_token().to_string(),
            )
        };
        debug!(token = token.as_str(), filename, "uploading document");

        let mut part = reqwest::multipart::Part::bytes(content).file_name(filename.to_string());
        if let Some(content_type) = content_type {
            part = part.mime_str(content_type)?;
        }
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("session_id", session_id.as_str().to_string())
            .text("token", token);

        let response = self
            .http
            .post(format!("{}/api/upload", self.server_url))
            .multipart(form)
            .send()
            .await?;
        let uploaded: DocumentUploadResponse = parse_response(response).await?;

        if let Some(document) = &uploaded.document {
            let _ = self.events.send(ClientEvent::DocumentStored {
                document: document.clone(),
            });
        }
        Ok(uploaded)
    }

    async fn list_documents_inner(&self) -> Result<Vec<DocumentDescriptor>, ClientError> {
        let token = self.inner.lock().await.effective_token().to_string();
        let response = self
            .http
            .get(format!("{}/api/documents/{}", self.server_url, token))
            .send()
            .await?;
        let listing: DocumentListResponse = parse_response(response).await?;
        Ok(listing.documents)
    }

    async fn delete_document_inner(&self, document_id: &DocumentId) -> Result<(), ClientError> {
        let token = self.inner.lock().await.effective_token().to_string();
        let response = self
            .http
            .delete(format!(
                "{}/api/documents/{}/{}",
                self.server_url, token, document_id
            ))
            .send()
            .await?;
        check_status(response).await?;

        let _ = self.events.send(ClientEvent::DocumentDeleted {
            document_id: document_id.clone(),
        });
        Ok(())
    }

    async fn cancel_application_inner(&self) -> Result<ApplicationToken, ClientError> {
        let token_string = self.inner.lock().await.effective_token().to_string();
        let response = self
            .http
            .delete(format!(
                "{}/api/application/{}",
                self.server_url, token_string
            ))
            .send()
            .await?;
        check_status(response).await?;

        let token = ApplicationToken::new(token_string);
        let flags = {
            let mut inner = self.inner.lock().await;
            if inner.upload_token() == Some(&token) {
                inner.set_upload_token(None);
            }
            if inner.application_id() == Some(&token) {
                inner.set_application_id(None);
            }
            inner.apply_flags(&AffordancePatch {
                show_cancel_button: Some(false),
                ..AffordancePatch::default()
            });
            inner.set_view(View::Chat);
            inner.flags()
        };

        let _ = self.events.send(ClientEvent::ApplicationCancelled {
            token: token.clone(),
        });
        let _ = self.events.send(ClientEvent::FlagsUpdated(flags));
        let _ = self.events.send(ClientEvent::ViewChanged(View::Chat));
        Ok(token)
    }

    async fn fetch_application_inner(
        &self,
        application_id: &ApplicationToken,
    ) -> Result<serde_json::Value, ClientError> {
        let session_id = self.inner.lock().await.session_id().clone();
        let response = self
            .http
            .get(format!(
                "{}/api/application/{}/{}",
                self.server_url, session_id, application_id
            ))
            .send()
            .await?;
        parse_response(response).await
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match response.json::<ApiError>().await {
        Ok(error) => Err(ClientError::from_api(error)),
        Err(_) => Err(ClientError::UnexpectedResponse(format!(
            "server returned {status} without an error payload"
        ))),
    }
}

async fn parse_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
    let response = check_status(response).await?;
    response
        .json::<T>()
        .await
        .map_err(|error| ClientError::UnexpectedResponse(error.to_string()))
}

#[cfg(test)]
mod tests;

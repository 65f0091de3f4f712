use std::sync::Arc;

use chrono::Utc;
use shared::{
    domain::{ApplicationStatus, ApplicationToken, ChatRole, DocumentId, SessionId},
    error::{ApiError, ErrorCode},
    protocol::{
        ApplicationSubmitResponse, ApplicationSummary, ChatHistoryResponse, ChatMessage,
        ChatTurnResponse, DocumentDescriptor, DocumentListResponse, DocumentUploadResponse,
    },
};
use storage::{NewDocument, Storage, StoredDocument};
use tracing::info;

pub mod responder;
pub mod validate;

pub use responder::{ChatResponder, KeywordResponder, MissingChatModel};
pub use validate::validate_fields;

use responder::contains_any;

pub const GREETING: &str = "Hello! I'm your Home Loan Assistant. I can help you with information about home loans, eligibility, interest rates, and more. How can I assist you today?";

pub const CUSTOMERS_PREFIX: &str = "customers_data/";

const ALLOWED_DOCUMENT_EXTENSIONS: &[&str] = &["pdf", "jpg", "jpeg", "png"];
const MAX_FILENAME_BYTES: usize = 180;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub responder: Arc<dyn ChatResponder>,
}

#[derive(Debug, Clone)]
pub struct DocumentUpload<'a> {
    pub filename: &'a str,
    pub content_type: Option<&'a str>,
    pub content: &'a [u8],
}

/// One conversational turn: persist the user message, produce the assistant
/// reply, and rederive the affordance flags for this session.
pub async fn chat_turn(
    ctx: &ApiContext,
    session_id: &SessionId,
    message: &str,
) -> Result<ChatTurnResponse, ApiError> {
    let message = message.trim();
    if message.is_empty() {
        return Err(ApiError::validation("message cannot be empty"));
    }

    let created = ctx
        .storage
        .create_session_if_missing(session_id)
        .await
        .map_err(internal)?;
    if created {
        ctx.storage
            .append_chat_message(session_id, ChatRole::Assistant, GREETING)
            .await
            .map_err(internal)?;
    }

    ctx.storage
        .append_chat_message(session_id, ChatRole::User, message)
        .await
        .map_err(internal)?;

    let history: Vec<ChatMessage> = ctx
        .storage
        .list_chat_messages(session_id)
        .await
        .map_err(internal)?
        .into_iter()
        .map(|stored| ChatMessage::new(stored.role, stored.content))
        .collect();

    let reply = ctx
        .responder
        .reply(message, &history)
        .await
        .map_err(internal)?;

    ctx.storage
        .append_chat_message(session_id, ChatRole::Assistant, &reply)
        .await
        .map_err(internal)?;

    let record = ctx
        .storage
        .session_record(session_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::Internal, "session row disappeared"))?;

    let message_lower = message.to_ascii_lowercase();
    let reply_lower = reply.to_ascii_lowercase();
    let wants_apply = contains_any(&message_lower, &["apply", "application"]);
    let assistant_suggests_apply = reply_lower.contains("application");
    let wants_upload = contains_any(&message_lower, &["upload", "document"]);
    let has_pending_application = record.status == Some(ApplicationStatus::PendingDocuments);

    let mut flags = record.flags;
    flags.show_form_button = wants_apply || assistant_suggests_apply;
    flags.show_upload_button = wants_upload || has_pending_application;
    if contains_any(&message_lower, &["update", "edit", "change"]) {
        flags.show_update_button = true;
    }
    if contains_any(&message_lower, &["cancel", "terminate"]) {
        flags.show_cancel_button = true;
    }

    ctx.storage
        .update_session_flags(session_id, &flags)
        .await
        .map_err(internal)?;

    Ok(ChatTurnResponse {
        response: reply,
        flags: flags.into_patch(),
    })
}

/// Transcript and flag state for a session. Unknown sessions get the canned
/// greeting and all-false flags without creating any state.
pub async fn chat_history(
    ctx: &ApiContext,
    session_id: &SessionId,
) -> Result<ChatHistoryResponse, ApiError> {
    let Some(record) = ctx
        .storage
        .session_record(session_id)
        .await
        .map_err(internal)?
    else {
        return Ok(ChatHistoryResponse {
            history: vec![ChatMessage::new(ChatRole::Assistant, GREETING)],
            flags: Default::default(),
        });
    };

    let history = ctx
        .storage
        .list_chat_messages(session_id)
        .await
        .map_err(internal)?
        .into_iter()
        .map(|stored| ChatMessage::new(stored.role, stored.content))
        .collect();

    Ok(ChatHistoryResponse {
        history,
        flags: record.flags.into_patch(),
    })
}

pub fn generate_application_token() -> ApplicationToken {
    ApplicationToken::new(format!("HL{}", Utc::now().timestamp_millis()))
}

pub async fn submit_application(
    ctx: &ApiContext,
    session_id: &SessionId,
    fields: &[(String, String)],
) -> Result<ApplicationSubmitResponse, ApiError> {
    validate_fields(fields)?;

    let token = generate_application_token();
    let field_map: serde_json::Map<String, serde_json::Value> = fields
        .iter()
        .map(|(key, value)| (key.clone(), serde_json::Value::String(value.clone())))
        .collect();

    ctx.storage
        .create_session_if_missing(session_id)
        .await
        .map_err(internal)?;
    ctx.storage
        .insert_application(&token, session_id, &serde_json::Value::Object(field_map))
        .await
        .map_err(internal)?;
    ctx.storage
        .set_session_application(session_id, &token, ApplicationStatus::PendingDocuments)
        .await
        .map_err(internal)?;

    ctx.storage
        .append_chat_message(
            session_id,
            ChatRole::Assistant,
            &format!(
                "🎉 Great! Your loan application has been submitted successfully.\n\n📋 **Your Application ID:** {token}\n\n📄 **Next Step:** Please upload your required documents (income proof, ID proof, address proof, etc.) to complete your application. Click the 'Upload Documents' button below to get started."
            ),
        )
        .await
        .map_err(internal)?;

    let mut flags = ctx
        .storage
        .session_record(session_id)
        .await
        .map_err(internal)?
        .map(|record| record.flags)
        .unwrap_or_default();
    flags.show_upload_button = true;
    flags.show_form_button = false;
    ctx.storage
        .update_session_flags(session_id, &flags)
        .await
        .map_err(internal)?;

    info!(session_id = session_id.as_str(), application_id = token.as_str(), "application submitted");

    Ok(ApplicationSubmitResponse {
        success: true,
        message: format!(
            "Application submitted! Your ID is {token}. Please proceed to upload documents."
        ),
        application_id: Some(token),
    })
}

/// Stores an uploaded document under the session's active application when it
/// has one, falling back to the caller-supplied token otherwise. The first
/// upload against a pending application moves it to processing.
pub async fn store_document(
    ctx: &ApiContext,
    session_id: &SessionId,
    token: &str,
    upload: DocumentUpload<'_>,
) -> Result<DocumentUploadResponse, ApiError> {
    if upload.content.is_empty() {
        return Err(ApiError::validation("document body cannot be empty"));
    }
    let filename = upload.filename.trim();
    if filename.is_empty() {
        return Err(ApiError::validation("filename cannot be empty"));
    }
    if filename.len() > MAX_FILENAME_BYTES {
        return Err(ApiError::validation("filename is too long"));
    }
    if filename.contains('/') || filename.contains('\\') {
        return Err(ApiError::validation(
            "filename must not contain path separators",
        ));
    }

    let (stem, extension) = match filename.rsplit_once('.') {
        Some((stem, extension)) if !stem.is_empty() => (stem, extension.to_ascii_lowercase()),
        _ => (filename, "jpg".to_string()),
    };
    if !ALLOWED_DOCUMENT_EXTENSIONS.contains(&extension.as_str()) {
        return Err(ApiError::validation(format!(
            "unsupported file type: {extension}"
        )));
    }

    let session_record = ctx
        .storage
        .session_record(session_id)
        .await
        .map_err(internal)?;
    let target = match session_record
        .as_ref()
        .and_then(|record| record.current_application.clone())
    {
        Some(application) => application,
        None => {
            let cleaned = ApplicationToken::cleaned(token);
            if !cleaned.is_wellformed() {
                return Err(ApiError::not_found(
                    "no active application found for this session",
                ));
            }
            cleaned
        }
    };

    let application = ctx
        .storage
        .application(&target)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found(format!("application {target} not found")))?;

    let doc_type = stem.split('_').next().unwrap_or(stem);
    let document_id = DocumentId::new(format!("{target}_{doc_type}.{extension}"));
    let storage_path = format!(
        "{CUSTOMERS_PREFIX}{target}/documents/{id}",
        id = document_id.as_str()
    );

    let stored = ctx
        .storage
        .upsert_document(NewDocument {
            application_token: &target,
            id: &document_id,
            name: document_id.as_str(),
            storage_path: &storage_path,
            content_type: upload.content_type,
            content: upload.content,
        })
        .await
        .map_err(internal)?;

    info!(
        application_id = target.as_str(),
        document_id = document_id.as_str(),
        size_bytes = stored.size_bytes,
        "document stored"
    );

    if application.status == ApplicationStatus::PendingDocuments {
        ctx.storage
            .set_application_status(&target, ApplicationStatus::Processing)
            .await
            .map_err(internal)?;

        if session_record.is_some() {
            ctx.storage
                .append_chat_message(
                    session_id,
                    ChatRole::Assistant,
                    &format!(
                        "📄 Document uploaded successfully! Your application {target} is now being processed by our loan officers. You will receive updates on the status shortly."
                    ),
                )
                .await
                .map_err(internal)?;

            let mut flags = ctx
                .storage
                .session_record(session_id)
                .await
                .map_err(internal)?
                .map(|record| record.flags)
                .unwrap_or_default();
            flags.show_upload_button = false;
            ctx.storage
                .update_session_flags(session_id, &flags)
                .await
                .map_err(internal)?;
        }
    }

    Ok(DocumentUploadResponse {
        success: true,
        message: "Document uploaded successfully!".to_string(),
        document: Some(to_descriptor(stored)),
    })
}

/// Documents for a token. Unknown tokens list as empty rather than erroring.
pub async fn list_documents(
    ctx: &ApiContext,
    token: &str,
) -> Result<DocumentListResponse, ApiError> {
    let cleaned = ApplicationToken::cleaned(token);
    let documents = ctx
        .storage
        .list_documents(&cleaned)
        .await
        .map_err(internal)?
        .into_iter()
        .map(to_descriptor)
        .collect();
    Ok(DocumentListResponse { documents })
}

pub async fn delete_document(
    ctx: &ApiContext,
    token: &str,
    document_id: &DocumentId,
) -> Result<(), ApiError> {
    let cleaned = ApplicationToken::cleaned(token);
    let deleted = ctx
        .storage
        .delete_document(&cleaned, document_id)
        .await
        .map_err(internal)?;
    if !deleted {
        return Err(ApiError::not_found(format!(
            "document {document_id} not found for {cleaned}"
        )));
    }
    Ok(())
}

/// Token verification for the existing-applicant flow.
pub async fn application_summary(
    ctx: &ApiContext,
    token: &str,
) -> Result<ApplicationSummary, ApiError> {
    let cleaned = ApplicationToken::cleaned(token);
    if !cleaned.is_wellformed() {
        return Err(ApiError::validation(
            "Invalid token format. Please provide a valid token (HL followed by 13 digits).",
        ));
    }

    let application = ctx
        .storage
        .application(&cleaned)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found(format!("application {cleaned} not found")))?;

    Ok(ApplicationSummary {
        application_id: application.token,
        status: application.status,
        created_at: application.created_at,
    })
}

pub async fn application_fields(
    ctx: &ApiContext,
    session_id: &SessionId,
    token: &ApplicationToken,
) -> Result<serde_json::Value, ApiError> {
    ctx.storage
        .application_for_session(session_id, token)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("application not found"))
}

pub async fn cancel_application(ctx: &ApiContext, token: &str) -> Result<(), ApiError> {
    let cleaned = ApplicationToken::cleaned(token);
    if !cleaned.is_wellformed() {
        return Err(ApiError::validation(
            "Invalid token format. Please provide a valid token (HL followed by 13 digits).",
        ));
    }

    let deleted = ctx
        .storage
        .delete_application(&cleaned)
        .await
        .map_err(internal)?;
    if !deleted {
        return Err(ApiError::not_found(format!(
            "application {cleaned} not found"
        )));
    }

    info!(application_id = cleaned.as_str(), "application cancelled");
    Ok(())
}

fn to_descriptor(stored: StoredDocument) -> DocumentDescriptor {
    let name = display_name(&stored.name, &stored.application_token);
    DocumentDescriptor {
        id: stored.id,
        name,
        storage_path: stored.storage_path,
        size_bytes: stored.size_bytes,
        content_type: stored.content_type,
        last_modified: stored.last_modified,
    }
}

/// Listing names drop the `<TOKEN>_` (or `<TOKEN>-`) prefix the storage key
/// carries.
pub fn display_name(stored_name: &str, token: &ApplicationToken) -> String {
    for separator in ['_', '-'] {
        let prefix = format!("{}{}", token.as_str(), separator);
        if let Some(stripped) = stored_name.strip_prefix(prefix.as_str()) {
            return stripped.to_string();
        }
    }
    stored_name.to_string()
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> (ApiContext, SessionId) {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        (
            ApiContext {
                storage,
                responder: Arc::new(KeywordResponder),
            },
            SessionId::new("session_1700000000000"),
        )
    }

    fn submission_fields() -> Vec<(String, String)> {
        [
            ("full_name", "Asha Rao"),
            ("email", "asha@example.com"),
            ("phone", "9876543210"),
            ("property_value", "9000000"),
            ("loan_amount", "4500000"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn pdf_upload<'a>(filename: &'a str, content: &'a [u8]) -> DocumentUpload<'a> {
        DocumentUpload {
            filename,
            content_type: Some("application/pdf"),
            content,
        }
    }

    #[tokio::test]
    async fn first_chat_turn_bootstraps_greeting_and_transcript_order() {
        let (ctx, session) = setup().await;
        let response = chat_turn(&ctx, &session, "What is the interest rate?")
            .await
            .expect("turn");
        assert!(response.response.contains("interest rates"));

        let history = chat_history(&ctx, &session).await.expect("history").history;
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].content, GREETING);
        assert_eq!(history[1].role, ChatRole::User);
        assert_eq!(history[2].role, ChatRole::Assistant);
    }

    #[tokio::test]
    async fn apply_intent_raises_form_flag_only() {
        let (ctx, session) = setup().await;
        let response = chat_turn(&ctx, &session, "I want to apply for a home loan")
            .await
            .expect("turn");
        assert_eq!(response.flags.show_form_button, Some(true));
        assert_eq!(response.flags.show_upload_button, Some(false));
        assert_eq!(response.flags.show_cancel_button, Some(false));
    }

    #[tokio::test]
    async fn cancel_intent_sets_sticky_cancel_flag() {
        let (ctx, session) = setup().await;
        let response = chat_turn(&ctx, &session, "I want to cancel my application")
            .await
            .expect("turn");
        assert_eq!(response.flags.show_cancel_button, Some(true));

        // A later unrelated turn keeps the sticky flag.
        let response = chat_turn(&ctx, &session, "what documents are required?")
            .await
            .expect("turn");
        assert_eq!(response.flags.show_cancel_button, Some(true));
    }

    #[tokio::test]
    async fn unknown_session_history_is_greeting_without_state() {
        let (ctx, _) = setup().await;
        let session = SessionId::new("session_never_seen");
        let response = chat_history(&ctx, &session).await.expect("history");
        assert_eq!(response.history.len(), 1);
        assert_eq!(response.history[0].content, GREETING);
        assert_eq!(response.flags.show_upload_button, None);
        assert!(ctx
            .storage
            .session_record(&session)
            .await
            .expect("record")
            .is_none());
    }

    #[tokio::test]
    async fn submission_stores_application_and_flips_flags() {
        let (ctx, session) = setup().await;
        let response = submit_application(&ctx, &session, &submission_fields())
            .await
            .expect("submit");
        assert!(response.success);
        let token = response.application_id.expect("token issued");
        assert!(token.is_wellformed());

        let record = ctx
            .storage
            .session_record(&session)
            .await
            .expect("record")
            .expect("present");
        assert_eq!(record.status, Some(ApplicationStatus::PendingDocuments));
        assert_eq!(record.current_application, Some(token.clone()));
        assert!(record.flags.show_upload_button);
        assert!(!record.flags.show_form_button);

        let history = chat_history(&ctx, &session).await.expect("history").history;
        let last = history.last().expect("confirmation message");
        assert!(last.content.contains(token.as_str()));
    }

    #[tokio::test]
    async fn submission_rejects_invalid_fields() {
        let (ctx, session) = setup().await;
        let mut fields = submission_fields();
        fields.retain(|(k, _)| k != "email");
        let err = submit_application(&ctx, &session, &fields)
            .await
            .expect_err("must fail");
        assert_eq!(err.code, ErrorCode::Validation);
    }

    #[tokio::test]
    async fn first_upload_moves_application_to_processing() {
        let (ctx, session) = setup().await;
        let token = submit_application(&ctx, &session, &submission_fields())
            .await
            .expect("submit")
            .application_id
            .expect("token");

        // Client side has no upload token here, so it sends the session id.
        let response = store_document(
            &ctx,
            &session,
            session.as_str(),
            pdf_upload("PAN.pdf", b"%PDF-1.4"),
        )
        .await
        .expect("upload");
        let descriptor = response.document.expect("descriptor");
        assert_eq!(descriptor.name, "PAN.pdf");
        assert_eq!(
            descriptor.id.as_str(),
            format!("{}_PAN.pdf", token.as_str())
        );

        let application = ctx
            .storage
            .application(&token)
            .await
            .expect("fetch")
            .expect("present");
        assert_eq!(application.status, ApplicationStatus::Processing);

        let record = ctx
            .storage
            .session_record(&session)
            .await
            .expect("record")
            .expect("present");
        assert!(!record.flags.show_upload_button);
        assert_eq!(record.status, Some(ApplicationStatus::Processing));

        let history = chat_history(&ctx, &session).await.expect("history").history;
        assert!(history
            .last()
            .expect("processing message")
            .content
            .contains("being processed"));
    }

    #[tokio::test]
    async fn upload_falls_back_to_supplied_token_without_session_application() {
        let (ctx, session) = setup().await;
        let token = submit_application(&ctx, &session, &submission_fields())
            .await
            .expect("submit")
            .application_id
            .expect("token");

        let other_session = SessionId::new("session_other_browser");
        let response = store_document(
            &ctx,
            &other_session,
            &token.as_str().to_ascii_lowercase(),
            pdf_upload("AADHAR.jpg", b"jpeg-bytes"),
        )
        .await
        .expect("upload");
        assert!(response.success);

        let documents = list_documents(&ctx, token.as_str()).await.expect("list");
        assert_eq!(documents.documents.len(), 1);
    }

    #[tokio::test]
    async fn upload_without_any_application_is_rejected() {
        let (ctx, session) = setup().await;
        let err = store_document(
            &ctx,
            &session,
            session.as_str(),
            pdf_upload("PAN.pdf", b"%PDF-1.4"),
        )
        .await
        .expect_err("must fail");
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn upload_validates_body_and_extension() {
        let (ctx, session) = setup().await;
        let err = store_document(&ctx, &session, "HL1700000000123", pdf_upload("PAN.pdf", b""))
            .await
            .expect_err("empty body");
        assert_eq!(err.code, ErrorCode::Validation);

        let err = store_document(
            &ctx,
            &session,
            "HL1700000000123",
            pdf_upload("notes.txt", b"text"),
        )
        .await
        .expect_err("bad extension");
        assert_eq!(err.code, ErrorCode::Validation);
    }

    #[tokio::test]
    async fn listing_strips_token_prefix_and_reupload_replaces() {
        let (ctx, session) = setup().await;
        let token = submit_application(&ctx, &session, &submission_fields())
            .await
            .expect("submit")
            .application_id
            .expect("token");

        for content in [b"first".as_slice(), b"second-upload".as_slice()] {
            store_document(&ctx, &session, session.as_str(), pdf_upload("PAN.pdf", content))
                .await
                .expect("upload");
        }

        let listing = list_documents(&ctx, token.as_str()).await.expect("list");
        assert_eq!(listing.documents.len(), 1);
        assert_eq!(listing.documents[0].name, "PAN.pdf");
        assert_eq!(listing.documents[0].size_bytes, 13);
        assert!(listing.documents[0]
            .storage_path
            .starts_with("customers_data/HL"));
    }

    #[tokio::test]
    async fn delete_document_round_trip() {
        let (ctx, session) = setup().await;
        let token = submit_application(&ctx, &session, &submission_fields())
            .await
            .expect("submit")
            .application_id
            .expect("token");
        store_document(&ctx, &session, session.as_str(), pdf_upload("PAN.pdf", b"x"))
            .await
            .expect("upload");

        let id = DocumentId::new(format!("{}_PAN.pdf", token.as_str()));
        delete_document(&ctx, token.as_str(), &id)
            .await
            .expect("delete");
        let err = delete_document(&ctx, token.as_str(), &id)
            .await
            .expect_err("already gone");
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn summary_validates_and_resolves_tokens() {
        let (ctx, session) = setup().await;
        let err = application_summary(&ctx, "HL123").await.expect_err("short");
        assert_eq!(err.code, ErrorCode::Validation);

        let err = application_summary(&ctx, "HL1700000000999")
            .await
            .expect_err("unknown");
        assert_eq!(err.code, ErrorCode::NotFound);

        let token = submit_application(&ctx, &session, &submission_fields())
            .await
            .expect("submit")
            .application_id
            .expect("token");
        let summary = application_summary(&ctx, &format!(" {} ", token.as_str().to_lowercase()))
            .await
            .expect("summary");
        assert_eq!(summary.application_id, token);
        assert_eq!(summary.status, ApplicationStatus::PendingDocuments);
    }

    #[tokio::test]
    async fn cancellation_clears_application_and_session_pointer() {
        let (ctx, session) = setup().await;
        let token = submit_application(&ctx, &session, &submission_fields())
            .await
            .expect("submit")
            .application_id
            .expect("token");
        store_document(&ctx, &session, session.as_str(), pdf_upload("PAN.pdf", b"x"))
            .await
            .expect("upload");

        cancel_application(&ctx, token.as_str()).await.expect("cancel");

        assert!(ctx
            .storage
            .application(&token)
            .await
            .expect("fetch")
            .is_none());
        assert!(list_documents(&ctx, token.as_str())
            .await
            .expect("list")
            .documents
            .is_empty());
        let record = ctx
            .storage
            .session_record(&session)
            .await
            .expect("record")
            .expect("present");
        assert!(record.current_application.is_none());

        let err = cancel_application(&ctx, token.as_str())
            .await
            .expect_err("second cancel");
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn scoped_application_fields_require_matching_session() {
        let (ctx, session) = setup().await;
        let token = submit_application(&ctx, &session, &submission_fields())
            .await
            .expect("submit")
            .application_id
            .expect("token");

        let fields = application_fields(&ctx, &session, &token)
            .await
            .expect("fields");
        assert_eq!(fields["full_name"], "Asha Rao");

        let err = application_fields(&ctx, &SessionId::new("session_other"), &token)
            .await
            .expect_err("wrong session");
        assert_eq!(err.code, ErrorCode::NotFound);
    }
}

use shared::{
    domain::{ApplicationStatus, ApplicationToken, ChatRole, DocumentId, SessionId},
    protocol::AffordanceFlags,
};
use storage::{NewDocument, Storage};

#[tokio::test]
async fn submission_to_processing_acceptance_on_file_backed_database() {
    let dir = tempfile::tempdir().expect("tempdir");
    let database_url = format!(
        "sqlite://{}/data/intake.db",
        dir.path().to_str().expect("utf8 temp path")
    );

    let storage = Storage::new(&database_url).await.expect("db");
    storage.health_check().await.expect("ping");

    let session = SessionId::new("session_1700000000000");
    let token = ApplicationToken::cleaned("HL1700000000123");

    storage
        .create_session_if_missing(&session)
        .await
        .expect("session");
    storage
        .append_chat_message(&session, ChatRole::Assistant, "Hello! How can I assist you?")
        .await
        .expect("greeting");
    storage
        .append_chat_message(&session, ChatRole::User, "I want to apply for a home loan")
        .await
        .expect("user turn");

    storage
        .insert_application(
            &token,
            &session,
            &serde_json::json!({ "full_name": "Asha Rao", "loan_amount": "4500000" }),
        )
        .await
        .expect("application");
    storage
        .set_session_application(&session, &token, ApplicationStatus::PendingDocuments)
        .await
        .expect("pointer");
    storage
        .update_session_flags(
            &session,
            &AffordanceFlags {
                show_upload_button: true,
                ..AffordanceFlags::default()
            },
        )
        .await
        .expect("flags");

    let doc_id = DocumentId::new("HL1700000000123_PAN.pdf");
    storage
        .upsert_document(NewDocument {
            application_token: &token,
            id: &doc_id,
            name: "HL1700000000123_PAN.pdf",
            storage_path: "customers_data/HL1700000000123/documents/HL1700000000123_PAN.pdf",
            content_type: Some("application/pdf"),
            content: b"%PDF-1.4 acceptance bytes",
        })
        .await
        .expect("document");
    storage
        .set_application_status(&token, ApplicationStatus::Processing)
        .await
        .expect("processing");

    // Reopen the same file to prove everything survived the pool.
    drop(storage);
    let reopened = Storage::new(&database_url).await.expect("reopen");

    let record = reopened
        .session_record(&session)
        .await
        .expect("record")
        .expect("present");
    assert_eq!(record.status, Some(ApplicationStatus::Processing));
    assert_eq!(record.current_application, Some(token.clone()));
    assert!(record.flags.show_upload_button);

    let messages = reopened.list_chat_messages(&session).await.expect("messages");
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, ChatRole::Assistant);

    let documents = reopened.list_documents(&token).await.expect("documents");
    assert_eq!(documents.len(), 1);
    assert_eq!(documents[0].id, doc_id);
    assert_eq!(documents[0].size_bytes, 25);
}

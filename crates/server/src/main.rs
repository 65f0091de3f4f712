use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use server_api::{ApiContext, DocumentUpload, KeywordResponder};
use shared::{
    domain::{ApplicationToken, DocumentId, SessionId},
    error::{ApiError, ErrorCode},
    protocol::{
        ApplicationSubmitResponse, ApplicationSummary, ChatHistoryResponse, ChatTurnRequest,
        ChatTurnResponse, DocumentListResponse, DocumentUploadResponse,
    },
};
use storage::Storage;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};

mod config;

use config::{load_settings, normalize_database_url};

#[derive(Clone)]
struct AppState {
    api: ApiContext,
}

const MAX_DOCUMENT_BYTES: usize = 8 * 1024 * 1024;

type Rejection = (StatusCode, Json<ApiError>);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = normalize_database_url(&settings.database_url);
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let api = ApiContext {
        storage,
        responder: Arc::new(KeywordResponder),
    };
    let app = build_router(Arc::new(AppState { api }));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/chat", post(chat))
        .route("/api/chat/history/:session_id", get(chat_history))
        .route("/api/application", post(submit_application))
        .route(
            "/api/application/:token",
            get(application_summary).delete(cancel_application),
        )
        .route(
            "/api/application/:session_id/:application_id",
            get(application_fields),
        )
        .route(
            "/api/upload",
            post(upload_document).layer((
                DefaultBodyLimit::disable(),
                RequestBodyLimitLayer::new(MAX_DOCUMENT_BYTES + 64 * 1024),
            )),
        )
        .route("/api/documents/:token", get(list_documents))
        .route("/api/documents/:token/:document_id", delete(delete_document))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn chat(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatTurnRequest>,
) -> Result<Json<ChatTurnResponse>, Rejection> {
    let response = server_api::chat_turn(&state.api, &req.session_id, &req.message)
        .await
        .map_err(reject)?;
    Ok(Json(response))
}

async fn chat_history(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<ChatHistoryResponse>, Rejection> {
    let response = server_api::chat_history(&state.api, &SessionId::new(session_id))
        .await
        .map_err(reject)?;
    Ok(Json(response))
}

async fn submit_application(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<ApplicationSubmitResponse>, Rejection> {
    let mut session_id = None;
    let mut fields = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        let value = field.text().await.map_err(bad_multipart)?;
        if name == "session_id" {
            session_id = Some(SessionId::new(value));
        } else {
            fields.push((name, value));
        }
    }

    let session_id = session_id.ok_or_else(|| {
        reject(ApiError::validation("session_id form field is required"))
    })?;

    let response = server_api::submit_application(&state.api, &session_id, &fields)
        .await
        .map_err(reject)?;
    Ok(Json(response))
}

async fn upload_document(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<DocumentUploadResponse>, Rejection> {
    let mut session_id = None;
    let mut token = None;
    let mut file: Option<(String, Option<String>, axum::body::Bytes)> = None;

    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let filename = field.file_name().map(str::to_string).unwrap_or_default();
                let content_type = field.content_type().map(str::to_string);
                let bytes = field.bytes().await.map_err(bad_multipart)?;
                file = Some((filename, content_type, bytes));
            }
            Some("session_id") => {
                session_id = Some(SessionId::new(field.text().await.map_err(bad_multipart)?));
            }
            Some("token") => {
                token = Some(field.text().await.map_err(bad_multipart)?);
            }
            _ => {}
        }
    }

    let session_id = session_id.ok_or_else(|| {
        reject(ApiError::validation("session_id form field is required"))
    })?;
    let (filename, content_type, bytes) =
        file.ok_or_else(|| reject(ApiError::validation("file form field is required")))?;

    if bytes.len() > MAX_DOCUMENT_BYTES {
        return Err((
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(ApiError::validation(format!(
                "document exceeds {MAX_DOCUMENT_BYTES} bytes"
            ))),
        ));
    }

    // Fall back on the extension when the part carries no content type.
    let content_type = content_type
        .or_else(|| mime_guess::from_path(&filename).first_raw().map(str::to_string));

    let response = server_api::store_document(
        &state.api,
        &session_id,
        token.as_deref().unwrap_or_default(),
        DocumentUpload {
            filename: &filename,
            content_type: content_type.as_deref(),
            content: &bytes,
        },
    )
    .await
    .map_err(reject)?;
    Ok(Json(response))
}

async fn list_documents(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Json<DocumentListResponse>, Rejection> {
    let response = server_api::list_documents(&state.api, &token)
        .await
        .map_err(reject)?;
    Ok(Json(response))
}

async fn delete_document(
    State(state): State<Arc<AppState>>,
    Path((token, document_id)): Path<(String, String)>,
) -> Result<StatusCode, Rejection> {
    server_api::delete_document(&state.api, &token, &DocumentId::new(document_id))
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn application_summary(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Json<ApplicationSummary>, Rejection> {
    let summary = server_api::application_summary(&state.api, &token)
        .await
        .map_err(reject)?;
    Ok(Json(summary))
}

async fn application_fields(
    State(state): State<Arc<AppState>>,
    Path((session_id, application_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, Rejection> {
    let fields = server_api::application_fields(
        &state.api,
        &SessionId::new(session_id),
        &ApplicationToken::cleaned(&application_id),
    )
    .await
    .map_err(reject)?;
    Ok(Json(fields))
}

async fn cancel_application(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<StatusCode, Rejection> {
    server_api::cancel_application(&state.api, &token)
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

fn reject(error: ApiError) -> Rejection {
    (status_for(error.code), Json(error))
}

fn bad_multipart(error: axum::extract::multipart::MultipartError) -> Rejection {
    reject(ApiError::validation(format!(
        "invalid multipart payload: {error}"
    )))
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request},
    };
    use tower::ServiceExt;

    const BOUNDARY: &str = "intake-test-boundary";

    async fn test_app() -> Router {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        let api = ApiContext {
            storage,
            responder: Arc::new(KeywordResponder),
        };
        build_router(Arc::new(AppState { api }))
    }

    fn text_part(name: &str, value: &str) -> Vec<u8> {
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
        )
        .into_bytes()
    }

    fn file_part(name: &str, filename: &str, content_type: &str, bytes: &[u8]) -> Vec<u8> {
        let mut part = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n"
        )
        .into_bytes();
        part.extend_from_slice(bytes);
        part.extend_from_slice(b"\r\n");
        part
    }

    fn multipart_request(uri: &str, parts: Vec<Vec<u8>>) -> Request<Body> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(&part);
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        Request::post(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .expect("request")
    }

    fn submission_parts(session_id: &str) -> Vec<Vec<u8>> {
        vec![
            text_part("session_id", session_id),
            text_part("full_name", "Asha Rao"),
            text_part("email", "asha@example.com"),
            text_part("phone", "9876543210"),
            text_part("property_value", "9000000"),
            text_part("loan_amount", "4500000"),
        ]
    }

    async fn json_body<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn healthz_responds_ok() {
        let app = test_app().await;
        let response = app
            .oneshot(Request::get("/healthz").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn chat_turn_returns_reply_and_flags() {
        let app = test_app().await;
        let request = Request::post("/api/chat")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                serde_json::json!({
                    "message": "I want to apply for a home loan",
                    "session_id": "session_1700000000000"
                })
                .to_string(),
            ))
            .expect("request");

        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let parsed: ChatTurnResponse = json_body(response).await;
        assert_eq!(parsed.flags.show_form_button, Some(true));
        assert!(!parsed.response.is_empty());
    }

    #[tokio::test]
    async fn submission_upload_list_delete_flow() {
        let app = test_app().await;
        let session = "session_1700000000000";

        let response = app
            .clone()
            .oneshot(multipart_request("/api/application", submission_parts(session)))
            .await
            .expect("submit response");
        assert_eq!(response.status(), StatusCode::OK);
        let submitted: ApplicationSubmitResponse = json_body(response).await;
        let token = submitted.application_id.expect("token");

        let response = app
            .clone()
            .oneshot(multipart_request(
                "/api/upload",
                vec![
                    file_part("file", "PAN.pdf", "application/pdf", b"%PDF-1.4"),
                    text_part("session_id", session),
                    text_part("token", session),
                ],
            ))
            .await
            .expect("upload response");
        assert_eq!(response.status(), StatusCode::OK);
        let uploaded: DocumentUploadResponse = json_body(response).await;
        let document = uploaded.document.expect("descriptor");
        assert_eq!(document.name, "PAN.pdf");

        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/api/documents/{}", token.as_str()))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("list response");
        assert_eq!(response.status(), StatusCode::OK);
        let listing: DocumentListResponse = json_body(response).await;
        assert_eq!(listing.documents.len(), 1);

        let response = app
            .oneshot(
                Request::delete(format!(
                    "/api/documents/{}/{}",
                    token.as_str(),
                    document.id.as_str()
                ))
                .body(Body::empty())
                .expect("request"),
            )
            .await
            .expect("delete response");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn submission_without_session_id_is_rejected() {
        let app = test_app().await;
        let mut parts = submission_parts("unused");
        parts.remove(0);
        let response = app
            .oneshot(multipart_request("/api/application", parts))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_token_summary_is_not_found() {
        let app = test_app().await;
        let response = app
            .oneshot(
                Request::get("/api/application/HL1700000000999")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let error: ApiError = json_body(response).await;
        assert_eq!(error.code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn cancel_round_trip() {
        let app = test_app().await;
        let response = app
            .clone()
            .oneshot(multipart_request(
                "/api/application",
                submission_parts("session_cancel_flow"),
            ))
            .await
            .expect("submit");
        let submitted: ApplicationSubmitResponse = json_body(response).await;
        let token = submitted.application_id.expect("token");

        let response = app
            .clone()
            .oneshot(
                Request::delete(format!("/api/application/{}", token.as_str()))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("cancel");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(
                Request::get(format!("/api/application/{}", token.as_str()))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("summary after cancel");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::{
    domain::{ApplicationStatus, ApplicationToken, ChatRole, DocumentId, SessionId},
    protocol::AffordanceFlags,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredChatMessage {
    pub role: ChatRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub flags: AffordanceFlags,
    pub status: Option<ApplicationStatus>,
    pub current_application: Option<ApplicationToken>,
}

#[derive(Debug, Clone)]
pub struct StoredApplication {
    pub token: ApplicationToken,
    pub session_id: Option<SessionId>,
    pub fields: serde_json::Value,
    pub status: ApplicationStatus,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

/// Document metadata without the stored bytes.
#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub id: DocumentId,
    pub application_token: ApplicationToken,
    pub name: String,
    pub storage_path: String,
    pub content_type: Option<String>,
    pub size_bytes: u64,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewDocument<'a> {
    pub application_token: &'a ApplicationToken,
    pub id: &'a DocumentId,
    pub name: &'a str,
    pub storage_path: &'a str,
    pub content_type: Option<&'a str>,
    pub content: &'a [u8],
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Returns true when the session row was created by this call.
    pub async fn create_session_if_missing(&self, session_id: &SessionId) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO sessions (id, created_at) VALUES (?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(session_id.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn session_record(&self, session_id: &SessionId) -> Result<Option<SessionRecord>> {
        let row = sqlx::query(
            "SELECT show_form_button, show_upload_button, show_update_button,
                    show_cancel_button, application_status, current_application_id
             FROM sessions WHERE id = ?",
        )
        .bind(session_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status = row
            .get::<Option<String>, _>("application_status")
            .map(|raw| status_from_str(&raw))
            .transpose()?;

        Ok(Some(SessionRecord {
            flags: AffordanceFlags {
                show_form_button: row.get::<bool, _>("show_form_button"),
                show_upload_button: row.get::<bool, _>("show_upload_button"),
                show_update_button: row.get::<bool, _>("show_update_button"),
                show_cancel_button: row.get::<bool, _>("show_cancel_button"),
            },
            status,
            current_application: row
                .get::<Option<String>, _>("current_application_id")
                .map(ApplicationToken),
        }))
    }

    pub async fn update_session_flags(
        &self,
        session_id: &SessionId,
        flags: &AffordanceFlags,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE sessions
             SET show_form_button = ?, show_upload_button = ?,
                 show_update_button = ?, show_cancel_button = ?
             WHERE id = ?",
        )
        .bind(flags.show_form_button)
        .bind(flags.show_upload_button)
        .bind(flags.show_update_button)
        .bind(flags.show_cancel_button)
        .bind(session_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_session_application(
        &self,
        session_id: &SessionId,
        token: &ApplicationToken,
        status: ApplicationStatus,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET current_application_id = ?, application_status = ? WHERE id = ?",
        )
        .bind(token.as_str())
        .bind(status_to_str(status))
        .bind(session_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Updates the application row and every session currently pointing at it.
    pub async fn set_application_status(
        &self,
        token: &ApplicationToken,
        status: ApplicationStatus,
    ) -> Result<()> {
        sqlx::query("UPDATE applications SET status = ?, last_updated = ? WHERE token = ?")
            .bind(status_to_str(status))
            .bind(Utc::now())
            .bind(token.as_str())
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "UPDATE sessions SET application_status = ? WHERE current_application_id = ?",
        )
        .bind(status_to_str(status))
        .bind(token.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn append_chat_message(
        &self,
        session_id: &SessionId,
        role: ChatRole,
        content: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO chat_messages (session_id, role, content, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(session_id.as_str())
        .bind(role_to_str(role))
        .bind(content)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_chat_messages(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<StoredChatMessage>> {
        let rows = sqlx::query(
            "SELECT role, content, created_at FROM chat_messages
             WHERE session_id = ? ORDER BY id ASC",
        )
        .bind(session_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(StoredChatMessage {
                    role: role_from_str(&row.get::<String, _>("role"))?,
                    content: row.get::<String, _>("content"),
                    created_at: row.get::<DateTime<Utc>, _>("created_at"),
                })
            })
            .collect()
    }

    pub async fn insert_application(
        &self,
        token: &ApplicationToken,
        session_id: &SessionId,
        fields: &serde_json::Value,
    ) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO applications (token, session_id, fields_json, status, created_at, last_updated)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(token.as_str())
        .bind(session_id.as_str())
        .bind(fields.to_string())
        .bind(status_to_str(ApplicationStatus::PendingDocuments))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn application(&self, token: &ApplicationToken) -> Result<Option<StoredApplication>> {
        let row = sqlx::query(
            "SELECT token, session_id, fields_json, status, created_at, last_updated
             FROM applications WHERE token = ?",
        )
        .bind(token.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(StoredApplication {
            token: ApplicationToken(row.get::<String, _>("token")),
            session_id: row.get::<Option<String>, _>("session_id").map(SessionId),
            fields: serde_json::from_str(&row.get::<String, _>("fields_json"))
                .context("stored application fields are not valid JSON")?,
            status: status_from_str(&row.get::<String, _>("status"))?,
            created_at: row.get::<DateTime<Utc>, _>("created_at"),
            last_updated: row.get::<DateTime<Utc>, _>("last_updated"),
        }))
    }

    /// Field map for an application, scoped to the session that submitted it.
    pub async fn application_for_session(
        &self,
        session_id: &SessionId,
        token: &ApplicationToken,
    ) -> Result<Option<serde_json::Value>> {
        let row = sqlx::query(
            "SELECT fields_json FROM applications WHERE token = ? AND session_id = ?",
        )
        .bind(token.as_str())
        .bind(session_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            serde_json::from_str(&r.get::<String, _>("fields_json"))
                .context("stored application fields are not valid JSON")
        })
        .transpose()
    }

    /// Removes the application, its documents, and any session pointers to it.
    /// Returns false when no such application existed.
    pub async fn delete_application(&self, token: &ApplicationToken) -> Result<bool> {
        let result = sqlx::query("DELETE FROM applications WHERE token = ?")
            .bind(token.as_str())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query("DELETE FROM documents WHERE application_token = ?")
            .bind(token.as_str())
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "UPDATE sessions SET current_application_id = NULL, application_status = NULL
             WHERE current_application_id = ?",
        )
        .bind(token.as_str())
        .execute(&self.pool)
        .await?;
        Ok(true)
    }

    /// Insert-or-replace keyed on (token, document id): re-uploading a document
    /// type overwrites the previous file, matching the original key layout.
    pub async fn upsert_document(&self, document: NewDocument<'_>) -> Result<StoredDocument> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO documents
                 (application_token, id, name, storage_path, content_type, size_bytes, content, last_modified)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(application_token, id) DO UPDATE SET
                 name = excluded.name,
                 storage_path = excluded.storage_path,
                 content_type = excluded.content_type,
                 size_bytes = excluded.size_bytes,
                 content = excluded.content,
                 last_modified = excluded.last_modified",
        )
        .bind(document.application_token.as_str())
        .bind(document.id.as_str())
        .bind(document.name)
        .bind(document.storage_path)
        .bind(document.content_type)
        .bind(document.content.len() as i64)
        .bind(document.content)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(StoredDocument {
            id: document.id.clone(),
            application_token: document.application_token.clone(),
            name: document.name.to_string(),
            storage_path: document.storage_path.to_string(),
            content_type: document.content_type.map(str::to_string),
            size_bytes: document.content.len() as u64,
            last_modified: now,
        })
    }

    pub async fn list_documents(&self, token: &ApplicationToken) -> Result<Vec<StoredDocument>> {
        let rows = sqlx::query(
            "SELECT id, name, storage_path, content_type, size_bytes, last_modified
             FROM documents WHERE application_token = ? ORDER BY id ASC",
        )
        .bind(token.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| StoredDocument {
                id: DocumentId(row.get::<String, _>("id")),
                application_token: token.clone(),
                name: row.get::<String, _>("name"),
                storage_path: row.get::<String, _>("storage_path"),
                content_type: row.get::<Option<String>, _>("content_type"),
                size_bytes: row.get::<i64, _>("size_bytes") as u64,
                last_modified: row.get::<DateTime<Utc>, _>("last_modified"),
            })
            .collect())
    }

    pub async fn delete_document(
        &self,
        token: &ApplicationToken,
        document_id: &DocumentId,
    ) -> Result<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE application_token = ? AND id = ?")
            .bind(token.as_str())
            .bind(document_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn role_to_str(role: ChatRole) -> &'static str {
    match role {
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
    }
}

fn role_from_str(raw: &str) -> Result<ChatRole> {
    match raw {
        "user" => Ok(ChatRole::User),
        "assistant" => Ok(ChatRole::Assistant),
        other => Err(anyhow!("unknown chat role '{other}'")),
    }
}

fn status_to_str(status: ApplicationStatus) -> &'static str {
    match status {
        ApplicationStatus::PendingDocuments => "pending_documents",
        ApplicationStatus::Processing => "processing",
    }
}

fn status_from_str(raw: &str) -> Result<ApplicationStatus> {
    match raw {
        "pending_documents" => Ok(ApplicationStatus::PendingDocuments),
        "processing" => Ok(ApplicationStatus::Processing),
        other => Err(anyhow!("unknown application status '{other}'")),
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
mod tests;

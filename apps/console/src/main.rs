use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client_core::{IntakeClient, SessionState};
use shared::domain::{ChatRole, DocumentId, SessionId};

#[derive(Parser, Debug)]
#[command(about = "Console shell for the home-loan intake assistant")]
struct Args {
    #[arg(long)]
    server_url: String,
    /// Reuse an existing session id instead of generating a fresh one.
    #[arg(long)]
    session_id: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send one chat message and print the reply plus the affordance state.
    Chat { message: String },
    /// Print the backend-stored transcript for this session.
    History,
    /// Submit an application from key=value fields.
    Submit { fields: Vec<String> },
    /// Verify an application token for the existing-applicant flow.
    VerifyToken { token: String },
    /// Upload a document for the effective token.
    Upload { path: PathBuf },
    /// List stored documents for the effective token.
    Documents,
    /// Delete a stored document by id.
    DeleteDocument { id: String },
    /// Cancel the application behind the effective token.
    Cancel,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let state = match args.session_id {
        Some(session_id) => SessionState::with_session_id(SessionId::new(session_id)),
        None => SessionState::new(),
    };
    let client = IntakeClient::with_state(args.server_url, state)?;
    println!("session: {}", client.snapshot().await.session_id());

    match args.command {
        Command::Chat { message } => {
            let reply = client.send_chat_message(&message).await?;
            println!("assistant: {}", reply.content);
            print_affordances(&client).await;
        }
        Command::History => {
            let count = client.refresh_history().await?;
            println!("{count} messages");
            let snapshot = client.snapshot().await;
            for message in snapshot.transcript() {
                let role = match message.role {
                    ChatRole::User => "user",
                    ChatRole::Assistant => "assistant",
                };
                println!("{role}: {}", message.content);
            }
            print_affordances(&client).await;
        }
        Command::Submit { fields } => {
            let fields = parse_fields(&fields)?;
            let submitted = client.submit_application(&fields).await?;
            println!("{}", submitted.message);
            if let Some(application_id) = submitted.application_id {
                println!("application id: {application_id}");
            }
        }
        Command::VerifyToken { token } => {
            let summary = client.verify_token(&token).await?;
            println!(
                "application {} is {:?} (created {})",
                summary.application_id, summary.status, summary.created_at
            );
        }
        Command::Upload { path } => {
            let filename = path
                .file_name()
                .and_then(|name| name.to_str())
                .context("upload path has no usable file name")?
                .to_string();
            let content = tokio::fs::read(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            let content_type = mime_guess::from_path(&path).first_raw();
            let uploaded = client
                .upload_document(&filename, content_type, content)
                .await?;
            println!("{}", uploaded.message);
            if let Some(document) = uploaded.document {
                println!("stored as {} ({} bytes)", document.id, document.size_bytes);
            }
        }
        Command::Documents => {
            let documents = client.list_documents().await?;
            if documents.is_empty() {
                println!("no documents uploaded yet");
            }
            for document in documents {
                println!(
                    "{}  {}  {} bytes  {}",
                    document.id, document.name, document.size_bytes, document.last_modified
                );
            }
        }
        Command::DeleteDocument { id } => {
            client.delete_document(&DocumentId::new(id)).await?;
            println!("document deleted");
        }
        Command::Cancel => {
            let token = client.cancel_application().await?;
            println!("application {token} cancelled");
        }
    }

    Ok(())
}

async fn print_affordances(client: &IntakeClient) {
    let flags = client.snapshot().await.flags();
    println!(
        "affordances: form={} upload={} update={} cancel={}",
        flags.show_form_button,
        flags.show_upload_button,
        flags.show_update_button,
        flags.show_cancel_button
    );
}

fn parse_fields(raw: &[String]) -> Result<Vec<(String, String)>> {
    raw.iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .with_context(|| format!("expected key=value, got '{pair}'"))
        })
        .collect()
}

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use shared::{domain::ApplicationToken, protocol::ChatMessage};

/// Produces the assistant side of a chat turn. The conversational model is an
/// external collaborator; everything behind this trait is replaceable.
#[async_trait]
pub trait ChatResponder: Send + Sync {
    async fn reply(&self, message: &str, history: &[ChatMessage]) -> Result<String>;
}

pub struct MissingChatModel;

#[async_trait]
impl ChatResponder for MissingChatModel {
    async fn reply(&self, _message: &str, _history: &[ChatMessage]) -> Result<String> {
        Err(anyhow!("chat model backend is unavailable"))
    }
}

/// Deterministic keyword responder: the built-in fallback answer table for
/// when no model backend is configured.
pub struct KeywordResponder;

#[async_trait]
impl ChatResponder for KeywordResponder {
    async fn reply(&self, message: &str, _history: &[ChatMessage]) -> Result<String> {
        Ok(keyword_reply(message))
    }
}

/// Scans a message for an application token: `HL` followed by exactly 13
/// digits, case-insensitive on input, canonical upper-case on output.
pub fn find_token(message: &str) -> Option<ApplicationToken> {
    let upper = message.to_ascii_uppercase();
    let bytes = upper.as_bytes();
    let mut i = 0;
    while i + 15 <= bytes.len() {
        if bytes[i] == b'H'
            && bytes[i + 1] == b'L'
            && bytes[i + 2..i + 15].iter().all(|b| b.is_ascii_digit())
        {
            let run_continues = bytes.get(i + 15).is_some_and(|b| b.is_ascii_digit());
            if !run_continues {
                return Some(ApplicationToken::new(&upper[i..i + 15]));
            }
        }
        i += 1;
    }
    None
}

pub(crate) fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

fn keyword_reply(message: &str) -> String {
    let lower = message.to_ascii_lowercase();

    if let Some(token) = find_token(message) {
        if contains_any(&lower, &["upload", "document", "documents", "file", "files"]) {
            return format!("Ready to upload documents for application {token}.");
        }
        if contains_any(&lower, &["edit", "modify", "change", "update"]) {
            return format!(
                "Found your application {token}. Please update your information below."
            );
        }
        if contains_any(&lower, &["cancel", "delete", "terminate"]) {
            return format!("Found your application {token}. Please confirm cancellation below.");
        }
        if contains_any(&lower, &["status", "check", "details"]) {
            return format!(
                "Found your application {token}. Ask for status, document uploads, updates, or cancellation."
            );
        }
        return format!(
            "Found your application {token}.\n\nYou can:\n- Check status/details\n- Update application\n- Upload documents\n- Cancel application\nPlease specify what you'd like to do."
        );
    }

    if contains_any(&lower, &["eligibility", "eligible", "qualify"]) {
        return "To be eligible for a home loan, you typically need: 1) Stable income for 2+ years, 2) Good credit score (750+), 3) Age between 23-70 years, 4) Debt-to-income ratio below 40%.".to_string();
    }
    if contains_any(&lower, &["interest", "rate", "emi"]) {
        return "Current home loan interest rates range from 8.5% to 11.5% per annum. Rates depend on your credit profile, loan amount, and tenure.".to_string();
    }
    if contains_any(&lower, &["documents", "papers", "required"]) {
        return "Required documents include: 1) Identity proof, 2) Address proof, 3) Income proof, 4) Bank statements, 5) Property documents.".to_string();
    }
    if contains_any(&lower, &["tenure", "duration", "repayment"]) {
        return "Home loan tenure typically ranges from 10 to 30 years. Longer tenure means lower EMI but higher total interest.".to_string();
    }
    if contains_any(&lower, &["application", "apply", "form"]) {
        return "You can apply for a home loan by clicking the 'Apply for Home Loan' button."
            .to_string();
    }
    if contains_any(&lower, &["update", "edit", "change"]) {
        return "Please provide your application token number to update your application."
            .to_string();
    }
    if contains_any(&lower, &["cancel", "delete", "terminate"]) {
        return "Please provide your application token number to cancel your application."
            .to_string();
    }

    "I'm here to help with your home loan queries! Ask me about eligibility, interest rates, documents, or application process.".to_string()
}

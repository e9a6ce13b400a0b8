//! Wire payloads carried inside relay events.
//!
//! Payloads are schema-checked here, before they reach business logic;
//! anything that is not a known report, response, or token-transfer shape is
//! a validation error.

use crate::amount::Amount;
use crate::error::BountyError;
use crate::flow::ResponseType;
use crate::relay::{EventKind, RelayEvent};
use crate::types::PaymentArtifact;
use serde::{Deserialize, Serialize};

const MAX_ID_LEN: usize = 128;
const MAX_TEXT_LEN: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportPayload {
    pub report_id: String,
    pub repo_url: String,
    #[serde(default)]
    pub file_path: Option<String>,
    pub description: String,
    #[serde(default)]
    pub suggested_fix: Option<String>,
    #[serde(default)]
    pub sender_nametag: Option<String>,
    pub deposit_amount: Amount,
    pub deposit_coin: String,
    #[serde(default)]
    pub deposit_proof_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub report_id: String,
    pub response_type: ResponseType,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub payout_amount: Option<Amount>,
    /// Event id of the report this answers.
    pub original_event_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTransferPayload {
    pub purpose: String,
    pub amount: Amount,
    pub coin: String,
    pub artifacts: Vec<PaymentArtifact>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WirePayload {
    Report(ReportPayload),
    Response(ResponsePayload),
    TokenTransfer(TokenTransferPayload),
}

impl WirePayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Report(_) => EventKind::Report,
            Self::Response(_) => EventKind::Response,
            Self::TokenTransfer(_) => EventKind::TokenTransfer,
        }
    }

    pub fn to_content(&self) -> Result<String, BountyError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn validate(&self) -> Result<(), BountyError> {
        match self {
            Self::Report(report) => {
                check_id("report_id", &report.report_id)?;
                check_text("repo_url", &report.repo_url)?;
                if !looks_like_repo_url(&report.repo_url) {
                    return Err(BountyError::Validation(format!(
                        "repo_url '{}' is not a repository locator",
                        report.repo_url
                    )));
                }
                check_text("description", &report.description)?;
                check_optional_text("file_path", report.file_path.as_deref())?;
                check_optional_text("suggested_fix", report.suggested_fix.as_deref())?;
                check_id("deposit_coin", &report.deposit_coin)
            }
            Self::Response(response) => {
                check_id("report_id", &response.report_id)?;
                check_id("original_event_id", &response.original_event_id)?;
                check_optional_text("message", response.message.as_deref())
            }
            Self::TokenTransfer(transfer) => {
                check_id("purpose", &transfer.purpose)?;
                check_id("coin", &transfer.coin)?;
                if transfer.artifacts.is_empty() {
                    return Err(BountyError::Validation(
                        "token transfer carries no artifacts".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}

/// Verify, decode, and schema-check a relay event.
pub fn decode_event(event: &RelayEvent) -> Result<WirePayload, BountyError> {
    if !event.verify() {
        return Err(BountyError::Validation(format!(
            "event '{}' failed signature verification",
            event.id
        )));
    }

    let payload: WirePayload = serde_json::from_str(&event.content)
        .map_err(|e| BountyError::Validation(format!("event '{}' payload: {e}", event.id)))?;

    if payload.kind() != event.kind {
        return Err(BountyError::Validation(format!(
            "event '{}' kind {:?} does not match payload {:?}",
            event.id,
            event.kind,
            payload.kind()
        )));
    }

    payload.validate()?;
    Ok(payload)
}

/// Canonical form used to compare repository locators.
pub fn normalize_repo_url(url: &str) -> String {
    let mut normalized = url.trim().to_ascii_lowercase();
    while normalized.ends_with('/') {
        normalized.pop();
    }
    if let Some(stripped) = normalized.strip_suffix(".git") {
        normalized = stripped.to_string();
    }
    for prefix in ["https://", "http://"] {
        if let Some(stripped) = normalized.strip_prefix(prefix) {
            normalized = stripped.to_string();
        }
    }
    if let Some(stripped) = normalized.strip_prefix("git@") {
        normalized = stripped.replacen(':', "/", 1);
    }
    normalized
}

fn looks_like_repo_url(url: &str) -> bool {
    let trimmed = url.trim();
    (trimmed.starts_with("https://") || trimmed.starts_with("http://") || trimmed.starts_with("git@"))
        && normalize_repo_url(trimmed).contains('/')
}

fn check_id(field: &str, value: &str) -> Result<(), BountyError> {
    if value.trim().is_empty() {
        return Err(BountyError::Validation(format!("{field} is empty")));
    }
    if value.len() > MAX_ID_LEN {
        return Err(BountyError::Validation(format!(
            "{field} exceeds {MAX_ID_LEN} bytes"
        )));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '.'))
    {
        return Err(BountyError::Validation(format!(
            "{field} contains unsupported characters"
        )));
    }
    Ok(())
}

fn check_text(field: &str, value: &str) -> Result<(), BountyError> {
    if value.trim().is_empty() {
        return Err(BountyError::Validation(format!("{field} is empty")));
    }
    check_optional_text(field, Some(value))
}

fn check_optional_text(field: &str, value: Option<&str>) -> Result<(), BountyError> {
    match value {
        Some(text) if text.len() > MAX_TEXT_LEN => Err(BountyError::Validation(format!(
            "{field} exceeds {MAX_TEXT_LEN} bytes"
        ))),
        _ => Ok(()),
    }
}

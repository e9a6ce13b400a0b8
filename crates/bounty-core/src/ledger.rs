//! Token ledger contract.
//!
//! The ledger is an external collaborator. The core only depends on this
//! contract: submit a commitment, wait for its inclusion proof, verify a token.
//! Signatures and proof cryptography live on the ledger side.

use crate::amount::Amount;
use crate::error::BountyError;
use crate::types::Token;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Status code marker the ledger uses for a request id it already accepted.
pub const REQUEST_ID_EXISTS: &str = "REQUEST_ID_EXISTS";

/// Outcome of a commitment submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum SubmitStatus {
    Success,
    /// An identical request was already accepted. Distinct from other
    /// failures because it drives the retry-with-another-token branch.
    RequestIdExists,
    Rejected(String),
}

impl SubmitStatus {
    /// Parse a raw ledger status string.
    pub fn from_code(code: &str) -> Self {
        let normalized = code.trim();
        if normalized.eq_ignore_ascii_case("SUCCESS") {
            Self::Success
        } else if normalized.to_ascii_uppercase().contains(REQUEST_ID_EXISTS) {
            Self::RequestIdExists
        } else {
            Self::Rejected(normalized.to_string())
        }
    }
}

/// Ledger-issued evidence that a commitment was accepted and ordered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionProof {
    pub request_id: String,
    pub proof_hash: String,
    pub round: u64,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommitmentKind {
    Transfer {
        recipient_address: String,
    },
    /// Spend of a token into a split; the mints that follow must reproduce
    /// these coin maps exactly.
    Burn {
        recipient_coins: BTreeMap<String, Amount>,
        remainder_coins: BTreeMap<String, Amount>,
    },
    Mint {
        owner_address: String,
        coins: BTreeMap<String, Amount>,
        parent_token_id: Option<String>,
    },
}

/// Signed intent submitted before a proof is available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commitment {
    pub request_id: String,
    pub token_id: String,
    pub kind: CommitmentKind,
    pub created_at: DateTime<Utc>,
}

impl Commitment {
    pub fn transfer(token: &Token, recipient_address: impl Into<String>) -> Self {
        Self {
            request_id: spend_request_id(token),
            token_id: token.id.clone(),
            kind: CommitmentKind::Transfer {
                recipient_address: recipient_address.into(),
            },
            created_at: Utc::now(),
        }
    }

    pub fn burn(
        token: &Token,
        recipient_coins: BTreeMap<String, Amount>,
        remainder_coins: BTreeMap<String, Amount>,
    ) -> Self {
        Self {
            request_id: spend_request_id(token),
            token_id: token.id.clone(),
            kind: CommitmentKind::Burn {
                recipient_coins,
                remainder_coins,
            },
            created_at: Utc::now(),
        }
    }

    pub fn mint(
        token_id: impl Into<String>,
        owner_address: impl Into<String>,
        coins: BTreeMap<String, Amount>,
        parent_token_id: Option<String>,
    ) -> Self {
        let token_id = token_id.into();
        Self {
            request_id: mint_request_id(&token_id),
            token_id,
            kind: CommitmentKind::Mint {
                owner_address: owner_address.into(),
                coins,
                parent_token_id,
            },
            created_at: Utc::now(),
        }
    }

    pub fn is_spend(&self) -> bool {
        !matches!(self.kind, CommitmentKind::Mint { .. })
    }
}

/// Request id for spending the current state of `token`. Any two spends of
/// the same state collide, which is how the ledger detects double spends.
pub fn spend_request_id(token: &Token) -> String {
    let material = format!("spend:{}:{}", token.id, token.state_hash());
    blake3::hash(material.as_bytes()).to_hex().to_string()
}

pub fn mint_request_id(token_id: &str) -> String {
    blake3::hash(format!("mint:{token_id}").as_bytes())
        .to_hex()
        .to_string()
}

/// Ledger capability consumed by the transfer engine.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Human-readable endpoint label for status and logs.
    fn endpoint(&self) -> String;

    /// Submit a spend (transfer or burn) commitment.
    async fn submit_transfer(&self, commitment: &Commitment) -> Result<SubmitStatus, BountyError>;

    async fn submit_mint(&self, commitment: &Commitment) -> Result<SubmitStatus, BountyError>;

    /// Wait until the commitment is included or `timeout` elapses.
    ///
    /// Expiry must surface as [`BountyError::LedgerTimeout`]. It does not
    /// cancel the submission, which may still land later.
    async fn wait_inclusion_proof(
        &self,
        commitment: &Commitment,
        timeout: Duration,
    ) -> Result<InclusionProof, BountyError>;

    /// True when the token's current state is minted, included, and unspent.
    async fn verify(&self, token: &Token) -> Result<bool, BountyError>;
}

use crate::amount::Amount;
use crate::error::BountyError;
use crate::flow::{Direction, ReportStatus, ResponseType};
use crate::ledger::InclusionProof;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvenanceKind {
    Mint,
    Transfer,
    SplitMint,
}

/// One link in a token's history, anchored by a ledger proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceStep {
    pub kind: ProvenanceKind,
    pub request_id: String,
    pub proof: Option<InclusionProof>,
}

/// Ledger-verifiable bearer unit owned by exactly one address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub id: String,
    /// Claim condition: the derived address of the owning identity.
    pub owner: String,
    pub coins: BTreeMap<String, Amount>,
    #[serde(default)]
    pub provenance: Vec<ProvenanceStep>,
}

impl Token {
    /// Single-coin token with no provenance yet (minting fixtures, tests).
    pub fn new(
        id: impl Into<String>,
        owner: impl Into<String>,
        coin: impl Into<String>,
        amount: Amount,
    ) -> Self {
        let mut coins = BTreeMap::new();
        coins.insert(coin.into(), amount);
        Self {
            id: id.into(),
            owner: owner.into(),
            coins,
            provenance: Vec::new(),
        }
    }

    pub fn balance(&self, coin: &str) -> Amount {
        self.coins.get(coin).cloned().unwrap_or_default()
    }

    pub fn holds(&self, coin: &str) -> bool {
        self.coins.get(coin).map(|a| !a.is_zero()).unwrap_or(false)
    }

    /// Hash of the current ownership state. Changes on every transfer.
    pub fn state_hash(&self) -> String {
        let material = serde_json::json!({
            "id": self.id,
            "owner": self.owner,
            "coins": self.coins,
            "depth": self.provenance.len(),
            "last": self.provenance.last().map(|step| step.request_id.clone()),
        });
        let bytes = serde_json::to_vec(&material).unwrap_or_default();
        blake3::hash(&bytes).to_hex().to_string()
    }
}

/// What the recipient needs to finalize receipt of a payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentArtifact {
    pub token: Token,
    pub proof: InclusionProof,
    pub split: bool,
}

/// Request entering the transfer engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub recipient: String,
    pub amount: Amount,
    pub coin: String,
    /// Purpose tag, e.g. `bounty:<report_id>` or `deposit:<report_id>`.
    pub purpose: String,
}

impl TransferRequest {
    pub fn new(
        recipient: impl Into<String>,
        amount: Amount,
        coin: impl Into<String>,
        purpose: impl Into<String>,
    ) -> Self {
        Self {
            recipient: recipient.into(),
            amount,
            coin: coin.into(),
            purpose: purpose.into(),
        }
    }
}

/// Successful transfer. `warning` is set when value moved but the artifact
/// could not be delivered over the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferOutcome {
    pub recipient: String,
    pub amount: Amount,
    pub coin: String,
    pub purpose: String,
    pub proof_ref: Option<String>,
    pub artifacts: Vec<PaymentArtifact>,
    pub event_id: Option<String>,
    pub conflicts_skipped: usize,
    pub warning: Option<String>,
}

/// Tagged command-surface result for `transfer`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferResult {
    pub success: bool,
    pub proof_ref: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<PaymentArtifact>,
    pub warning: Option<String>,
    pub reason_kind: Option<String>,
    pub reason: Option<String>,
}

impl From<Result<TransferOutcome, BountyError>> for TransferResult {
    fn from(result: Result<TransferOutcome, BountyError>) -> Self {
        match result {
            Ok(outcome) => Self {
                success: true,
                proof_ref: outcome.proof_ref,
                artifacts: outcome.artifacts,
                warning: outcome.warning,
                reason_kind: None,
                reason: None,
            },
            Err(err) => Self {
                success: false,
                proof_ref: None,
                artifacts: Vec::new(),
                warning: None,
                reason_kind: Some(err.kind().to_string()),
                reason: Some(err.to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub id: String,
    pub repo_url: String,
    pub file_path: Option<String>,
    pub description: String,
    pub suggested_fix: Option<String>,
    pub sender_pubkey: String,
    pub sender_nametag: Option<String>,
    pub recipient_pubkey: String,
    pub deposit_amount: Amount,
    pub deposit_coin: String,
    pub status: ReportStatus,
    pub direction: Direction,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub origin_event_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub report_id: String,
    pub response_type: ResponseType,
    pub message: Option<String>,
    pub payout_amount: Option<Amount>,
    pub responder_pubkey: String,
    pub created_at: DateTime<Utc>,
    pub origin_event_id: String,
}

/// Filter for report listings. Unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportFilter {
    pub inbox: Option<String>,
    pub status: Option<ReportStatus>,
    pub direction: Option<Direction>,
    pub sender: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    InFlight,
    /// Some tokens landed before the attempt failed; `paid` holds how much.
    Partial,
    Completed,
    Failed,
}

impl PaymentStatus {
    pub fn name(self) -> &'static str {
        match self {
            Self::InFlight => "in_flight",
            Self::Partial => "partial",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self, BountyError> {
        match value {
            "in_flight" => Ok(Self::InFlight),
            "partial" => Ok(Self::Partial),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(BountyError::Storage(format!(
                "unknown payment status '{other}' in storage"
            ))),
        }
    }
}

/// Idempotency key `(purpose, report_id)` guarding a report-bound payment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub purpose: String,
    pub report_id: String,
}

impl IdempotencyKey {
    pub fn new(purpose: impl Into<String>, report_id: impl Into<String>) -> Self {
        Self {
            purpose: purpose.into(),
            report_id: report_id.into(),
        }
    }

    /// `purpose:report_id`, also used as the transfer purpose tag.
    pub fn as_tag(&self) -> String {
        format!("{}:{}", self.purpose, self.report_id)
    }
}

/// Persisted payment attempt keyed by its idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub key: IdempotencyKey,
    pub recipient: String,
    pub amount: Amount,
    pub coin: String,
    pub status: PaymentStatus,
    /// Value already moved on the ledger by the recorded artifacts.
    pub paid: Amount,
    pub proof_ref: Option<String>,
    pub artifacts: Vec<PaymentArtifact>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentRecord {
    /// Value still owed to the recipient.
    pub fn remaining(&self) -> Amount {
        self.amount.checked_sub(&self.paid).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptOutcome {
    pub report_id: String,
    pub deposit_refunded: Amount,
    pub reward_paid: Amount,
    pub proof_ref: Option<String>,
    pub response_event_id: Option<String>,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectOutcome {
    pub report_id: String,
    pub deposit_kept: Amount,
    pub response_event_id: Option<String>,
    pub warning: Option<String>,
}

/// Reporter-side draft for a new report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportDraft {
    /// Reuse to retry a submission whose publish failed after the deposit.
    pub report_id: Option<String>,
    pub repo_url: String,
    pub file_path: Option<String>,
    pub description: String,
    pub suggested_fix: Option<String>,
    pub recipient_pubkey: String,
    pub sender_nametag: Option<String>,
    pub deposit_amount: Amount,
    pub deposit_coin: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitOutcome {
    pub report_id: String,
    pub event_id: String,
    pub deposit_proof_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportDetail {
    pub report: Report,
    pub responses: Vec<Response>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletSummary {
    pub identity: String,
    pub address: String,
    pub balances: BTreeMap<String, Amount>,
    pub owned_tokens: usize,
    pub archived_tokens: usize,
}

/// Daemon status snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub uptime_secs: u64,
    pub connected_relays: Vec<String>,
    pub pending_by_inbox: HashMap<String, u64>,
    pub ledger_endpoint: String,
}

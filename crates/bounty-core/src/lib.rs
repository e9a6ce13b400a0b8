//! Bounty settlement core.
//!
//! Deposit-backed bug reports settled over an external token ledger and a
//! gossip relay: a token transfer engine with split and conflict retry, a
//! report state machine whose payments are idempotent per report, an
//! ingestion pipeline that turns relay events into state exactly once per
//! event id, and a reputation ledger that derives each sender's deposit tier.

#![deny(unsafe_code)]

pub mod amount;
pub mod config;
pub mod error;
pub mod events;
pub mod flow;
pub mod identity;
pub mod ingestion;
pub mod ledger;
pub mod relay;
pub mod repository;
pub mod reputation;
pub mod runtime;
pub mod settlement;
pub mod split;
pub mod submission;
pub mod token_store;
pub mod transfer;
pub mod types;

#[cfg(test)]
mod testkit;

pub use amount::Amount;
pub use config::{EngineConfig, InboxConfig, TrackedRepo};
pub use error::BountyError;
pub use events::{
    decode_event, normalize_repo_url, ReportPayload, ResponsePayload, TokenTransferPayload,
    WirePayload,
};
pub use flow::{Direction, ReportStatus, ResponseType};
pub use identity::{derive_address, verify_signature, Identity};
pub use ingestion::{BackfillSummary, DropReason, IngestOutcome, IngestionPipeline, ListenerSettings};
pub use ledger::{
    mint_request_id, spend_request_id, Commitment, CommitmentKind, InclusionProof, LedgerClient,
    SubmitStatus, REQUEST_ID_EXISTS,
};
pub use relay::{publish_signed, EventFilter, EventKind, RelayClient, RelayEvent};
pub use repository::{ReportRepository, ReportStorageConfig};
pub use reputation::{required_deposit, DepositTier, ReputationLedger, ReputationRecord};
pub use runtime::BountyEngine;
pub use settlement::{pay_once, Inbox, Paid, SettlementCoordinator, BOUNTY_PURPOSE, DEPOSIT_PURPOSE};
pub use split::{plan_split, SplitPlan};
pub use submission::ReportSubmitter;
pub use token_store::{ArchivedToken, TokenStore};
pub use transfer::{ReconcileSummary, Settled, TransferConfig, TransferEngine};
pub use types::{
    AcceptOutcome, IdempotencyKey, PaymentArtifact, PaymentRecord, PaymentStatus, ProvenanceKind,
    ProvenanceStep, RejectOutcome, Report, ReportDetail, ReportDraft, ReportFilter, Response,
    StatusReport, SubmitOutcome, Token, TransferOutcome, TransferRequest, TransferResult,
    WalletSummary,
};

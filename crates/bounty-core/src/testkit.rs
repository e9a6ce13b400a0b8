//! In-crate fakes for unit tests. Full-featured collaborators live in
//! `bounty-adapters`.

use crate::error::BountyError;
use crate::identity::{derive_address, Identity};
use crate::ledger::{Commitment, InclusionProof, LedgerClient, SubmitStatus};
use crate::relay::{EventFilter, RelayClient, RelayEvent};
use crate::repository::{ReportRepository, ReportStorageConfig};
use crate::reputation::ReputationLedger;
use crate::token_store::TokenStore;
use crate::transfer::{TransferConfig, TransferEngine};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Ledger that accepts everything and proves immediately, except spends of
/// tokens marked with [`inject_conflict`](Self::inject_conflict).
#[derive(Default)]
pub(crate) struct AcceptingLedger {
    conflicts: Mutex<HashSet<String>>,
}

impl AcceptingLedger {
    pub fn inject_conflict(&self, token_id: &str) {
        if let Ok(mut conflicts) = self.conflicts.lock() {
            conflicts.insert(token_id.to_string());
        }
    }
}

#[async_trait]
impl LedgerClient for AcceptingLedger {
    fn endpoint(&self) -> String {
        "accepting".to_string()
    }

    async fn submit_transfer(&self, commitment: &Commitment) -> Result<SubmitStatus, BountyError> {
        let conflicted = self
            .conflicts
            .lock()
            .map(|conflicts| conflicts.contains(&commitment.token_id))
            .unwrap_or(false);
        if conflicted {
            return Ok(SubmitStatus::RequestIdExists);
        }
        Ok(SubmitStatus::Success)
    }

    async fn submit_mint(&self, _: &Commitment) -> Result<SubmitStatus, BountyError> {
        Ok(SubmitStatus::Success)
    }

    async fn wait_inclusion_proof(
        &self,
        commitment: &Commitment,
        _: Duration,
    ) -> Result<InclusionProof, BountyError> {
        Ok(InclusionProof {
            request_id: commitment.request_id.clone(),
            proof_hash: format!("proof-{}", commitment.request_id),
            round: 1,
            issued_at: Utc::now(),
        })
    }

    async fn verify(&self, _: &crate::types::Token) -> Result<bool, BountyError> {
        Ok(true)
    }
}

/// Relay that records published events.
#[derive(Default)]
pub(crate) struct RecordingRelay {
    pub published: Mutex<Vec<RelayEvent>>,
    pub offline: Mutex<bool>,
}

impl RecordingRelay {
    pub fn published(&self) -> Vec<RelayEvent> {
        self.published.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut flag) = self.offline.lock() {
            *flag = offline;
        }
    }
}

#[async_trait]
impl RelayClient for RecordingRelay {
    async fn publish(&self, event: RelayEvent) -> Result<String, BountyError> {
        if self.offline.lock().map(|flag| *flag).unwrap_or(false) {
            return Err(BountyError::Transport("relay offline".to_string()));
        }
        let id = event.id.clone();
        if let Ok(mut published) = self.published.lock() {
            published.push(event);
        }
        Ok(id)
    }

    async fn subscribe(&self, _: EventFilter) -> Result<mpsc::Receiver<RelayEvent>, BountyError> {
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }

    async fn query_once(&self, filter: &EventFilter) -> Result<Vec<RelayEvent>, BountyError> {
        Ok(self
            .published()
            .into_iter()
            .filter(|event| filter.matches(event))
            .collect())
    }

    fn connected_relays(&self) -> Vec<String> {
        vec!["recording".to_string()]
    }
}

pub(crate) struct Fixture {
    pub identity: Identity,
    pub repository: ReportRepository,
    pub reputation: ReputationLedger,
    pub wallet: Arc<TransferEngine>,
    pub ledger: Arc<AcceptingLedger>,
    pub relay: Arc<RecordingRelay>,
}

pub(crate) async fn fixture() -> Fixture {
    let identity = Identity::generate();
    let repository = ReportRepository::connect(&ReportStorageConfig::memory())
        .await
        .unwrap();
    let reputation = ReputationLedger::new(repository.pool().clone());
    let relay = Arc::new(RecordingRelay::default());
    let ledger = Arc::new(AcceptingLedger::default());
    let root = std::env::temp_dir().join(format!("bounty-fixture-{}", uuid::Uuid::new_v4()));
    let store = Arc::new(TokenStore::open(root, identity.public_key()).unwrap());
    let wallet = Arc::new(TransferEngine::new(
        identity.clone(),
        store,
        ledger.clone(),
        relay.clone(),
        TransferConfig::default(),
    ));
    Fixture {
        identity,
        repository,
        reputation,
        wallet,
        ledger,
        relay,
    }
}

pub(crate) fn fund(wallet: &TransferEngine, id: &str, coin: &str, amount: u64) {
    let owner = derive_address(&wallet.identity().public_key());
    wallet
        .store()
        .add(crate::types::Token::new(id, owner, coin, amount.into()))
        .unwrap();
}

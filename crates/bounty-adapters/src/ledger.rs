use async_trait::async_trait;
use bounty_core::{
    derive_address, spend_request_id, Amount, BountyError, Commitment, CommitmentKind,
    InclusionProof, LedgerClient, ProvenanceKind, ProvenanceStep, SubmitStatus, Token,
};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Default)]
struct LedgerState {
    /// Token ids that exist on the ledger, with the coins they were minted with.
    minted: HashMap<String, BTreeMap<String, Amount>>,
    /// Spend request ids already accepted.
    spent: HashSet<String>,
    burned: HashSet<String>,
    proofs: HashMap<String, InclusionProof>,
    /// Token ids whose next spend reports a duplicate request.
    conflicts: HashSet<String>,
    stall_proofs: bool,
    round: u64,
    submissions: Vec<Commitment>,
}

impl LedgerState {
    fn include(&mut self, request_id: &str) -> InclusionProof {
        self.round += 1;
        let proof = InclusionProof {
            request_id: request_id.to_string(),
            proof_hash: blake3::hash(format!("{}:{request_id}", self.round).as_bytes())
                .to_hex()
                .to_string(),
            round: self.round,
            issued_at: Utc::now(),
        };
        self.proofs.insert(request_id.to_string(), proof.clone());
        proof
    }
}

/// Deterministic in-process ledger.
///
/// Spends are keyed by the token's state, so spending the same state twice
/// reports a duplicate request, as the real network does.
#[derive(Debug, Default)]
pub struct MockLedger {
    state: Mutex<LedgerState>,
}

impl MockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a genesis token owned by `owner_pubkey`.
    pub fn issue(
        &self,
        token_id: &str,
        owner_pubkey: &str,
        coin: &str,
        amount: impl Into<Amount>,
    ) -> Result<Token, BountyError> {
        let mut state = self.lock()?;
        let mut token = Token::new(token_id, derive_address(owner_pubkey), coin, amount.into());
        if state.minted.contains_key(token_id) {
            return Err(BountyError::Validation(format!(
                "token '{token_id}' already minted"
            )));
        }
        let request_id = bounty_core::mint_request_id(token_id);
        let proof = state.include(&request_id);
        token.provenance.push(ProvenanceStep {
            kind: ProvenanceKind::Mint,
            request_id,
            proof: Some(proof),
        });
        state.minted.insert(token_id.to_string(), token.coins.clone());
        Ok(token)
    }

    /// Make the next spend of `token_id` report a duplicate request.
    pub fn inject_conflict(&self, token_id: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.conflicts.insert(token_id.to_string());
        }
    }

    /// While set, proof waits expire with a ledger timeout.
    pub fn stall_proofs(&self, stall: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.stall_proofs = stall;
        }
    }

    /// Every commitment submitted so far, accepted or not.
    pub fn submissions(&self) -> Vec<Commitment> {
        self.state
            .lock()
            .map(|state| state.submissions.clone())
            .unwrap_or_default()
    }

    /// Accepted spends (transfers and burns).
    pub fn spend_count(&self) -> usize {
        self.state.lock().map(|state| state.spent.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LedgerState>, BountyError> {
        self.state
            .lock()
            .map_err(|_| BountyError::Ledger("mock ledger lock poisoned".to_string()))
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    fn endpoint(&self) -> String {
        "mock://ledger".to_string()
    }

    async fn submit_transfer(&self, commitment: &Commitment) -> Result<SubmitStatus, BountyError> {
        let mut state = self.lock()?;
        state.submissions.push(commitment.clone());

        if state.conflicts.remove(&commitment.token_id) || state.spent.contains(&commitment.request_id) {
            debug!(token_id = %commitment.token_id, "mock ledger: duplicate request");
            return Ok(SubmitStatus::RequestIdExists);
        }
        if !state.minted.contains_key(&commitment.token_id) || state.burned.contains(&commitment.token_id) {
            return Ok(SubmitStatus::Rejected("TOKEN_NOT_FOUND".to_string()));
        }
        if !commitment.is_spend() {
            return Ok(SubmitStatus::Rejected("NOT_A_SPEND".to_string()));
        }

        if matches!(commitment.kind, CommitmentKind::Burn { .. }) {
            state.burned.insert(commitment.token_id.clone());
        }
        state.spent.insert(commitment.request_id.clone());
        state.include(&commitment.request_id);
        Ok(SubmitStatus::Success)
    }

    async fn submit_mint(&self, commitment: &Commitment) -> Result<SubmitStatus, BountyError> {
        let mut state = self.lock()?;
        state.submissions.push(commitment.clone());

        let CommitmentKind::Mint {
            coins,
            parent_token_id,
            ..
        } = &commitment.kind
        else {
            return Ok(SubmitStatus::Rejected("NOT_A_MINT".to_string()));
        };

        if state.proofs.contains_key(&commitment.request_id) {
            return Ok(SubmitStatus::RequestIdExists);
        }
        if let Some(parent) = parent_token_id {
            if !state.burned.contains(parent) {
                return Ok(SubmitStatus::Rejected("PARENT_NOT_BURNED".to_string()));
            }
        }

        state.minted.insert(commitment.token_id.clone(), coins.clone());
        state.include(&commitment.request_id);
        Ok(SubmitStatus::Success)
    }

    async fn wait_inclusion_proof(
        &self,
        commitment: &Commitment,
        timeout: Duration,
    ) -> Result<InclusionProof, BountyError> {
        let state = self.lock()?;
        if state.stall_proofs {
            return Err(BountyError::LedgerTimeout(format!(
                "request '{}' not included within {}s",
                commitment.request_id,
                timeout.as_secs()
            )));
        }
        state
            .proofs
            .get(&commitment.request_id)
            .cloned()
            .ok_or_else(|| BountyError::Ledger(format!("unknown request '{}'", commitment.request_id)))
    }

    async fn verify(&self, token: &Token) -> Result<bool, BountyError> {
        let state = self.lock()?;
        Ok(state.minted.contains_key(&token.id)
            && !state.burned.contains(&token.id)
            && !state.spent.contains(&spend_request_id(token)))
    }
}

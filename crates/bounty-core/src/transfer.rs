//! Token transfer engine.
//!
//! Drives the commit/proof protocol for one payment: select owned tokens,
//! verify each against the ledger, transfer whole tokens or split the last
//! one, and retry with another token when the ledger reports a duplicate
//! request for the selected one.

use crate::amount::Amount;
use crate::error::BountyError;
use crate::events::{TokenTransferPayload, WirePayload};
use crate::identity::{derive_address, Identity};
use crate::ledger::{Commitment, InclusionProof, LedgerClient, SubmitStatus};
use crate::relay::{publish_signed, EventKind, RelayClient};
use crate::split::plan_split;
use crate::token_store::TokenStore;
use crate::types::{
    PaymentArtifact, ProvenanceKind, ProvenanceStep, Token, TransferOutcome, TransferRequest,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Bound on each inclusion-proof wait.
    pub proof_timeout: Duration,
    /// Bound on artifact delivery over the relay.
    pub publish_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            proof_timeout: Duration::from_secs(30),
            publish_timeout: Duration::from_secs(10),
        }
    }
}

/// Ledger-side result of a payment, before artifact delivery.
#[derive(Debug, Clone, Default)]
pub struct Settled {
    /// Sum of the paid coin carried by `artifacts`.
    pub paid: Amount,
    pub proof_ref: Option<String>,
    pub artifacts: Vec<PaymentArtifact>,
    pub conflicts_skipped: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileSummary {
    pub identity: String,
    pub checked: usize,
    pub archived: usize,
    pub balances: BTreeMap<String, Amount>,
}

/// Transfer engine bound to one wallet identity.
pub struct TransferEngine {
    identity: Identity,
    store: Arc<TokenStore>,
    ledger: Arc<dyn LedgerClient>,
    relay: Arc<dyn RelayClient>,
    config: TransferConfig,
}

impl TransferEngine {
    pub fn new(
        identity: Identity,
        store: Arc<TokenStore>,
        ledger: Arc<dyn LedgerClient>,
        relay: Arc<dyn RelayClient>,
        config: TransferConfig,
    ) -> Self {
        Self {
            identity,
            store,
            ledger,
            relay,
            config,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    /// Pay `request.amount` to `request.recipient` and deliver the artifacts.
    ///
    /// Relay failure after the ledger settled is a success with a warning:
    /// value has moved and recovery is retransmission, not a second payment.
    ///
    /// A failure after some tokens moved still delivers those tokens before
    /// the error is returned.
    pub async fn transfer(&self, request: &TransferRequest) -> Result<TransferOutcome, BountyError> {
        let mut settled = Settled::default();
        if let Err(err) = self.pay_into(request, &mut settled).await {
            if !settled.artifacts.is_empty() {
                warn!(
                    recipient = %request.recipient,
                    paid = %settled.paid,
                    amount = %request.amount,
                    error = %err,
                    "transfer failed part way, delivering the tokens already moved"
                );
                if let Err(deliver_err) = self
                    .deliver(
                        &request.recipient,
                        &request.purpose,
                        &settled.paid,
                        &request.coin,
                        &settled.artifacts,
                    )
                    .await
                {
                    warn!(error = %deliver_err, "partial artifact delivery failed");
                }
            }
            return Err(err);
        }

        let mut outcome = TransferOutcome {
            recipient: request.recipient.clone(),
            amount: request.amount.clone(),
            coin: request.coin.clone(),
            purpose: request.purpose.clone(),
            proof_ref: settled.proof_ref,
            artifacts: settled.artifacts,
            event_id: None,
            conflicts_skipped: settled.conflicts_skipped,
            warning: None,
        };

        if outcome.artifacts.is_empty() {
            return Ok(outcome);
        }

        match self
            .deliver(
                &request.recipient,
                &request.purpose,
                &request.amount,
                &request.coin,
                &outcome.artifacts,
            )
            .await
        {
            Ok(event_id) => outcome.event_id = Some(event_id),
            Err(err) => {
                warn!(
                    recipient = %request.recipient,
                    purpose = %request.purpose,
                    error = %err,
                    "payment settled but artifact delivery failed"
                );
                outcome.warning = Some(format!(
                    "payment settled on the ledger but artifact delivery failed: {err}"
                ));
            }
        }
        Ok(outcome)
    }

    /// Ledger half of a transfer: selection, commit, proof, archival.
    pub async fn pay(&self, request: &TransferRequest) -> Result<Settled, BountyError> {
        let mut settled = Settled::default();
        self.pay_into(request, &mut settled).await?;
        Ok(settled)
    }

    /// Like [`pay`](Self::pay), but every artifact that lands on the ledger is
    /// pushed into `settled` as it lands. On error `settled` still holds the
    /// tokens already moved, so callers can record partial progress.
    pub async fn pay_into(
        &self,
        request: &TransferRequest,
        settled: &mut Settled,
    ) -> Result<(), BountyError> {
        let coin = request.coin.as_str();
        if request.amount.is_zero() {
            debug!(purpose = %request.purpose, "zero-amount transfer is a no-op");
            return Ok(());
        }
        if request.recipient.trim().is_empty() {
            return Err(BountyError::Validation("transfer recipient is empty".to_string()));
        }

        self.store.reload()?;
        let available = spendable_total(&self.store.candidates(coin)?, coin);
        if available < request.amount {
            return Err(BountyError::InsufficientBalance {
                coin: coin.to_string(),
                required: request.amount.to_string(),
                available: available.to_string(),
            });
        }

        let recipient_address = derive_address(&request.recipient);
        let mut tried: HashSet<String> = HashSet::new();
        let mut remaining = request.amount.clone();
        let mut conflicts = 0;

        while !remaining.is_zero() {
            self.store.reload()?;
            let next = self
                .store
                .candidates(coin)?
                .into_iter()
                .find(|token| !tried.contains(&token.id));

            let Some(token) = next else {
                if conflicts > 0 {
                    return Err(BountyError::CandidatesExhausted {
                        coin: coin.to_string(),
                        attempts: conflicts,
                    });
                }
                return Err(BountyError::InsufficientBalance {
                    coin: coin.to_string(),
                    required: remaining.to_string(),
                    available: "0".to_string(),
                });
            };
            tried.insert(token.id.clone());

            if !self.ledger.verify(&token).await? {
                warn!(token_id = %token.id, "token failed ledger verification, archiving");
                self.store.archive(&token.id, "failed ledger verification")?;
                continue;
            }

            let balance = token.balance(coin);
            let step = if balance <= remaining {
                if token.coins.len() > 1 {
                    debug!(token_id = %token.id, "multi-coin token cannot be moved whole, skipping");
                    continue;
                }
                self.full_transfer(&token, &recipient_address).await
            } else {
                self.split_transfer(&token, coin, &remaining, &recipient_address)
                    .await
            };

            match step {
                Ok(artifact) => {
                    let paid = artifact.token.balance(coin);
                    remaining = remaining.checked_sub(&paid).unwrap_or_default();
                    settled.paid += &paid;
                    settled.proof_ref = Some(artifact.proof.proof_hash.clone());
                    settled.artifacts.push(artifact);
                }
                Err(BountyError::LedgerConflict(token_id)) => {
                    warn!(token_id = %token_id, "duplicate request on ledger, archiving token and retrying");
                    self.store.archive(&token_id, "ledger reported duplicate request")?;
                    conflicts += 1;
                    settled.conflicts_skipped += 1;
                }
                Err(err) => return Err(err),
            }
        }

        info!(
            recipient = %request.recipient,
            amount = %request.amount,
            coin,
            purpose = %request.purpose,
            tokens = settled.artifacts.len(),
            conflicts,
            "transfer settled on ledger"
        );
        Ok(())
    }

    /// Publish payment artifacts to the recipient.
    pub async fn deliver(
        &self,
        recipient: &str,
        purpose: &str,
        amount: &Amount,
        coin: &str,
        artifacts: &[PaymentArtifact],
    ) -> Result<String, BountyError> {
        let payload = WirePayload::TokenTransfer(TokenTransferPayload {
            purpose: purpose.to_string(),
            amount: amount.clone(),
            coin: coin.to_string(),
            artifacts: artifacts.to_vec(),
        });
        publish_signed(
            self.relay.as_ref(),
            &self.identity,
            EventKind::TokenTransfer,
            recipient,
            payload.to_content()?,
            self.config.publish_timeout,
        )
        .await
    }

    /// Accept delivered tokens into this wallet. Tokens not owned by this
    /// identity's address or failing verification are skipped.
    pub async fn receive(&self, artifacts: &[PaymentArtifact]) -> Result<usize, BountyError> {
        let address = self.store.address();
        let mut added = 0;
        for artifact in artifacts {
            let token = &artifact.token;
            if token.owner != address {
                warn!(token_id = %token.id, owner = %token.owner, "delivered token not addressed to this wallet");
                continue;
            }
            if !self.ledger.verify(token).await? {
                warn!(token_id = %token.id, "delivered token failed ledger verification");
                continue;
            }
            if self.store.add(token.clone())? {
                info!(token_id = %token.id, owner = %self.identity.public_key(), "token received");
                added += 1;
            }
        }
        Ok(added)
    }

    /// Re-verify every owned token and archive the invalid ones.
    pub async fn reconcile(&self) -> Result<ReconcileSummary, BountyError> {
        self.store.reload()?;
        let mut checked = 0;
        let mut archived = 0;
        for token in self.store.list()? {
            checked += 1;
            if !self.ledger.verify(&token).await? {
                self.store.archive(&token.id, "reconcile: failed ledger verification")?;
                archived += 1;
            }
        }
        if archived > 0 {
            warn!(identity = %self.identity.public_key(), archived, "reconcile archived stale tokens");
        }
        Ok(ReconcileSummary {
            identity: self.identity.public_key(),
            checked,
            archived,
            balances: self.store.balances()?,
        })
    }

    async fn full_transfer(
        &self,
        token: &Token,
        recipient_address: &str,
    ) -> Result<PaymentArtifact, BountyError> {
        let commitment = Commitment::transfer(token, recipient_address);
        self.submit_spend(&commitment).await?;
        let proof = self.await_proof(&commitment).await?;

        let mut delivered = token.clone();
        delivered.owner = recipient_address.to_string();
        delivered.provenance.push(ProvenanceStep {
            kind: ProvenanceKind::Transfer,
            request_id: commitment.request_id.clone(),
            proof: Some(proof.clone()),
        });

        self.store.archive(&token.id, "transferred")?;
        debug!(token_id = %token.id, "full transfer included");
        Ok(PaymentArtifact {
            token: delivered,
            proof,
            split: false,
        })
    }

    async fn split_transfer(
        &self,
        token: &Token,
        coin: &str,
        amount: &Amount,
        recipient_address: &str,
    ) -> Result<PaymentArtifact, BountyError> {
        let plan = plan_split(token, coin, amount)?;
        if !plan.conserves(token) {
            return Err(BountyError::Validation(format!(
                "split plan for token '{}' does not conserve balance",
                token.id
            )));
        }

        let burn = Commitment::burn(
            token,
            plan.recipient_coins.clone(),
            plan.remainder_coins.clone(),
        );
        self.submit_spend(&burn).await?;
        self.await_proof(&burn).await?;

        // The parent is gone on the ledger once the burn is included.
        self.store.archive(&token.id, "burned for split")?;

        let (recipient_id, remainder_id) = plan.child_ids(&burn.request_id);
        let (recipient_token, recipient_proof) = self
            .mint_child(token, recipient_id, recipient_address, plan.recipient_coins)
            .await?;
        let (remainder_token, _) = self
            .mint_child(token, remainder_id, &self.store.address(), plan.remainder_coins)
            .await?;

        let remainder_id = remainder_token.id.clone();
        self.store.add(remainder_token)?;
        debug!(
            parent = %token.id,
            recipient_token = %recipient_token.id,
            remainder_token = %remainder_id,
            "split transfer included"
        );

        Ok(PaymentArtifact {
            token: recipient_token,
            proof: recipient_proof,
            split: true,
        })
    }

    async fn mint_child(
        &self,
        parent: &Token,
        token_id: String,
        owner_address: &str,
        coins: BTreeMap<String, Amount>,
    ) -> Result<(Token, InclusionProof), BountyError> {
        let commitment = Commitment::mint(
            token_id.clone(),
            owner_address,
            coins.clone(),
            Some(parent.id.clone()),
        );
        match self.ledger.submit_mint(&commitment).await? {
            SubmitStatus::Success => {}
            // Child ids are deterministic, so an earlier attempt's mint is ours.
            SubmitStatus::RequestIdExists => {
                debug!(token_id = %token_id, "mint already submitted, awaiting proof");
            }
            SubmitStatus::Rejected(status) => {
                return Err(BountyError::Ledger(format!(
                    "mint of token '{token_id}' rejected: {status}"
                )));
            }
        }
        let proof = self.await_proof(&commitment).await?;

        let mut provenance = parent.provenance.clone();
        provenance.push(ProvenanceStep {
            kind: ProvenanceKind::SplitMint,
            request_id: commitment.request_id.clone(),
            proof: Some(proof.clone()),
        });

        Ok((
            Token {
                id: token_id,
                owner: owner_address.to_string(),
                coins,
                provenance,
            },
            proof,
        ))
    }

    async fn submit_spend(&self, commitment: &Commitment) -> Result<(), BountyError> {
        match self.ledger.submit_transfer(commitment).await? {
            SubmitStatus::Success => Ok(()),
            SubmitStatus::RequestIdExists => {
                Err(BountyError::LedgerConflict(commitment.token_id.clone()))
            }
            SubmitStatus::Rejected(status) => Err(BountyError::Ledger(format!(
                "spend of token '{}' rejected: {status}",
                commitment.token_id
            ))),
        }
    }

    /// Bounded proof wait. A timeout fails this operation only; the
    /// submission may still land and is caught by verification before reuse.
    async fn await_proof(&self, commitment: &Commitment) -> Result<InclusionProof, BountyError> {
        let timeout = self.config.proof_timeout;
        let wait = self.ledger.wait_inclusion_proof(commitment, timeout);
        match tokio::time::timeout(timeout + Duration::from_secs(1), wait).await {
            Ok(result) => result,
            Err(_) => Err(BountyError::LedgerTimeout(format!(
                "no inclusion proof for request '{}' within {}s",
                commitment.request_id,
                timeout.as_secs()
            ))),
        }
    }
}

fn spendable_total(tokens: &[Token], coin: &str) -> Amount {
    let mut total = Amount::zero();
    for token in tokens {
        total += &token.balance(coin);
    }
    total
}

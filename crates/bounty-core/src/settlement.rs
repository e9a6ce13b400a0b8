//! Report settlement.
//!
//! `accept` runs pay -> mark accepted -> publish -> persist response, in
//! that order. Each report-bound payment goes through a persisted payment
//! record keyed by `purpose:report_id`, so re-entry after a crash between
//! paying and marking the report never pays twice.

use crate::amount::Amount;
use crate::config::TrackedRepo;
use crate::error::BountyError;
use crate::events::{ResponsePayload, WirePayload};
use crate::flow::{Direction, ReportStatus, ResponseType};
use crate::identity::Identity;
use crate::relay::{publish_signed, EventKind, RelayClient};
use crate::repository::ReportRepository;
use crate::reputation::ReputationLedger;
use crate::transfer::{Settled, TransferEngine};
use crate::types::{
    AcceptOutcome, IdempotencyKey, PaymentArtifact, PaymentStatus, RejectOutcome, Report,
    Response, TransferRequest,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

pub const BOUNTY_PURPOSE: &str = "bounty";
pub const DEPOSIT_PURPOSE: &str = "deposit";

/// A receiving identity: its wallet and the repositories it tracks.
pub struct Inbox {
    pub wallet: Arc<TransferEngine>,
    pub repos: Vec<TrackedRepo>,
}

impl Inbox {
    pub fn pubkey(&self) -> String {
        self.wallet.identity().public_key()
    }

    pub fn default_reward(&self, repo_url: &str) -> Option<Amount> {
        self.repos
            .iter()
            .find(|repo| repo.matches(repo_url))
            .and_then(|repo| repo.default_reward.clone())
    }
}

/// Result of an idempotent report-bound payment.
#[derive(Debug, Clone, Default)]
pub struct Paid {
    pub proof_ref: Option<String>,
    pub artifacts: Vec<PaymentArtifact>,
    pub warning: Option<String>,
}

/// Pay `amount` once per idempotency key.
///
/// A completed record skips the ledger and only re-delivers its artifacts;
/// receivers ignore tokens they already hold. Tokens that landed before a
/// failure are recorded with the amount they carried, and a retry pays only
/// the remainder of the originally recorded amount. A ledger timeout leaves
/// the record in flight because the submission may still land.
pub async fn pay_once(
    repository: &ReportRepository,
    wallet: &TransferEngine,
    key: &IdempotencyKey,
    recipient: &str,
    amount: &Amount,
    coin: &str,
) -> Result<Paid, BountyError> {
    let tag = key.as_tag();
    let mut settled = Settled::default();
    let mut target = (recipient.to_string(), amount.clone(), coin.to_string());

    if let Some(record) = repository.payment(key).await? {
        match record.status {
            PaymentStatus::Completed => {
                info!(key = %tag, "payment already completed, not paying again");
                let warning = redeliver(wallet, &tag, &record.recipient, &record.amount, &record.coin, &record.artifacts).await;
                return Ok(Paid {
                    proof_ref: record.proof_ref,
                    artifacts: record.artifacts,
                    warning,
                });
            }
            PaymentStatus::InFlight => {
                warn!(key = %tag, "previous payment attempt never finished; reconciling wallet before retry");
                wallet.reconcile().await?;
            }
            PaymentStatus::Partial | PaymentStatus::Failed => {}
        }
        if !record.paid.is_zero() {
            info!(
                key = %tag,
                paid = %record.paid,
                remaining = %record.remaining(),
                "resuming partially paid payment"
            );
            target = (record.recipient.clone(), record.amount.clone(), record.coin.clone());
            settled.paid = record.paid;
            settled.proof_ref = record.proof_ref;
            settled.artifacts = record.artifacts;
        }
    }
    let (recipient, amount, coin) = target;

    repository.begin_payment(key, &recipient, &amount, &coin).await?;
    let paid_before = settled.paid.clone();
    let landed_before = settled.artifacts.len();
    let remaining = amount.checked_sub(&paid_before).unwrap_or_default();
    let request = TransferRequest::new(&recipient, remaining.clone(), &coin, tag.clone());

    if let Err(err) = wallet.pay_into(&request, &mut settled).await {
        let timed_out = matches!(err, BountyError::LedgerTimeout(_));
        if settled.paid.is_zero() {
            if !timed_out {
                repository.fail_payment(key).await?;
            }
        } else {
            let status = if timed_out {
                PaymentStatus::InFlight
            } else {
                PaymentStatus::Partial
            };
            repository
                .record_partial(key, status, &settled.paid, settled.proof_ref.as_deref(), &settled.artifacts)
                .await?;
            repository.flush().await?;
            let fresh = &settled.artifacts[landed_before..];
            let moved = settled.paid.checked_sub(&paid_before).unwrap_or_default();
            redeliver(wallet, &tag, &recipient, &moved, &coin, fresh).await;
        }
        warn!(key = %tag, paid = %settled.paid, amount = %amount, error = %err, "payment failed");
        return Err(err);
    }

    repository
        .complete_payment(key, settled.proof_ref.as_deref(), &settled.artifacts)
        .await?;
    repository.flush().await?;

    let warning = redeliver(
        wallet,
        &tag,
        &recipient,
        &remaining,
        &coin,
        &settled.artifacts[landed_before..],
    )
    .await;
    Ok(Paid {
        proof_ref: settled.proof_ref,
        artifacts: settled.artifacts,
        warning,
    })
}

async fn redeliver(
    wallet: &TransferEngine,
    tag: &str,
    recipient: &str,
    amount: &Amount,
    coin: &str,
    artifacts: &[PaymentArtifact],
) -> Option<String> {
    if artifacts.is_empty() {
        return None;
    }
    match wallet.deliver(recipient, tag, amount, coin, artifacts).await {
        Ok(_) => None,
        Err(err) => {
            warn!(key = tag, error = %err, "payment settled but artifact delivery failed");
            Some(format!(
                "payment settled on the ledger but artifact delivery failed: {err}"
            ))
        }
    }
}

pub struct SettlementCoordinator {
    repository: ReportRepository,
    reputation: ReputationLedger,
    relay: Arc<dyn RelayClient>,
    publish_timeout: Duration,
}

impl SettlementCoordinator {
    pub fn new(
        repository: ReportRepository,
        reputation: ReputationLedger,
        relay: Arc<dyn RelayClient>,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            repository,
            reputation,
            relay,
            publish_timeout,
        }
    }

    /// Accept a pending report: refund the deposit plus the reward.
    ///
    /// Reward precedence: explicit argument, then the inbox's default for the
    /// report's repository, then zero. If the payment fails the report stays
    /// pending.
    pub async fn accept(
        &self,
        report_id: &str,
        inbox: &Inbox,
        message: Option<String>,
        reward: Option<Amount>,
    ) -> Result<AcceptOutcome, BountyError> {
        let report = self.pending_report(report_id, inbox).await?;
        let key = IdempotencyKey::new(BOUNTY_PURPOSE, &report.id);
        let requested = reward
            .or_else(|| inbox.default_reward(&report.repo_url))
            .unwrap_or_default();
        let requested_total = &report.deposit_amount + &requested;

        // An earlier attempt that moved (or may have moved) value fixes the payout.
        let total = match self.repository.payment(&key).await? {
            Some(record) if record.status != PaymentStatus::Failed => {
                if record.amount != requested_total {
                    warn!(
                        report_id = %report.id,
                        recorded = %record.amount,
                        requested = %requested_total,
                        "payout already fixed by an earlier attempt, ignoring requested reward"
                    );
                }
                record.amount
            }
            _ => requested_total,
        };
        let reward = total
            .checked_sub(&report.deposit_amount)
            .unwrap_or_default();

        let paid = if total.is_zero() {
            Paid::default()
        } else {
            pay_once(
                &self.repository,
                &inbox.wallet,
                &key,
                &report.sender_pubkey,
                &total,
                &report.deposit_coin,
            )
            .await?
        };

        self.repository
            .transition_status(&report.id, ReportStatus::Pending, ReportStatus::Accepted)
            .await?;
        self.reputation.record_accepted(&report.sender_pubkey).await?;
        info!(report_id = %report.id, payout = %total, "report accepted");

        let payout = (!total.is_zero()).then(|| total.clone());
        let (response_event_id, publish_warning) = self
            .respond(
                inbox.wallet.identity(),
                &report,
                ResponseType::Accepted,
                message,
                payout,
            )
            .await?;
        self.repository.flush().await?;

        Ok(AcceptOutcome {
            report_id: report.id,
            deposit_refunded: report.deposit_amount,
            reward_paid: reward,
            proof_ref: paid.proof_ref,
            response_event_id,
            warning: join_warnings(paid.warning, publish_warning),
        })
    }

    /// Reject a pending report. No payment; the deposit is kept.
    pub async fn reject(
        &self,
        report_id: &str,
        inbox: &Inbox,
        reason: String,
    ) -> Result<RejectOutcome, BountyError> {
        let report = self.pending_report(report_id, inbox).await?;

        self.repository
            .transition_status(&report.id, ReportStatus::Pending, ReportStatus::Rejected)
            .await?;
        self.reputation.record_rejected(&report.sender_pubkey).await?;
        info!(report_id = %report.id, deposit_kept = %report.deposit_amount, "report rejected");

        let (response_event_id, warning) = self
            .respond(
                inbox.wallet.identity(),
                &report,
                ResponseType::Rejected,
                Some(reason),
                None,
            )
            .await?;
        self.repository.flush().await?;

        Ok(RejectOutcome {
            report_id: report.id,
            deposit_kept: report.deposit_amount,
            response_event_id,
            warning,
        })
    }

    /// Archive a decided report.
    pub async fn complete(&self, report_id: &str) -> Result<Report, BountyError> {
        let report = self
            .repository
            .get_report(report_id)
            .await?
            .ok_or_else(|| BountyError::NotFound(format!("report '{report_id}'")))?;

        self.repository
            .transition_status(&report.id, report.status, ReportStatus::Completed)
            .await?;
        self.repository.flush().await?;
        info!(report_id, from = report.status.name(), "report completed");

        self.repository
            .get_report(report_id)
            .await?
            .ok_or_else(|| BountyError::NotFound(format!("report '{report_id}'")))
    }

    /// Republish the artifacts of a completed payment. Never touches the
    /// ledger.
    pub async fn retransmit(
        &self,
        report: &Report,
        wallet: &TransferEngine,
    ) -> Result<String, BountyError> {
        let purpose = match report.direction {
            Direction::Received => BOUNTY_PURPOSE,
            Direction::Sent => DEPOSIT_PURPOSE,
        };
        let key = IdempotencyKey::new(purpose, &report.id);
        let record = self
            .repository
            .payment(&key)
            .await?
            .filter(|record| record.status == PaymentStatus::Completed && !record.artifacts.is_empty())
            .ok_or_else(|| BountyError::NotFound(format!("completed payment '{}'", key.as_tag())))?;

        let event_id = wallet
            .deliver(
                &record.recipient,
                &key.as_tag(),
                &record.amount,
                &record.coin,
                &record.artifacts,
            )
            .await?;
        info!(report_id = %report.id, event_id = %event_id, "payment artifacts retransmitted");
        Ok(event_id)
    }

    async fn pending_report(&self, report_id: &str, inbox: &Inbox) -> Result<Report, BountyError> {
        let report = self
            .repository
            .get_report(report_id)
            .await?
            .ok_or_else(|| BountyError::NotFound(format!("report '{report_id}'")))?;

        if report.direction != Direction::Received || report.recipient_pubkey != inbox.pubkey() {
            return Err(BountyError::NotFound(format!(
                "report '{report_id}' in inbox '{}'",
                inbox.pubkey()
            )));
        }
        if report.status != ReportStatus::Pending {
            return Err(BountyError::AlreadySettled {
                report_id: report.id,
                status: report.status.name().to_string(),
            });
        }
        Ok(report)
    }

    /// Publish the response, then persist it. A publish failure is kept as a
    /// warning and the response is stored under a local id.
    async fn respond(
        &self,
        identity: &Identity,
        report: &Report,
        response_type: ResponseType,
        message: Option<String>,
        payout_amount: Option<Amount>,
    ) -> Result<(Option<String>, Option<String>), BountyError> {
        let payload = WirePayload::Response(ResponsePayload {
            report_id: report.id.clone(),
            response_type,
            message: message.clone(),
            payout_amount: payout_amount.clone(),
            original_event_id: report.origin_event_id.clone(),
        });

        let (event_id, warning) = match publish_signed(
            self.relay.as_ref(),
            identity,
            EventKind::Response,
            &report.sender_pubkey,
            payload.to_content()?,
            self.publish_timeout,
        )
        .await
        {
            Ok(event_id) => (Some(event_id), None),
            Err(err) => {
                warn!(report_id = %report.id, error = %err, "response publish failed");
                (None, Some(format!("response not delivered to reporter: {err}")))
            }
        };

        let response = Response {
            id: Uuid::new_v4().to_string(),
            report_id: report.id.clone(),
            response_type,
            message,
            payout_amount,
            responder_pubkey: identity.public_key(),
            created_at: Utc::now(),
            origin_event_id: event_id
                .clone()
                .unwrap_or_else(|| format!("local:{}", Uuid::new_v4())),
        };
        self.repository.insert_response(&response).await?;

        Ok((event_id, warning))
    }
}

fn join_warnings(first: Option<String>, second: Option<String>) -> Option<String> {
    match (first, second) {
        (Some(a), Some(b)) => Some(format!("{a}; {b}")),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{fixture, fund, Fixture};
    use std::time::Duration;

    async fn received(fx: &Fixture, id: &str, sender: &str, deposit: u64) -> Report {
        let now = Utc::now();
        let report = Report {
            id: id.to_string(),
            repo_url: "https://github.com/acme/widget".to_string(),
            file_path: None,
            description: "overflow".to_string(),
            suggested_fix: None,
            sender_pubkey: sender.to_string(),
            sender_nametag: None,
            recipient_pubkey: fx.identity.public_key(),
            deposit_amount: Amount::from(deposit),
            deposit_coin: "x".to_string(),
            status: ReportStatus::Pending,
            direction: Direction::Received,
            created_at: now,
            updated_at: now,
            origin_event_id: format!("ev-{id}"),
        };
        fx.repository.insert_report(&report).await.unwrap();
        report
    }

    fn coordinator(fx: &Fixture) -> SettlementCoordinator {
        SettlementCoordinator::new(
            fx.repository.clone(),
            fx.reputation.clone(),
            fx.relay.clone(),
            Duration::from_secs(1),
        )
    }

    fn inbox(fx: &Fixture, default_reward: Option<u64>) -> Inbox {
        Inbox {
            wallet: fx.wallet.clone(),
            repos: vec![TrackedRepo::new(
                "https://github.com/acme/widget",
                default_reward.map(Amount::from),
            )],
        }
    }

    #[tokio::test]
    async fn accept_pays_once_and_rejects_reentry() {
        let fx = fixture().await;
        fund(&fx.wallet, "t1", "x", 1000);
        let sender = Identity::generate().public_key();
        received(&fx, "r1", &sender, 100).await;
        let coordinator = coordinator(&fx);
        let inbox = inbox(&fx, None);

        let outcome = coordinator
            .accept("r1", &inbox, Some("thanks".to_string()), Some(Amount::from(50)))
            .await
            .unwrap();
        assert_eq!(outcome.deposit_refunded, Amount::from(100));
        assert_eq!(outcome.reward_paid, Amount::from(50));
        assert!(outcome.warning.is_none());

        let err = coordinator
            .accept("r1", &inbox, None, Some(Amount::from(50)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "already_settled");
        assert_eq!(fx.wallet.store().balances().unwrap().get("x"), Some(&Amount::from(850)));
    }

    #[tokio::test]
    async fn inbox_default_reward_applies_without_argument() {
        let fx = fixture().await;
        fund(&fx.wallet, "t1", "x", 500);
        received(&fx, "r2", &Identity::generate().public_key(), 100).await;

        let outcome = coordinator(&fx)
            .accept("r2", &inbox(&fx, Some(25)), None, None)
            .await
            .unwrap();
        assert_eq!(outcome.reward_paid, Amount::from(25));
        assert_eq!(fx.wallet.store().balances().unwrap().get("x"), Some(&Amount::from(375)));
    }

    #[tokio::test]
    async fn failed_payment_leaves_report_pending() {
        let fx = fixture().await;
        fund(&fx.wallet, "t1", "x", 10);
        received(&fx, "r3", &Identity::generate().public_key(), 100).await;

        let err = coordinator(&fx)
            .accept("r3", &inbox(&fx, None), None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "insufficient_balance");

        let report = fx.repository.get_report("r3").await.unwrap().unwrap();
        assert_eq!(report.status, ReportStatus::Pending);
        let record = fx
            .repository
            .payment(&IdempotencyKey::new(BOUNTY_PURPOSE, "r3"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, PaymentStatus::Failed);
    }

    #[tokio::test]
    async fn completed_payment_is_not_repeated_after_interrupted_accept() {
        let fx = fixture().await;
        fund(&fx.wallet, "t1", "x", 1000);
        let sender = Identity::generate().public_key();
        received(&fx, "r4", &sender, 100).await;

        // Payment went through but the process stopped before marking.
        pay_once(
            &fx.repository,
            &fx.wallet,
            &IdempotencyKey::new(BOUNTY_PURPOSE, "r4"),
            &sender,
            &Amount::from(100),
            "x",
        )
        .await
        .unwrap();

        coordinator(&fx)
            .accept("r4", &inbox(&fx, None), None, None)
            .await
            .unwrap();
        assert_eq!(fx.wallet.store().balances().unwrap().get("x"), Some(&Amount::from(900)));
    }

    #[tokio::test]
    async fn reentry_reports_the_recorded_payout_not_the_new_reward() {
        let fx = fixture().await;
        fund(&fx.wallet, "t1", "x", 1000);
        let sender = Identity::generate().public_key();
        received(&fx, "r7", &sender, 100).await;

        // Deposit plus a reward of 50 went out before the process stopped.
        pay_once(
            &fx.repository,
            &fx.wallet,
            &IdempotencyKey::new(BOUNTY_PURPOSE, "r7"),
            &sender,
            &Amount::from(150),
            "x",
        )
        .await
        .unwrap();

        let outcome = coordinator(&fx)
            .accept("r7", &inbox(&fx, None), None, Some(Amount::from(10)))
            .await
            .unwrap();
        assert_eq!(outcome.deposit_refunded, Amount::from(100));
        assert_eq!(outcome.reward_paid, Amount::from(50));

        let responses = fx.repository.responses_for("r7").await.unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].payout_amount, Some(Amount::from(150)));
        assert_eq!(fx.wallet.store().balances().unwrap().get("x"), Some(&Amount::from(850)));
    }

    #[tokio::test]
    async fn partial_payment_is_recorded_and_resumed_for_the_remainder() {
        let fx = fixture().await;
        fund(&fx.wallet, "t1", "x", 60);
        fund(&fx.wallet, "t2", "x", 100);
        fx.ledger.inject_conflict("t2");
        let sender = Identity::generate().public_key();
        let key = IdempotencyKey::new(BOUNTY_PURPOSE, "r8");

        let err = pay_once(&fx.repository, &fx.wallet, &key, &sender, &Amount::from(100), "x")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "conflict_exhausted");
        let record = fx.repository.payment(&key).await.unwrap().unwrap();
        assert_eq!(record.status, PaymentStatus::Partial);
        assert_eq!(record.paid, Amount::from(60));
        assert_eq!(record.artifacts.len(), 1);

        fund(&fx.wallet, "t3", "x", 100);
        // A different amount on retry does not change the recorded target.
        let paid = pay_once(&fx.repository, &fx.wallet, &key, &sender, &Amount::from(500), "x")
            .await
            .unwrap();
        assert_eq!(paid.artifacts.len(), 2);
        let balances: Vec<Amount> = paid.artifacts.iter().map(|a| a.token.balance("x")).collect();
        assert_eq!(balances.iter().sum::<Amount>(), Amount::from(100));

        let record = fx.repository.payment(&key).await.unwrap().unwrap();
        assert_eq!(record.status, PaymentStatus::Completed);
        assert_eq!(record.paid, Amount::from(100));
        assert_eq!(fx.wallet.store().balances().unwrap().get("x"), Some(&Amount::from(60)));
    }

    #[tokio::test]
    async fn reject_keeps_deposit_and_publish_failure_is_a_warning() {
        let fx = fixture().await;
        received(&fx, "r5", &Identity::generate().public_key(), 100).await;
        fx.relay.set_offline(true);

        let outcome = coordinator(&fx)
            .reject("r5", &inbox(&fx, None), "not reproducible".to_string())
            .await
            .unwrap();
        assert_eq!(outcome.deposit_kept, Amount::from(100));
        assert!(outcome.response_event_id.is_none());
        assert!(outcome.warning.is_some());

        let responses = fx.repository.responses_for("r5").await.unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].message.as_deref(), Some("not reproducible"));
        assert!(responses[0].origin_event_id.starts_with("local:"));
    }

    #[tokio::test]
    async fn complete_only_follows_a_decision() {
        let fx = fixture().await;
        received(&fx, "r6", &Identity::generate().public_key(), 0).await;
        let coordinator = coordinator(&fx);

        let err = coordinator.complete("r6").await.unwrap_err();
        assert_eq!(err.kind(), "illegal_transition");

        coordinator
            .reject("r6", &inbox(&fx, None), "dup".to_string())
            .await
            .unwrap();
        let report = coordinator.complete("r6").await.unwrap();
        assert_eq!(report.status, ReportStatus::Completed);
    }
}

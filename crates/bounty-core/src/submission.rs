use crate::error::BountyError;
use crate::events::{ReportPayload, WirePayload};
use crate::flow::{Direction, ReportStatus};
use crate::relay::{publish_signed, EventKind, RelayClient};
use crate::repository::ReportRepository;
use crate::settlement::{pay_once, DEPOSIT_PURPOSE};
use crate::transfer::TransferEngine;
use crate::types::{IdempotencyKey, Report, ReportDraft, SubmitOutcome};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Reporter side: stake the deposit, publish the report, remember it as sent.
pub struct ReportSubmitter {
    repository: ReportRepository,
    wallet: Arc<TransferEngine>,
    relay: Arc<dyn RelayClient>,
    publish_timeout: Duration,
}

impl ReportSubmitter {
    pub fn new(
        repository: ReportRepository,
        wallet: Arc<TransferEngine>,
        relay: Arc<dyn RelayClient>,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            repository,
            wallet,
            relay,
            publish_timeout,
        }
    }

    /// Submit a report.
    ///
    /// No relay connectivity fails the call before any value moves. If the
    /// report publish fails after the deposit, retrying with the same
    /// `report_id` reuses the deposit instead of paying it again.
    pub async fn submit(&self, draft: ReportDraft) -> Result<SubmitOutcome, BountyError> {
        let report_id = draft
            .report_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if let Some(existing) = self.repository.get_report(&report_id).await? {
            return Err(BountyError::Validation(format!(
                "report id '{report_id}' already used by a {} report",
                existing.direction.name()
            )));
        }

        let mut payload = ReportPayload {
            report_id: report_id.clone(),
            repo_url: draft.repo_url.clone(),
            file_path: draft.file_path.clone(),
            description: draft.description.clone(),
            suggested_fix: draft.suggested_fix.clone(),
            sender_nametag: draft.sender_nametag.clone(),
            deposit_amount: draft.deposit_amount.clone(),
            deposit_coin: draft.deposit_coin.clone(),
            deposit_proof_ref: None,
        };
        WirePayload::Report(payload.clone()).validate()?;
        if draft.recipient_pubkey.trim().is_empty() {
            return Err(BountyError::Validation("recipient_pubkey is empty".to_string()));
        }

        if self.relay.connected_relays().is_empty() {
            return Err(BountyError::Transport(
                "no relay connected; report not submitted".to_string(),
            ));
        }

        if !draft.deposit_amount.is_zero() {
            let paid = pay_once(
                &self.repository,
                &self.wallet,
                &IdempotencyKey::new(DEPOSIT_PURPOSE, &report_id),
                &draft.recipient_pubkey,
                &draft.deposit_amount,
                &draft.deposit_coin,
            )
            .await?;
            if let Some(warning) = &paid.warning {
                warn!(report_id = %report_id, warning = %warning, "deposit artifact not delivered");
            }
            payload.deposit_proof_ref = paid.proof_ref;
        }

        let deposit_proof_ref = payload.deposit_proof_ref.clone();
        let event_id = publish_signed(
            self.relay.as_ref(),
            self.wallet.identity(),
            EventKind::Report,
            &draft.recipient_pubkey,
            WirePayload::Report(payload).to_content()?,
            self.publish_timeout,
        )
        .await?;

        let now = Utc::now();
        let report = Report {
            id: report_id.clone(),
            repo_url: draft.repo_url,
            file_path: draft.file_path,
            description: draft.description,
            suggested_fix: draft.suggested_fix,
            sender_pubkey: self.wallet.identity().public_key(),
            sender_nametag: draft.sender_nametag,
            recipient_pubkey: draft.recipient_pubkey,
            deposit_amount: draft.deposit_amount,
            deposit_coin: draft.deposit_coin,
            status: ReportStatus::Pending,
            direction: Direction::Sent,
            created_at: now,
            updated_at: now,
            origin_event_id: event_id.clone(),
        };
        self.repository.insert_report(&report).await?;
        self.repository.flush().await?;

        info!(report_id = %report_id, event_id = %event_id, deposit = %report.deposit_amount, "report submitted");
        Ok(SubmitOutcome {
            report_id,
            event_id,
            deposit_proof_ref,
        })
    }
}

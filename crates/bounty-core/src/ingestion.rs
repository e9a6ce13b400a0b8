//! Relay ingestion pipeline.
//!
//! One pipeline per tracked identity. Inbound events arrive on a single
//! channel and are applied by one loop, so all state mutation for an inbox is
//! sequential even though delivery is asynchronous. Every path is safe to
//! re-run over the same window: duplicates are absorbed by id lookups and
//! storage-level uniqueness, never by time-window exclusivity.

use crate::config::TrackedRepo;
use crate::error::BountyError;
use crate::events::{decode_event, ReportPayload, ResponsePayload, TokenTransferPayload, WirePayload};
use crate::flow::{Direction, ReportStatus, ResponseType};
use crate::relay::{EventFilter, EventKind, RelayClient, RelayEvent};
use crate::repository::ReportRepository;
use crate::reputation::ReputationLedger;
use crate::transfer::TransferEngine;
use crate::types::{Report, Response};
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Why an event was dropped without a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Invalid,
    WrongRecipient,
    BlockedSender,
    DuplicateReport,
    UntrackedRepo,
    UnknownReport,
    NotSent,
    AlreadyTerminal,
    ForeignResponder,
    DuplicateResponse,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    ReportStored { report_id: String },
    ResponseApplied {
        report_id: String,
        response_type: ResponseType,
    },
    TokensReceived { count: usize },
    Dropped(DropReason),
}

#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub checkpoint_interval: Duration,
    pub replay_overlap_secs: i64,
    pub default_lookback_secs: i64,
    pub reconnect_delay: Duration,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            checkpoint_interval: Duration::from_secs(30),
            replay_overlap_secs: 300,
            default_lookback_secs: 7 * 24 * 60 * 60,
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillSummary {
    pub seen: usize,
    pub applied: usize,
    pub newest: Option<i64>,
}

pub struct IngestionPipeline {
    inbox: String,
    repos: Vec<TrackedRepo>,
    repository: ReportRepository,
    reputation: ReputationLedger,
    wallet: Arc<TransferEngine>,
    relay: Arc<dyn RelayClient>,
    settings: ListenerSettings,
}

impl IngestionPipeline {
    pub fn new(
        repos: Vec<TrackedRepo>,
        repository: ReportRepository,
        reputation: ReputationLedger,
        wallet: Arc<TransferEngine>,
        relay: Arc<dyn RelayClient>,
        settings: ListenerSettings,
    ) -> Self {
        Self {
            inbox: wallet.identity().public_key(),
            repos,
            repository,
            reputation,
            wallet,
            relay,
            settings,
        }
    }

    pub fn inbox(&self) -> &str {
        &self.inbox
    }

    /// Apply one relay event. Storage faults propagate; everything about the
    /// event itself resolves to an outcome.
    pub async fn handle(&self, event: &RelayEvent) -> Result<IngestOutcome, BountyError> {
        if event.recipient != self.inbox {
            return Ok(IngestOutcome::Dropped(DropReason::WrongRecipient));
        }

        let payload = match decode_event(event) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(inbox = %self.inbox, event_id = %event.id, error = %err, "dropping invalid event");
                return Ok(IngestOutcome::Dropped(DropReason::Invalid));
            }
        };

        match payload {
            WirePayload::Report(report) => self.ingest_report(event, report).await,
            WirePayload::Response(response) => self.ingest_response(event, response).await,
            WirePayload::TokenTransfer(transfer) => self.ingest_transfer(event, transfer).await,
        }
    }

    async fn ingest_report(
        &self,
        event: &RelayEvent,
        payload: ReportPayload,
    ) -> Result<IngestOutcome, BountyError> {
        if self.repository.is_blocked(&event.sender).await? {
            info!(inbox = %self.inbox, sender = %event.sender, "dropping report from blocked sender");
            return Ok(IngestOutcome::Dropped(DropReason::BlockedSender));
        }
        if self.repository.report_exists(&payload.report_id).await? {
            debug!(report_id = %payload.report_id, "report already stored");
            return Ok(IngestOutcome::Dropped(DropReason::DuplicateReport));
        }
        if !self.repos.iter().any(|repo| repo.matches(&payload.repo_url)) {
            info!(
                inbox = %self.inbox,
                report_id = %payload.report_id,
                repo_url = %payload.repo_url,
                "dropping report for untracked repository"
            );
            return Ok(IngestOutcome::Dropped(DropReason::UntrackedRepo));
        }

        let report = Report {
            id: payload.report_id,
            repo_url: payload.repo_url,
            file_path: payload.file_path,
            description: payload.description,
            suggested_fix: payload.suggested_fix,
            sender_pubkey: event.sender.clone(),
            sender_nametag: payload.sender_nametag,
            recipient_pubkey: self.inbox.clone(),
            deposit_amount: payload.deposit_amount,
            deposit_coin: payload.deposit_coin,
            status: ReportStatus::Pending,
            direction: Direction::Received,
            created_at: event_time(event.created_at),
            updated_at: Utc::now(),
            origin_event_id: event.id.clone(),
        };

        if !self.repository.insert_report(&report).await? {
            return Ok(IngestOutcome::Dropped(DropReason::DuplicateReport));
        }
        self.reputation.record_report(&event.sender).await?;

        info!(
            inbox = %self.inbox,
            report_id = %report.id,
            sender = %report.sender_pubkey,
            deposit = %report.deposit_amount,
            "report received"
        );
        Ok(IngestOutcome::ReportStored {
            report_id: report.id,
        })
    }

    async fn ingest_response(
        &self,
        event: &RelayEvent,
        payload: ResponsePayload,
    ) -> Result<IngestOutcome, BountyError> {
        let Some(report) = self.repository.get_report(&payload.report_id).await? else {
            debug!(report_id = %payload.report_id, "response for unknown report");
            return Ok(IngestOutcome::Dropped(DropReason::UnknownReport));
        };
        if report.direction != Direction::Sent {
            return Ok(IngestOutcome::Dropped(DropReason::NotSent));
        }
        if report.recipient_pubkey != event.sender {
            warn!(
                report_id = %report.id,
                responder = %event.sender,
                "response not signed by the report's recipient"
            );
            return Ok(IngestOutcome::Dropped(DropReason::ForeignResponder));
        }
        if report.status.is_terminal() {
            return Ok(IngestOutcome::Dropped(DropReason::AlreadyTerminal));
        }
        if self.repository.response_exists(&event.id).await? {
            debug!(event_id = %event.id, "response already stored");
            return Ok(IngestOutcome::Dropped(DropReason::DuplicateResponse));
        }

        let response = Response {
            id: event.id.clone(),
            report_id: report.id.clone(),
            response_type: payload.response_type,
            message: payload.message,
            payout_amount: payload.payout_amount,
            responder_pubkey: event.sender.clone(),
            created_at: event_time(event.created_at),
            origin_event_id: event.id.clone(),
        };
        let transition = payload
            .response_type
            .target_status()
            .map(|target| (ReportStatus::Pending, target));

        match self.repository.apply_response(&response, transition).await {
            Ok(true) => {}
            Ok(false) => return Ok(IngestOutcome::Dropped(DropReason::DuplicateResponse)),
            Err(BountyError::AlreadySettled { .. }) => {
                return Ok(IngestOutcome::Dropped(DropReason::AlreadyTerminal))
            }
            Err(err) => return Err(err),
        }

        info!(
            report_id = %report.id,
            response_type = payload.response_type.name(),
            "response applied to sent report"
        );
        Ok(IngestOutcome::ResponseApplied {
            report_id: report.id,
            response_type: payload.response_type,
        })
    }

    async fn ingest_transfer(
        &self,
        event: &RelayEvent,
        payload: TokenTransferPayload,
    ) -> Result<IngestOutcome, BountyError> {
        let count = self.wallet.receive(&payload.artifacts).await?;
        info!(
            inbox = %self.inbox,
            sender = %event.sender,
            purpose = %payload.purpose,
            amount = %payload.amount,
            coin = %payload.coin,
            added = count,
            "token transfer received"
        );
        Ok(IngestOutcome::TokensReceived { count })
    }

    /// Start of the next replay window: cursor minus overlap, or the default
    /// lookback when no cursor exists.
    pub async fn replay_since(&self) -> Result<i64, BountyError> {
        let now = Utc::now().timestamp();
        Ok(match self.repository.sync_cursor(&self.inbox).await? {
            Some(cursor) => cursor.saturating_sub(self.settings.replay_overlap_secs).max(0),
            None => now.saturating_sub(self.settings.default_lookback_secs).max(0),
        })
    }

    /// One-shot catch-up from the persisted cursor.
    pub async fn backfill(&self) -> Result<BackfillSummary, BountyError> {
        let since = self.replay_since().await?;
        let filter = EventFilter::new(self.inbox.clone(), all_kinds(), since);
        let mut events = self.relay.query_once(&filter).await?;
        events.sort_by_key(|event| event.created_at);

        let mut summary = BackfillSummary::default();
        for event in &events {
            summary.seen += 1;
            if !matches!(self.handle(event).await?, IngestOutcome::Dropped(_)) {
                summary.applied += 1;
            }
            summary.newest = summary.newest.max(Some(event.created_at));
        }

        if let Some(newest) = summary.newest {
            self.repository.advance_cursor(&self.inbox, newest).await?;
        }
        debug!(inbox = %self.inbox, since, seen = summary.seen, applied = summary.applied, "backfill finished");
        Ok(summary)
    }

    /// Listener loop: backfill, then consume the live subscription,
    /// checkpointing the cursor on an interval. Resubscribes when the channel
    /// closes and returns once `shutdown` flips or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(inbox = %self.inbox, "listener started");
        let mut watermark = Watermark::default();

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.backfill().await {
                Ok(summary) => {
                    // Backfill replays from below any failed event and stops on error.
                    watermark.clear_failures();
                    if let Some(newest) = summary.newest {
                        watermark.applied(newest);
                    }
                }
                Err(err) => warn!(inbox = %self.inbox, error = %err, "backfill failed"),
            }

            let subscription = match self.replay_since().await {
                Ok(since) => {
                    let filter = EventFilter::new(self.inbox.clone(), all_kinds(), since);
                    self.relay.subscribe(filter).await
                }
                Err(err) => Err(err),
            };

            let closed = match subscription {
                Ok(mut events) => {
                    let mut ticker = tokio::time::interval(self.settings.checkpoint_interval);
                    ticker.tick().await;
                    loop {
                        tokio::select! {
                            maybe = events.recv() => match maybe {
                                Some(event) => {
                                    match self.handle(&event).await {
                                        Ok(_) => watermark.applied(event.created_at),
                                        Err(err) => {
                                            warn!(
                                                inbox = %self.inbox,
                                                event_id = %event.id,
                                                error = %err,
                                                "event handling failed; it will be replayed"
                                            );
                                            watermark.failed(event.created_at);
                                        }
                                    }
                                }
                                None => break true,
                            },
                            _ = ticker.tick() => self.checkpoint(watermark.checkpoint()).await,
                            _ = shutdown.changed() => break false,
                        }
                    }
                }
                Err(err) => {
                    warn!(inbox = %self.inbox, error = %err, "subscription failed");
                    true
                }
            };

            self.checkpoint(watermark.checkpoint()).await;
            if !closed {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.reconnect_delay) => {}
                _ = shutdown.changed() => break,
            }
            info!(inbox = %self.inbox, "resubscribing");
        }

        info!(inbox = %self.inbox, "listener stopped");
    }

    async fn checkpoint(&self, high_water: Option<i64>) {
        let Some(timestamp) = high_water else {
            return;
        };
        if let Err(err) = self.repository.advance_cursor(&self.inbox, timestamp).await {
            warn!(inbox = %self.inbox, error = %err, "cursor checkpoint failed");
        }
    }
}

/// Newest applied event time, held below the oldest event that failed so
/// the failed event stays inside the next replay window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Watermark {
    newest_applied: Option<i64>,
    oldest_failed: Option<i64>,
}

impl Watermark {
    fn applied(&mut self, created_at: i64) {
        self.newest_applied = self.newest_applied.max(Some(created_at));
    }

    fn failed(&mut self, created_at: i64) {
        self.oldest_failed = Some(match self.oldest_failed {
            Some(oldest) => oldest.min(created_at),
            None => created_at,
        });
    }

    fn clear_failures(&mut self) {
        self.oldest_failed = None;
    }

    /// Cursor value that is safe to persist, if any.
    fn checkpoint(&self) -> Option<i64> {
        match self.oldest_failed {
            Some(failed) => self
                .newest_applied
                .map(|applied| applied.min(failed.saturating_sub(1))),
            None => self.newest_applied,
        }
    }
}

fn all_kinds() -> Vec<EventKind> {
    vec![EventKind::Report, EventKind::Response, EventKind::TokenTransfer]
}

fn event_time(created_at: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(created_at, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::Amount;
    use crate::identity::Identity;
    use crate::testkit::{fixture, Fixture};

    fn pipeline(fx: &Fixture) -> IngestionPipeline {
        IngestionPipeline::new(
            vec![TrackedRepo::new("https://github.com/acme/widget", None)],
            fx.repository.clone(),
            fx.reputation.clone(),
            fx.wallet.clone(),
            fx.relay.clone(),
            ListenerSettings::default(),
        )
    }

    fn report_event(sender: &Identity, inbox: &str, report_id: &str, repo: &str) -> RelayEvent {
        let payload = WirePayload::Report(ReportPayload {
            report_id: report_id.to_string(),
            repo_url: repo.to_string(),
            file_path: None,
            description: "null deref".to_string(),
            suggested_fix: None,
            sender_nametag: None,
            deposit_amount: Amount::from(100),
            deposit_coin: "x".to_string(),
            deposit_proof_ref: None,
        });
        RelayEvent::signed(
            sender,
            EventKind::Report,
            inbox,
            payload.to_content().unwrap(),
            Utc::now().timestamp(),
        )
    }

    #[tokio::test]
    async fn same_report_event_is_stored_once() {
        let fx = fixture().await;
        let pipeline = pipeline(&fx);
        let sender = Identity::generate();
        let event = report_event(&sender, pipeline.inbox(), "r-1", "https://github.com/acme/widget.git");

        assert_eq!(
            pipeline.handle(&event).await.unwrap(),
            IngestOutcome::ReportStored {
                report_id: "r-1".to_string()
            }
        );
        assert_eq!(
            pipeline.handle(&event).await.unwrap(),
            IngestOutcome::Dropped(DropReason::DuplicateReport)
        );

        let reputation = fx.reputation.get(&sender.public_key()).await.unwrap().unwrap();
        assert_eq!(reputation.total_reports, 1);
    }

    #[tokio::test]
    async fn blocked_untracked_and_tampered_events_are_dropped() {
        let fx = fixture().await;
        let pipeline = pipeline(&fx);
        let sender = Identity::generate();

        let untracked = report_event(&sender, pipeline.inbox(), "r-2", "https://github.com/acme/other");
        assert_eq!(
            pipeline.handle(&untracked).await.unwrap(),
            IngestOutcome::Dropped(DropReason::UntrackedRepo)
        );

        let mut tampered = report_event(&sender, pipeline.inbox(), "r-3", "https://github.com/acme/widget");
        tampered.content = tampered.content.replace("null deref", "nothing");
        assert_eq!(
            pipeline.handle(&tampered).await.unwrap(),
            IngestOutcome::Dropped(DropReason::Invalid)
        );

        fx.repository.block_sender(&sender.public_key()).await.unwrap();
        let blocked = report_event(&sender, pipeline.inbox(), "r-4", "https://github.com/acme/widget");
        assert_eq!(
            pipeline.handle(&blocked).await.unwrap(),
            IngestOutcome::Dropped(DropReason::BlockedSender)
        );
        assert!(fx.repository.get_report("r-4").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn backfill_replays_and_advances_cursor() {
        let fx = fixture().await;
        let pipeline = pipeline(&fx);
        let sender = Identity::generate();

        for id in ["r-10", "r-11"] {
            let event = report_event(&sender, pipeline.inbox(), id, "https://github.com/acme/widget");
            fx.relay.publish(event).await.unwrap();
        }

        let first = pipeline.backfill().await.unwrap();
        assert_eq!(first.seen, 2);
        assert_eq!(first.applied, 2);
        assert!(fx.repository.sync_cursor(pipeline.inbox()).await.unwrap().is_some());

        let second = pipeline.backfill().await.unwrap();
        assert_eq!(second.seen, 2);
        assert_eq!(second.applied, 0);
    }

    async fn sent_report(fx: &Fixture, pipeline: &IngestionPipeline, id: &str, recipient: &str) {
        let now = Utc::now();
        fx.repository
            .insert_report(&Report {
                id: id.to_string(),
                repo_url: "https://github.com/acme/widget".to_string(),
                file_path: None,
                description: "race in cache".to_string(),
                suggested_fix: None,
                sender_pubkey: pipeline.inbox().to_string(),
                sender_nametag: None,
                recipient_pubkey: recipient.to_string(),
                deposit_amount: Amount::from(100),
                deposit_coin: "x".to_string(),
                status: ReportStatus::Pending,
                direction: Direction::Sent,
                created_at: now,
                updated_at: now,
                origin_event_id: format!("ev-{id}"),
            })
            .await
            .unwrap();
    }

    fn response_event(
        responder: &Identity,
        inbox: &str,
        report_id: &str,
        response_type: ResponseType,
        created_at: i64,
    ) -> RelayEvent {
        let payload = WirePayload::Response(ResponsePayload {
            report_id: report_id.to_string(),
            response_type,
            message: Some(format!("{} by maintainer", response_type.name())),
            payout_amount: None,
            original_event_id: format!("ev-{report_id}"),
        });
        RelayEvent::signed(
            responder,
            EventKind::Response,
            inbox,
            payload.to_content().unwrap(),
            created_at,
        )
    }

    async fn status_of(fx: &Fixture, id: &str) -> ReportStatus {
        fx.repository.get_report(id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn acknowledgement_then_decision_applies_each_response_once() {
        let fx = fixture().await;
        let pipeline = pipeline(&fx);
        let maintainer = Identity::generate();
        sent_report(&fx, &pipeline, "r-20", &maintainer.public_key()).await;
        let now = Utc::now().timestamp();

        let ack = response_event(&maintainer, pipeline.inbox(), "r-20", ResponseType::Acknowledged, now - 2);
        assert_eq!(
            pipeline.handle(&ack).await.unwrap(),
            IngestOutcome::ResponseApplied {
                report_id: "r-20".to_string(),
                response_type: ResponseType::Acknowledged,
            }
        );
        assert_eq!(status_of(&fx, "r-20").await, ReportStatus::Pending);
        assert_eq!(
            pipeline.handle(&ack).await.unwrap(),
            IngestOutcome::Dropped(DropReason::DuplicateResponse)
        );

        let impostor = Identity::generate();
        let forged = response_event(&impostor, pipeline.inbox(), "r-20", ResponseType::Accepted, now - 1);
        assert_eq!(
            pipeline.handle(&forged).await.unwrap(),
            IngestOutcome::Dropped(DropReason::ForeignResponder)
        );
        assert_eq!(status_of(&fx, "r-20").await, ReportStatus::Pending);

        let accepted = response_event(&maintainer, pipeline.inbox(), "r-20", ResponseType::Accepted, now - 1);
        assert_eq!(
            pipeline.handle(&accepted).await.unwrap(),
            IngestOutcome::ResponseApplied {
                report_id: "r-20".to_string(),
                response_type: ResponseType::Accepted,
            }
        );
        assert_eq!(status_of(&fx, "r-20").await, ReportStatus::Accepted);

        // Redelivery and a contradicting late decision both leave it alone.
        assert_eq!(
            pipeline.handle(&accepted).await.unwrap(),
            IngestOutcome::Dropped(DropReason::AlreadyTerminal)
        );
        let late = response_event(&maintainer, pipeline.inbox(), "r-20", ResponseType::Rejected, now);
        assert_eq!(
            pipeline.handle(&late).await.unwrap(),
            IngestOutcome::Dropped(DropReason::AlreadyTerminal)
        );
        assert_eq!(status_of(&fx, "r-20").await, ReportStatus::Accepted);

        let responses = fx.repository.responses_for("r-20").await.unwrap();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].response_type, ResponseType::Acknowledged);
        assert_eq!(responses[1].response_type, ResponseType::Accepted);
    }

    #[tokio::test]
    async fn responses_need_a_known_sent_report() {
        let fx = fixture().await;
        let pipeline = pipeline(&fx);
        let maintainer = Identity::generate();
        let now = Utc::now().timestamp();

        let unknown = response_event(&maintainer, pipeline.inbox(), "r-missing", ResponseType::Accepted, now);
        assert_eq!(
            pipeline.handle(&unknown).await.unwrap(),
            IngestOutcome::Dropped(DropReason::UnknownReport)
        );

        let reporter = Identity::generate();
        let report = report_event(&reporter, pipeline.inbox(), "r-21", "https://github.com/acme/widget");
        pipeline.handle(&report).await.unwrap();
        let misdirected = response_event(&reporter, pipeline.inbox(), "r-21", ResponseType::Rejected, now);
        assert_eq!(
            pipeline.handle(&misdirected).await.unwrap(),
            IngestOutcome::Dropped(DropReason::NotSent)
        );
        assert_eq!(status_of(&fx, "r-21").await, ReportStatus::Pending);
    }

    #[tokio::test]
    async fn backfilled_responses_are_not_applied_twice() {
        let fx = fixture().await;
        let pipeline = pipeline(&fx);
        let maintainer = Identity::generate();
        sent_report(&fx, &pipeline, "r-22", &maintainer.public_key()).await;
        let now = Utc::now().timestamp();

        for (response_type, at) in [(ResponseType::Acknowledged, now - 2), (ResponseType::Rejected, now - 1)] {
            let event = response_event(&maintainer, pipeline.inbox(), "r-22", response_type, at);
            fx.relay.publish(event).await.unwrap();
        }

        let first = pipeline.backfill().await.unwrap();
        assert_eq!(first.applied, 2);
        let second = pipeline.backfill().await.unwrap();
        assert_eq!(second.seen, 2);
        assert_eq!(second.applied, 0);

        assert_eq!(status_of(&fx, "r-22").await, ReportStatus::Rejected);
        assert_eq!(fx.repository.responses_for("r-22").await.unwrap().len(), 2);
    }

    #[test]
    fn checkpoint_stays_below_the_oldest_failed_event() {
        let mut watermark = Watermark::default();
        assert_eq!(watermark.checkpoint(), None);

        watermark.applied(100);
        watermark.failed(120);
        watermark.applied(150);
        watermark.failed(130);
        assert_eq!(watermark.checkpoint(), Some(119));

        watermark.clear_failures();
        assert_eq!(watermark.checkpoint(), Some(150));

        let mut only_failed = Watermark::default();
        only_failed.failed(10);
        assert_eq!(only_failed.checkpoint(), None);
    }
}

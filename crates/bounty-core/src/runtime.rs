use crate::amount::Amount;
use crate::config::{EngineConfig, TrackedRepo};
use crate::error::BountyError;
use crate::identity::Identity;
use crate::ingestion::{IngestOutcome, IngestionPipeline, ListenerSettings};
use crate::ledger::LedgerClient;
use crate::relay::{RelayClient, RelayEvent};
use crate::repository::ReportRepository;
use crate::reputation::{required_deposit, ReputationLedger, ReputationRecord};
use crate::settlement::{Inbox, SettlementCoordinator};
use crate::submission::ReportSubmitter;
use crate::token_store::TokenStore;
use crate::transfer::{ReconcileSummary, TransferConfig, TransferEngine};
use crate::types::{
    AcceptOutcome, RejectOutcome, Report, ReportDetail, ReportDraft, ReportFilter, StatusReport,
    SubmitOutcome, TransferRequest, TransferResult, WalletSummary,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Bounty engine: the single command surface every caller goes through.
///
/// State-changing commands are serialized by one command lock; background
/// listeners run beside it and only touch state through the repository and
/// token stores.
pub struct BountyEngine {
    node: Arc<TransferEngine>,
    inboxes: HashMap<String, Inbox>,
    pipelines: HashMap<String, Arc<IngestionPipeline>>,
    repository: ReportRepository,
    reputation: ReputationLedger,
    settlement: SettlementCoordinator,
    submitter: ReportSubmitter,
    ledger: Arc<dyn LedgerClient>,
    relay: Arc<dyn RelayClient>,
    commands: AsyncMutex<()>,
    started_at: Instant,
    config: EngineConfig,
}

impl BountyEngine {
    pub async fn bootstrap(
        config: EngineConfig,
        ledger: Arc<dyn LedgerClient>,
        relay: Arc<dyn RelayClient>,
    ) -> Result<Self, BountyError> {
        let node_identity = match &config.secret_key {
            Some(secret) => Identity::from_secret_hex(secret)?,
            None => {
                warn!("no node secret configured, using an ephemeral identity");
                Identity::generate()
            }
        };

        let repository = ReportRepository::connect(&config.report_storage).await?;
        let reputation = ReputationLedger::new(repository.pool().clone());
        let transfer_config = TransferConfig {
            proof_timeout: config.proof_timeout(),
            publish_timeout: config.publish_timeout(),
        };

        let open_wallet = |identity: Identity| -> Result<Arc<TransferEngine>, BountyError> {
            let store = TokenStore::open(&config.data_dir, identity.public_key())?;
            Ok(Arc::new(TransferEngine::new(
                identity,
                Arc::new(store),
                ledger.clone(),
                relay.clone(),
                transfer_config.clone(),
            )))
        };

        let node = open_wallet(node_identity.clone())?;
        let node_pubkey = node_identity.public_key();

        let mut inboxes: HashMap<String, Inbox> = HashMap::new();
        for inbox_config in &config.inboxes {
            let identity = Identity::from_secret_hex(&inbox_config.secret_key)?;
            let pubkey = identity.public_key();
            if inboxes.contains_key(&pubkey) {
                return Err(BountyError::Validation(format!(
                    "inbox '{pubkey}' configured twice"
                )));
            }
            let wallet = if pubkey == node_pubkey {
                node.clone()
            } else {
                open_wallet(identity)?
            };
            inboxes.insert(
                pubkey,
                Inbox {
                    wallet,
                    repos: inbox_config.repos.clone(),
                },
            );
        }

        let settings = ListenerSettings {
            checkpoint_interval: config.checkpoint_interval(),
            replay_overlap_secs: config.replay_overlap_secs,
            default_lookback_secs: config.default_lookback_secs,
            ..ListenerSettings::default()
        };
        let pipeline = |wallet: Arc<TransferEngine>, repos: Vec<TrackedRepo>| {
            Arc::new(IngestionPipeline::new(
                repos,
                repository.clone(),
                reputation.clone(),
                wallet,
                relay.clone(),
                settings.clone(),
            ))
        };

        let mut pipelines = HashMap::new();
        for (pubkey, inbox) in &inboxes {
            pipelines.insert(pubkey.clone(), pipeline(inbox.wallet.clone(), inbox.repos.clone()));
        }
        // The node itself receives responses and refunds for the reports it sent.
        pipelines
            .entry(node_pubkey.clone())
            .or_insert_with(|| pipeline(node.clone(), Vec::new()));

        let settlement = SettlementCoordinator::new(
            repository.clone(),
            reputation.clone(),
            relay.clone(),
            config.publish_timeout(),
        );
        let submitter = ReportSubmitter::new(
            repository.clone(),
            node.clone(),
            relay.clone(),
            config.publish_timeout(),
        );

        info!(
            node = %node_pubkey,
            inboxes = inboxes.len(),
            storage = repository.backend_label(),
            ledger = %ledger.endpoint(),
            "bounty engine bootstrapped"
        );

        Ok(Self {
            node,
            inboxes,
            pipelines,
            repository,
            reputation,
            settlement,
            submitter,
            ledger,
            relay,
            commands: AsyncMutex::new(()),
            started_at: Instant::now(),
            config,
        })
    }

    pub fn node_pubkey(&self) -> String {
        self.node.identity().public_key()
    }

    pub fn inbox_pubkeys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inboxes.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn repository(&self) -> &ReportRepository {
        &self.repository
    }

    /// Pay from the node wallet.
    pub async fn transfer(&self, request: TransferRequest) -> TransferResult {
        let _guard = self.commands.lock().await;
        self.node.transfer(&request).await.into()
    }

    pub async fn submit_report(&self, draft: ReportDraft) -> Result<SubmitOutcome, BountyError> {
        let _guard = self.commands.lock().await;
        self.submitter.submit(draft).await
    }

    /// Accept a received report. `inbox` defaults to the report's recipient.
    pub async fn accept(
        &self,
        report_id: &str,
        inbox: Option<&str>,
        message: Option<String>,
        reward: Option<Amount>,
    ) -> Result<AcceptOutcome, BountyError> {
        let _guard = self.commands.lock().await;
        let inbox = self.resolve_inbox(report_id, inbox).await?;
        self.settlement.accept(report_id, inbox, message, reward).await
    }

    pub async fn reject(
        &self,
        report_id: &str,
        inbox: Option<&str>,
        reason: String,
    ) -> Result<RejectOutcome, BountyError> {
        let _guard = self.commands.lock().await;
        let inbox = self.resolve_inbox(report_id, inbox).await?;
        self.settlement.reject(report_id, inbox, reason).await
    }

    pub async fn complete(&self, report_id: &str) -> Result<Report, BountyError> {
        let _guard = self.commands.lock().await;
        self.settlement.complete(report_id).await
    }

    /// Republish the stored artifacts of a report's completed payment.
    pub async fn retransmit_payment(&self, report_id: &str) -> Result<String, BountyError> {
        let _guard = self.commands.lock().await;
        let report = self.require_report(report_id).await?;
        let payer = match report.direction {
            crate::flow::Direction::Received => report.recipient_pubkey.as_str(),
            crate::flow::Direction::Sent => report.sender_pubkey.as_str(),
        };
        let wallet = self.wallet(payer)?;
        self.settlement.retransmit(&report, wallet).await
    }

    pub async fn block_sender(&self, sender: &str) -> Result<(), BountyError> {
        let _guard = self.commands.lock().await;
        self.repository.block_sender(sender).await?;
        info!(sender, "sender blocked");
        Ok(())
    }

    pub async fn unblock_sender(&self, sender: &str) -> Result<bool, BountyError> {
        let _guard = self.commands.lock().await;
        let removed = self.repository.unblock_sender(sender).await?;
        info!(sender, removed, "sender unblocked");
        Ok(removed)
    }

    pub async fn set_trusted(&self, sender: &str, trusted: bool) -> Result<ReputationRecord, BountyError> {
        let _guard = self.commands.lock().await;
        self.reputation.set_trusted(sender, trusted).await
    }

    pub async fn reconcile(&self, identity: &str) -> Result<ReconcileSummary, BountyError> {
        let _guard = self.commands.lock().await;
        self.wallet(identity)?.reconcile().await
    }

    pub async fn status(&self) -> Result<StatusReport, BountyError> {
        let mut pending_by_inbox = HashMap::new();
        for pubkey in self.inboxes.keys() {
            pending_by_inbox.insert(pubkey.clone(), self.repository.count_pending(pubkey).await?);
        }
        Ok(StatusReport {
            uptime_secs: self.started_at.elapsed().as_secs(),
            connected_relays: self.relay.connected_relays(),
            pending_by_inbox,
            ledger_endpoint: self.ledger.endpoint(),
        })
    }

    pub async fn list_reports(&self, filter: &ReportFilter) -> Result<Vec<Report>, BountyError> {
        self.repository.list_reports(filter).await
    }

    pub async fn report_detail(&self, report_id: &str) -> Result<ReportDetail, BountyError> {
        let report = self.require_report(report_id).await?;
        let responses = self.repository.responses_for(report_id).await?;
        Ok(ReportDetail { report, responses })
    }

    pub async fn reputation(&self, sender: &str) -> Result<ReputationRecord, BountyError> {
        self.reputation.get_or_default(sender).await
    }

    /// Deposit a sender must stake for a report with base deposit `base`.
    pub async fn required_deposit(&self, sender: &str, base: &Amount) -> Result<Amount, BountyError> {
        Ok(required_deposit(base, self.reputation.tier(sender).await?))
    }

    pub fn wallet_summary(&self, identity: &str) -> Result<WalletSummary, BountyError> {
        let store = self.wallet(identity)?.store();
        store.reload()?;
        Ok(WalletSummary {
            identity: store.owner().to_string(),
            address: store.address(),
            balances: store.balances()?,
            owned_tokens: store.list()?.len(),
            archived_tokens: store.archived()?.len(),
        })
    }

    /// Feed one event to the pipeline of its recipient.
    pub async fn ingest(&self, event: &RelayEvent) -> Result<IngestOutcome, BountyError> {
        match self.pipelines.get(&event.recipient) {
            Some(pipeline) => pipeline.handle(event).await,
            None => Ok(IngestOutcome::Dropped(
                crate::ingestion::DropReason::WrongRecipient,
            )),
        }
    }

    /// Catch up every tracked identity from its cursor.
    pub async fn backfill_all(&self) -> Result<usize, BountyError> {
        let mut applied = 0;
        for pipeline in self.pipelines.values() {
            applied += pipeline.backfill().await?.applied;
        }
        Ok(applied)
    }

    /// Start one listener per tracked identity.
    pub fn spawn_listeners(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.pipelines
            .values()
            .map(|pipeline| {
                let pipeline = pipeline.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { pipeline.run(shutdown).await })
            })
            .collect()
    }

    pub async fn flush(&self) -> Result<(), BountyError> {
        self.repository.flush().await
    }

    fn wallet(&self, identity: &str) -> Result<&TransferEngine, BountyError> {
        if identity == self.node_pubkey() {
            return Ok(self.node.as_ref());
        }
        self.inboxes
            .get(identity)
            .map(|inbox| inbox.wallet.as_ref())
            .ok_or_else(|| BountyError::NotFound(format!("identity '{identity}'")))
    }

    async fn require_report(&self, report_id: &str) -> Result<Report, BountyError> {
        self.repository
            .get_report(report_id)
            .await?
            .ok_or_else(|| BountyError::NotFound(format!("report '{report_id}'")))
    }

    async fn resolve_inbox(&self, report_id: &str, inbox: Option<&str>) -> Result<&Inbox, BountyError> {
        let pubkey = match inbox {
            Some(pubkey) => pubkey.to_string(),
            None => self.require_report(report_id).await?.recipient_pubkey,
        };
        self.inboxes
            .get(&pubkey)
            .ok_or_else(|| BountyError::NotFound(format!("inbox '{pubkey}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InboxConfig;
    use crate::testkit::{AcceptingLedger, RecordingRelay};

    async fn engine(inboxes: Vec<InboxConfig>) -> BountyEngine {
        let config = EngineConfig {
            secret_key: Some(Identity::generate().secret_hex()),
            data_dir: std::env::temp_dir().join(format!("bounty-engine-{}", uuid::Uuid::new_v4())),
            inboxes,
            ..EngineConfig::default()
        };
        BountyEngine::bootstrap(
            config,
            Arc::new(AcceptingLedger::default()),
            Arc::new(RecordingRelay::default()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn status_reports_inboxes_and_collaborators() {
        let inbox = Identity::generate();
        let engine = engine(vec![InboxConfig::new(
            inbox.secret_hex(),
            vec![TrackedRepo::new("https://github.com/acme/widget", None)],
        )])
        .await;

        let status = engine.status().await.unwrap();
        assert_eq!(status.pending_by_inbox.get(&inbox.public_key()), Some(&0));
        assert_eq!(status.connected_relays, vec!["recording".to_string()]);
        assert_eq!(status.ledger_endpoint, "accepting");
        assert_eq!(engine.inbox_pubkeys(), vec![inbox.public_key()]);
    }

    #[tokio::test]
    async fn unknown_identities_and_reports_are_not_found() {
        let engine = engine(Vec::new()).await;
        assert_eq!(engine.wallet_summary("nobody").unwrap_err().kind(), "not_found");
        assert_eq!(
            engine.accept("missing", None, None, None).await.unwrap_err().kind(),
            "not_found"
        );
        let summary = engine.wallet_summary(&engine.node_pubkey()).unwrap();
        assert!(summary.balances.is_empty());
    }

    #[tokio::test]
    async fn duplicate_inbox_is_rejected() {
        let inbox = Identity::generate();
        let config = EngineConfig {
            inboxes: vec![
                InboxConfig::new(inbox.secret_hex(), vec![TrackedRepo::new("https://github.com/a/b", None)]),
                InboxConfig::new(inbox.secret_hex(), vec![TrackedRepo::new("https://github.com/a/c", None)]),
            ],
            data_dir: std::env::temp_dir().join(format!("bounty-engine-{}", uuid::Uuid::new_v4())),
            ..EngineConfig::default()
        };
        let result = BountyEngine::bootstrap(
            config,
            Arc::new(AcceptingLedger::default()),
            Arc::new(RecordingRelay::default()),
        )
        .await;
        assert!(matches!(result, Err(BountyError::Validation(_))));
    }
}

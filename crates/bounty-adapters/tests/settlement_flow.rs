//! End-to-end flows: a reporter node and a maintainer inbox sharing one
//! ledger and one relay.

use bounty_adapters::{LocalRelay, MockLedger};
use bounty_core::{
    decode_event, Amount, BountyEngine, DropReason, EngineConfig, EventKind, Identity,
    InboxConfig, IngestOutcome, ReportDraft, ReportFilter, ReportStatus, ResponseType,
    TokenStore, TrackedRepo, TransferRequest, WirePayload,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

const COIN: &str = "UCT";
const REPO: &str = "https://github.com/acme/widget";

struct Node {
    engine: BountyEngine,
    data_dir: PathBuf,
}

impl Node {
    fn fund(&self, ledger: &MockLedger, pubkey: &str, token_id: &str, amount: u64) {
        let token = ledger.issue(token_id, pubkey, COIN, amount).unwrap();
        let store = TokenStore::open(&self.data_dir, pubkey).unwrap();
        assert!(store.add(token).unwrap());
    }

    fn balance(&self, pubkey: &str) -> Amount {
        self.engine
            .wallet_summary(pubkey)
            .unwrap()
            .balances
            .get(COIN)
            .cloned()
            .unwrap_or_default()
    }
}

fn temp_dir(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("bounty-{label}-{}", uuid::Uuid::new_v4()))
}

async fn node(
    label: &str,
    inboxes: Vec<InboxConfig>,
    ledger: &Arc<MockLedger>,
    relay: &LocalRelay,
) -> Node {
    let data_dir = temp_dir(label);
    let config = EngineConfig {
        secret_key: Some(Identity::generate().secret_hex()),
        data_dir: data_dir.clone(),
        inboxes,
        ..EngineConfig::default()
    };
    let engine = BountyEngine::bootstrap(config, ledger.clone(), Arc::new(relay.clone()))
        .await
        .unwrap();
    Node { engine, data_dir }
}

struct World {
    ledger: Arc<MockLedger>,
    relay: LocalRelay,
    reporter: Node,
    maintainer: Node,
    inbox: String,
}

async fn world(default_reward: Option<u64>) -> World {
    let ledger = Arc::new(MockLedger::new());
    let relay = LocalRelay::default();
    let inbox = Identity::generate();
    let reporter = node("reporter", Vec::new(), &ledger, &relay).await;
    let maintainer = node(
        "maintainer",
        vec![InboxConfig::new(
            inbox.secret_hex(),
            vec![TrackedRepo::new(REPO, default_reward.map(Amount::from))],
        )],
        &ledger,
        &relay,
    )
    .await;

    let reporter_key = reporter.engine.node_pubkey();
    reporter.fund(&ledger, &reporter_key, "reporter-funds", 1000);
    maintainer.fund(&ledger, &inbox.public_key(), "bounty-pool", 1000);

    World {
        ledger,
        relay,
        reporter,
        maintainer,
        inbox: inbox.public_key(),
    }
}

fn draft(recipient: &str, deposit: u64) -> ReportDraft {
    ReportDraft {
        report_id: None,
        repo_url: REPO.to_string(),
        file_path: Some("src/lib.rs".to_string()),
        description: "panic on empty input".to_string(),
        suggested_fix: None,
        recipient_pubkey: recipient.to_string(),
        sender_nametag: Some("alice".to_string()),
        deposit_amount: Amount::from(deposit),
        deposit_coin: COIN.to_string(),
    }
}

/// Submit a report from the reporter and let the maintainer ingest it.
async fn submitted(world: &World, deposit: u64) -> String {
    let outcome = world
        .reporter
        .engine
        .submit_report(draft(&world.inbox, deposit))
        .await
        .unwrap();
    world.maintainer.engine.backfill_all().await.unwrap();
    outcome.report_id
}

fn bounty_transfers(relay: &LocalRelay, report_id: &str) -> usize {
    let tag = format!("bounty:{report_id}");
    relay
        .events()
        .iter()
        .filter(|event| event.kind == EventKind::TokenTransfer)
        .filter(|event| match decode_event(event) {
            Ok(WirePayload::TokenTransfer(payload)) => payload.purpose == tag,
            _ => false,
        })
        .count()
}

#[tokio::test]
async fn accepted_report_refunds_deposit_plus_reward_once() {
    let world = world(None).await;
    let report_id = submitted(&world, 100).await;

    assert_eq!(world.maintainer.balance(&world.inbox), Amount::from(1100u64));
    let received = world.maintainer.engine.report_detail(&report_id).await.unwrap();
    assert_eq!(received.report.status, ReportStatus::Pending);

    let outcome = world
        .maintainer
        .engine
        .accept(&report_id, None, Some("confirmed".to_string()), Some(Amount::from(50u64)))
        .await
        .unwrap();
    assert_eq!(outcome.deposit_refunded, Amount::from(100u64));
    assert_eq!(outcome.reward_paid, Amount::from(50u64));
    assert!(outcome.warning.is_none());
    assert_eq!(bounty_transfers(&world.relay, &report_id), 1);

    let detail = world.maintainer.engine.report_detail(&report_id).await.unwrap();
    assert_eq!(detail.report.status, ReportStatus::Accepted);
    assert_eq!(detail.responses.len(), 1);
    assert_eq!(detail.responses[0].response_type, ResponseType::Accepted);
    assert_eq!(world.maintainer.balance(&world.inbox), Amount::from(950u64));

    // Reporter side: response applied and refund received.
    world.reporter.engine.backfill_all().await.unwrap();
    let sent = world.reporter.engine.report_detail(&report_id).await.unwrap();
    assert_eq!(sent.report.status, ReportStatus::Accepted);
    assert_eq!(sent.responses.len(), 1);
    let reporter_key = world.reporter.engine.node_pubkey();
    assert_eq!(world.reporter.balance(&reporter_key), Amount::from(1050u64));

    let reputation = world.maintainer.engine.reputation(&reporter_key).await.unwrap();
    assert_eq!(reputation.total_reports, 1);
    assert_eq!(reputation.accepted_count, 1);
}

#[tokio::test]
async fn second_accept_fails_without_paying_again() {
    let world = world(None).await;
    let report_id = submitted(&world, 100).await;

    world
        .maintainer
        .engine
        .accept(&report_id, None, None, Some(Amount::from(50u64)))
        .await
        .unwrap();
    let spends = world.ledger.spend_count();

    let err = world
        .maintainer
        .engine
        .accept(&report_id, None, None, Some(Amount::from(50u64)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "already_settled");
    assert_eq!(world.ledger.spend_count(), spends);
    assert_eq!(bounty_transfers(&world.relay, &report_id), 1);
    assert_eq!(world.maintainer.balance(&world.inbox), Amount::from(950u64));
}

#[tokio::test]
async fn rejected_report_keeps_deposit() {
    let world = world(Some(25)).await;
    let report_id = submitted(&world, 100).await;
    let spends = world.ledger.spend_count();

    let outcome = world
        .maintainer
        .engine
        .reject(&report_id, None, "not reproducible".to_string())
        .await
        .unwrap();
    assert_eq!(outcome.deposit_kept, Amount::from(100u64));
    assert_eq!(world.ledger.spend_count(), spends);
    assert_eq!(bounty_transfers(&world.relay, &report_id), 0);

    let detail = world.maintainer.engine.report_detail(&report_id).await.unwrap();
    assert_eq!(detail.report.status, ReportStatus::Rejected);
    assert_eq!(detail.responses[0].message.as_deref(), Some("not reproducible"));
    assert_eq!(world.maintainer.balance(&world.inbox), Amount::from(1100u64));

    world.reporter.engine.backfill_all().await.unwrap();
    let sent = world.reporter.engine.report_detail(&report_id).await.unwrap();
    assert_eq!(sent.report.status, ReportStatus::Rejected);

    let completed = world.maintainer.engine.complete(&report_id).await.unwrap();
    assert_eq!(completed.status, ReportStatus::Completed);
}

#[tokio::test]
async fn split_leaves_remainder_and_archives_parent() {
    let ledger = Arc::new(MockLedger::new());
    let relay = LocalRelay::default();
    let payer = node("payer", Vec::new(), &ledger, &relay).await;
    let payer_key = payer.engine.node_pubkey();
    payer.fund(&ledger, &payer_key, "tok-1000", 1000);
    let recipient = Identity::generate().public_key();

    let result = payer
        .engine
        .transfer(TransferRequest::new(&recipient, Amount::from(300u64), COIN, "tip"))
        .await;
    assert!(result.success, "{:?}", result.reason);
    assert_eq!(result.artifacts.len(), 1);
    assert!(result.artifacts[0].split);
    assert_eq!(result.artifacts[0].token.balance(COIN), Amount::from(300u64));
    assert_eq!(result.artifacts[0].token.owner, bounty_core::derive_address(&recipient));

    assert_eq!(payer.balance(&payer_key), Amount::from(700u64));
    let store = TokenStore::open(&payer.data_dir, &payer_key).unwrap();
    assert!(store.is_archived("tok-1000").unwrap());

    let owned: HashSet<String> = store.list().unwrap().into_iter().map(|t| t.id).collect();
    let archived: HashSet<String> = store.archived().unwrap().into_iter().map(|a| a.token.id).collect();
    assert!(owned.is_disjoint(&archived));

    let again = payer
        .engine
        .transfer(TransferRequest::new(&recipient, Amount::from(701u64), COIN, "tip"))
        .await;
    assert!(!again.success);
    assert_eq!(again.reason_kind.as_deref(), Some("insufficient_balance"));
}

#[tokio::test]
async fn duplicate_request_moves_on_to_next_token() {
    let ledger = Arc::new(MockLedger::new());
    let relay = LocalRelay::default();
    let payer = node("conflict", Vec::new(), &ledger, &relay).await;
    let payer_key = payer.engine.node_pubkey();
    payer.fund(&ledger, &payer_key, "tok-a", 100);
    payer.fund(&ledger, &payer_key, "tok-b", 100);
    ledger.inject_conflict("tok-a");

    let recipient = Identity::generate().public_key();
    let result = payer
        .engine
        .transfer(TransferRequest::new(&recipient, Amount::from(100u64), COIN, "tip"))
        .await;
    assert!(result.success, "{:?}", result.reason);
    assert_eq!(result.artifacts.len(), 1);
    assert_eq!(result.artifacts[0].token.id, "tok-b");

    let store = TokenStore::open(&payer.data_dir, &payer_key).unwrap();
    assert!(store.is_archived("tok-a").unwrap());
    assert!(store.is_archived("tok-b").unwrap());
    assert!(store.list().unwrap().is_empty());
}

#[tokio::test]
async fn interrupted_multi_token_payout_resumes_with_the_remainder() {
    let world = world(None).await;
    let report_id = submitted(&world, 100).await;
    // Pool plus deposit: the payout needs both tokens and the pool spend conflicts.
    world.ledger.inject_conflict("bounty-pool");

    let err = world
        .maintainer
        .engine
        .accept(&report_id, None, None, Some(Amount::from(1000u64)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "conflict_exhausted");
    let detail = world.maintainer.engine.report_detail(&report_id).await.unwrap();
    assert_eq!(detail.report.status, ReportStatus::Pending);
    // The token that did move is still delivered.
    assert_eq!(bounty_transfers(&world.relay, &report_id), 1);
    assert_eq!(world.maintainer.balance(&world.inbox), Amount::from(0u64));

    world.maintainer.fund(&world.ledger, &world.inbox, "refill", 1000);
    let outcome = world
        .maintainer
        .engine
        .accept(&report_id, None, None, Some(Amount::from(5u64)))
        .await
        .unwrap();
    assert_eq!(outcome.deposit_refunded, Amount::from(100u64));
    assert_eq!(outcome.reward_paid, Amount::from(1000u64));
    assert_eq!(bounty_transfers(&world.relay, &report_id), 2);
    assert_eq!(world.maintainer.balance(&world.inbox), Amount::from(0u64));

    world.reporter.engine.backfill_all().await.unwrap();
    let reporter_key = world.reporter.engine.node_pubkey();
    assert_eq!(world.reporter.balance(&reporter_key), Amount::from(2000u64));
}

#[tokio::test]
async fn proof_timeout_leaves_report_pending() {
    let world = world(None).await;
    let report_id = submitted(&world, 100).await;

    world.ledger.stall_proofs(true);
    let err = world
        .maintainer
        .engine
        .accept(&report_id, None, None, Some(Amount::from(50u64)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "ledger_timeout");

    let detail = world.maintainer.engine.report_detail(&report_id).await.unwrap();
    assert_eq!(detail.report.status, ReportStatus::Pending);
    assert!(detail.responses.is_empty());
}

#[tokio::test]
async fn redelivered_report_is_stored_once() {
    let world = world(None).await;
    world
        .reporter
        .engine
        .submit_report(draft(&world.inbox, 100))
        .await
        .unwrap();

    let report_event = world
        .relay
        .events()
        .into_iter()
        .find(|event| event.kind == EventKind::Report)
        .unwrap();

    let first = world.maintainer.engine.ingest(&report_event).await.unwrap();
    assert!(matches!(first, IngestOutcome::ReportStored { .. }));
    let second = world.maintainer.engine.ingest(&report_event).await.unwrap();
    assert_eq!(second, IngestOutcome::Dropped(DropReason::DuplicateReport));

    world.maintainer.engine.backfill_all().await.unwrap();
    let reports = world
        .maintainer
        .engine
        .list_reports(&ReportFilter {
            inbox: Some(world.inbox.clone()),
            ..ReportFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(reports.len(), 1);

    let reporter_key = world.reporter.engine.node_pubkey();
    let reputation = world.maintainer.engine.reputation(&reporter_key).await.unwrap();
    assert_eq!(reputation.total_reports, 1);
}

#[tokio::test]
async fn blocked_sender_reports_are_ignored() {
    let world = world(None).await;
    let reporter_key = world.reporter.engine.node_pubkey();
    world.maintainer.engine.block_sender(&reporter_key).await.unwrap();

    let report_id = submitted(&world, 100).await;
    let err = world
        .maintainer
        .engine
        .report_detail(&report_id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");
}

#![deny(unsafe_code)]

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use bounty_adapters::{JsonRpcLedgerClient, LocalRelay, MockLedger};
use bounty_core::{
    AcceptOutcome, Amount, BountyEngine, BountyError, DepositTier, EngineConfig, LedgerClient,
    ReconcileSummary, RejectOutcome, Report, ReportDetail, ReportDraft, ReportFilter,
    ReputationRecord, StatusReport, SubmitOutcome, TransferRequest, TransferResult,
    WalletSummary,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tower_http::trace::TraceLayer;

#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    pub engine: EngineConfig,
    /// JSON-RPC ledger gateway. The in-process ledger is used when unset.
    pub ledger_url: Option<String>,
}

/// Which collaborators the engine runs against, as reported by `/v1/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Backends {
    pub ledger: &'static str,
    pub relay: &'static str,
}

#[derive(Clone)]
pub struct ServiceState {
    pub engine: Arc<BountyEngine>,
    pub backends: Backends,
}

impl ServiceState {
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        let ServiceConfig { engine, ledger_url } = config;
        let (ledger, ledger_label): (Arc<dyn LedgerClient>, &'static str) = match ledger_url {
            Some(url) => (
                Arc::new(JsonRpcLedgerClient::new(&url, Duration::from_secs(30))?),
                "json_rpc",
            ),
            None => {
                tracing::warn!("no ledger url configured, settling against the in-process ledger");
                (Arc::new(MockLedger::new()), "in_process")
            }
        };
        // No network relay transport ships with this service.
        tracing::warn!(
            "using the in-process relay: reports, responses and token transfers only reach identities hosted by this process"
        );
        let engine = BountyEngine::bootstrap(engine, ledger, Arc::new(LocalRelay::default())).await?;
        Ok(Self::new(
            engine,
            Backends {
                ledger: ledger_label,
                relay: "in_process",
            },
        ))
    }

    pub fn new(engine: BountyEngine, backends: Backends) -> Self {
        Self {
            engine: Arc::new(engine),
            backends,
        }
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status))
        .route("/v1/transfer", post(transfer))
        .route("/v1/reports", get(list_reports).post(submit_report))
        .route("/v1/reports/:report_id", get(get_report))
        .route("/v1/reports/:report_id/accept", post(accept_report))
        .route("/v1/reports/:report_id/reject", post(reject_report))
        .route("/v1/reports/:report_id/complete", post(complete_report))
        .route("/v1/reports/:report_id/retransmit", post(retransmit_payment))
        .route("/v1/reputation/:sender", get(get_reputation))
        .route("/v1/reputation/:sender/trusted", put(set_trusted))
        .route("/v1/blocklist/:sender", post(block_sender).delete(unblock_sender))
        .route("/v1/wallet/:identity", get(wallet_summary))
        .route("/v1/wallet/:identity/reconcile", post(reconcile_wallet))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("core engine error: {0}")]
    Core(#[from] BountyError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Core(#[from] BountyError),
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

fn status_for(err: &BountyError) -> StatusCode {
    match err {
        BountyError::NotFound(_) => StatusCode::NOT_FOUND,
        BountyError::AlreadySettled { .. } | BountyError::IllegalTransition { .. } => {
            StatusCode::CONFLICT
        }
        BountyError::Validation(_) | BountyError::InsufficientBalance { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        BountyError::LedgerTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        BountyError::LedgerConflict(_)
        | BountyError::CandidatesExhausted { .. }
        | BountyError::Ledger(_)
        | BountyError::Transport(_) => StatusCode::BAD_GATEWAY,
        BountyError::Storage(_) | BountyError::Serialization(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Http { status, message } => {
                (status, Json(serde_json::json!({ "error": message }))).into_response()
            }
            ApiError::Core(err) => {
                let status = status_for(&err);
                if status.is_server_error() {
                    tracing::error!(error = %err, kind = err.kind(), "command failed");
                }
                (
                    status,
                    Json(serde_json::json!({ "error": err.to_string(), "kind": err.kind() })),
                )
                    .into_response()
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    node: String,
    storage: &'static str,
    ledger: &'static str,
    relay: &'static str,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "bounty-service",
        node: state.engine.node_pubkey(),
        storage: state.engine.repository().backend_label(),
        ledger: state.backends.ledger,
        relay: state.backends.relay,
    })
}

async fn status(State(state): State<ServiceState>) -> Result<Json<StatusReport>, ApiError> {
    Ok(Json(state.engine.status().await?))
}

/// Transfers always answer 200 with a tagged result; failures carry a
/// `reason_kind`.
async fn transfer(
    State(state): State<ServiceState>,
    Json(request): Json<TransferRequest>,
) -> Json<TransferResult> {
    Json(state.engine.transfer(request).await)
}

async fn submit_report(
    State(state): State<ServiceState>,
    Json(draft): Json<ReportDraft>,
) -> Result<(StatusCode, Json<SubmitOutcome>), ApiError> {
    let outcome = state.engine.submit_report(draft).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

#[derive(Debug, Clone, Serialize)]
struct ReportListResponse {
    returned: usize,
    items: Vec<Report>,
}

async fn list_reports(
    State(state): State<ServiceState>,
    Query(filter): Query<ReportFilter>,
) -> Result<Json<ReportListResponse>, ApiError> {
    let items = state.engine.list_reports(&filter).await?;
    Ok(Json(ReportListResponse {
        returned: items.len(),
        items,
    }))
}

async fn get_report(
    Path(report_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<ReportDetail>, ApiError> {
    Ok(Json(state.engine.report_detail(&report_id).await?))
}

#[derive(Debug, Clone, Default, Deserialize)]
struct AcceptRequest {
    inbox: Option<String>,
    message: Option<String>,
    reward: Option<Amount>,
}

async fn accept_report(
    Path(report_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<AcceptRequest>,
) -> Result<Json<AcceptOutcome>, ApiError> {
    Ok(Json(
        state
            .engine
            .accept(
                &report_id,
                request.inbox.as_deref(),
                request.message,
                request.reward,
            )
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct RejectRequest {
    inbox: Option<String>,
    reason: String,
}

async fn reject_report(
    Path(report_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<RejectRequest>,
) -> Result<Json<RejectOutcome>, ApiError> {
    if request.reason.trim().is_empty() {
        return Err(ApiError::bad_request("reason is required"));
    }
    Ok(Json(
        state
            .engine
            .reject(&report_id, request.inbox.as_deref(), request.reason)
            .await?,
    ))
}

async fn complete_report(
    Path(report_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<Report>, ApiError> {
    Ok(Json(state.engine.complete(&report_id).await?))
}

#[derive(Debug, Clone, Serialize)]
struct RetransmitResponse {
    report_id: String,
    event_id: String,
}

async fn retransmit_payment(
    Path(report_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<RetransmitResponse>, ApiError> {
    let event_id = state.engine.retransmit_payment(&report_id).await?;
    Ok(Json(RetransmitResponse {
        report_id,
        event_id,
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct ReputationQuery {
    /// Base deposit to price against the sender's tier.
    base: Option<Amount>,
}

#[derive(Debug, Clone, Serialize)]
struct ReputationResponse {
    record: ReputationRecord,
    tier: DepositTier,
    required_deposit: Option<Amount>,
}

async fn get_reputation(
    Path(sender): Path<String>,
    State(state): State<ServiceState>,
    Query(query): Query<ReputationQuery>,
) -> Result<Json<ReputationResponse>, ApiError> {
    let record = state.engine.reputation(&sender).await?;
    let required_deposit = match &query.base {
        Some(base) => Some(state.engine.required_deposit(&sender, base).await?),
        None => None,
    };
    Ok(Json(ReputationResponse {
        tier: record.effective_tier(),
        record,
        required_deposit,
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct TrustedRequest {
    trusted: bool,
}

async fn set_trusted(
    Path(sender): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<TrustedRequest>,
) -> Result<Json<ReputationRecord>, ApiError> {
    Ok(Json(state.engine.set_trusted(&sender, request.trusted).await?))
}

async fn block_sender(
    Path(sender): Path<String>,
    State(state): State<ServiceState>,
) -> Result<StatusCode, ApiError> {
    state.engine.block_sender(&sender).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Clone, Serialize)]
struct UnblockResponse {
    sender: String,
    removed: bool,
}

async fn unblock_sender(
    Path(sender): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<UnblockResponse>, ApiError> {
    let removed = state.engine.unblock_sender(&sender).await?;
    Ok(Json(UnblockResponse { sender, removed }))
}

async fn wallet_summary(
    Path(identity): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<WalletSummary>, ApiError> {
    Ok(Json(state.engine.wallet_summary(&identity)?))
}

async fn reconcile_wallet(
    Path(identity): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<ReconcileSummary>, ApiError> {
    Ok(Json(state.engine.reconcile(&identity).await?))
}

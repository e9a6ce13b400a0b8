use bounty_core::{EngineConfig, InboxConfig, ReportStorageConfig};
use bounty_service::{build_router, ServiceConfig, ServiceState};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_DATABASE_FILE: &str = "bounty.db";

#[derive(Debug, Parser)]
#[command(name = "bountyd", version, about = "Bug bounty settlement daemon")]
struct Cli {
    /// REST socket address to bind, e.g. 127.0.0.1:8092
    #[arg(long, default_value = "127.0.0.1:8092", env = "BOUNTY_LISTEN")]
    listen: SocketAddr,
    /// Root directory for per-identity token files.
    #[arg(long, default_value = "./data", env = "BOUNTY_DATA_DIR")]
    data_dir: PathBuf,
    /// SQLite file for reports, payments and reputation.
    /// Defaults to `bounty.db` under the data directory.
    #[arg(long, env = "BOUNTY_DATABASE", conflicts_with = "in_memory")]
    database: Option<PathBuf>,
    /// Keep reports, payments and cursors in memory only. Lost on exit.
    #[arg(long, default_value_t = false)]
    in_memory: bool,
    /// Hex secret of the node identity. Ephemeral when unset.
    #[arg(long, env = "BOUNTY_SECRET_KEY")]
    secret_key: Option<String>,
    /// Tracked inbox as `secret=repo[@reward],...`. Repeatable.
    #[arg(long = "inbox")]
    inboxes: Vec<InboxConfig>,
    /// JSON-RPC ledger gateway url.
    #[arg(long, env = "BOUNTY_LEDGER_URL")]
    ledger_url: Option<String>,
    /// Seconds between storage checkpoints.
    #[arg(long, default_value_t = 30, env = "BOUNTY_FLUSH_INTERVAL_SECS")]
    flush_interval_secs: u64,
    /// Emit logs as JSON.
    #[arg(long, default_value_t = false)]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "bounty_service=info,bounty_core=info,info".into());

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let report_storage = resolve_report_storage(&cli);
    info!(storage = report_storage.label(), "report storage selected");
    if cli.in_memory {
        warn!("in-memory storage: payment records, cursors and reputation are lost on restart");
    }
    let config = ServiceConfig {
        engine: EngineConfig {
            secret_key: cli.secret_key.clone(),
            data_dir: cli.data_dir.clone(),
            report_storage,
            inboxes: cli.inboxes.clone(),
            checkpoint_interval_secs: cli.flush_interval_secs,
            ..EngineConfig::default()
        },
        ledger_url: cli.ledger_url.clone(),
    };

    let state = ServiceState::bootstrap(config).await?;
    let engine = state.engine.clone();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = engine.spawn_listeners(shutdown_rx.clone());
    tasks.push(tokio::spawn(flush_loop(
        engine.clone(),
        Duration::from_secs(cli.flush_interval_secs.max(1)),
        shutdown_rx,
    )));

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!(
        node = %engine.node_pubkey(),
        inboxes = engine.inbox_pubkeys().len(),
        "bounty-service REST listening on {}",
        listener.local_addr()?
    );

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    for result in futures::future::join_all(tasks).await {
        if let Err(e) = result {
            error!(error = %e, "background task ended abnormally");
        }
    }
    engine.flush().await?;
    info!("bounty-service stopped");
    Ok(())
}

fn resolve_report_storage(cli: &Cli) -> ReportStorageConfig {
    if cli.in_memory {
        return ReportStorageConfig::Memory;
    }
    let path = cli
        .database
        .clone()
        .unwrap_or_else(|| cli.data_dir.join(DEFAULT_DATABASE_FILE));
    ReportStorageConfig::sqlite(path)
}

async fn flush_loop(
    engine: std::sync::Arc<bounty_core::BountyEngine>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = engine.flush().await {
                    error!(error = %e, "storage flush failed");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}

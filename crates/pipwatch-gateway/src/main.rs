//! Pipwatch gateway binary. Owns the process: config, database, the
//! dispatch engine's background loops and the monitoring HTTP surface.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Timelike, Utc};
use clap::Parser;
use tracing::{info, warn};

use pipwatch_charts::HttpChartRenderer;
use pipwatch_core::config::{PipwatchConfig, OUTCOME_RETENTION_DAYS};
use pipwatch_core::ports::{ChartRenderer, DataLayer, Transport};
use pipwatch_engine::{
    run_digest_scheduler, run_reminder_poller, run_resync, BroadcastTarget, DedupStore,
    DigestDispatcher, DigestScheduler, DispatchOutcome, DispatchSettings, MemoryDedupStore,
    NotificationDispatcher, RecipientLocks,
};
use pipwatch_store::{EventStore, OutcomeLog, RecipientStore, SqliteDataLayer};
use pipwatch_telegram::TelegramTransport;

mod app;
mod http;

/// UTC hour of the daily maintenance pass.
const MAINTENANCE_HOUR_UTC: u32 = 2;

#[derive(Parser, Debug)]
#[command(name = "pipwatch-gateway", about = "Forex news notifier and digest scheduler")]
struct Args {
    /// Path to the config file (falls back to the PIPWATCH_CONFIG env var).
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "pipwatch_gateway=info,pipwatch_engine=info,tower_http=debug".into()
            }),
        )
        .init();

    let args = Args::parse();
    let config_path = args.config.or_else(|| std::env::var("PIPWATCH_CONFIG").ok());
    let config = PipwatchConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("config load failed ({e}), using defaults");
        PipwatchConfig::default()
    });
    config.validate()?;

    let db_path = config.database.path.clone();
    ensure_parent_dir(&db_path);
    info!(path = %db_path, "opening sqlite database");

    let db = rusqlite::Connection::open(&db_path)?;
    db.execute_batch("PRAGMA journal_mode=WAL;")?;
    pipwatch_store::db::init_db(&db)?;
    info!("database schema ready");

    // Each store runs on its own connection; WAL keeps readers and the
    // outcome writer from blocking each other.
    let events = EventStore::new(rusqlite::Connection::open(&db_path)?)?;
    let recipients = RecipientStore::new(rusqlite::Connection::open(&db_path)?)?;
    let data: Arc<dyn DataLayer> = Arc::new(SqliteDataLayer::new(events, recipients));
    let outcome_log = Arc::new(OutcomeLog::new(rusqlite::Connection::open(&db_path)?)?);

    let charts: Arc<dyn ChartRenderer> = Arc::new(HttpChartRenderer::new(&config.charts));
    let transport: Arc<dyn Transport> = Arc::new(TelegramTransport::new(&config.telegram)?);
    info!("telegram transport ready");

    let dedup: Arc<dyn DedupStore> = Arc::new(MemoryDedupStore::new());
    let locks = Arc::new(RecipientLocks::new());
    let settings = DispatchSettings::from_config(&config);

    let (outcome_tx, outcome_rx) = tokio::sync::mpsc::channel::<DispatchOutcome>(256);

    let dispatcher = Arc::new(NotificationDispatcher::new(
        Arc::clone(&data),
        charts,
        Arc::clone(&transport),
        Arc::clone(&dedup),
        Arc::clone(&locks),
        outcome_tx.clone(),
        settings.clone(),
    ));
    let digests = Arc::new(DigestDispatcher::new(
        Arc::clone(&data),
        transport,
        Arc::clone(&dedup),
        locks,
        outcome_tx,
        settings,
    ));
    let scheduler = Arc::new(DigestScheduler::new());
    let broadcast = BroadcastTarget::from_config(&config.digest)?;
    if let Some(ref target) = broadcast {
        info!(chat_id = target.chat_id, "broadcast digest enabled");
    }

    // Outcome writer task. Dispatchers hand finished outcomes over the
    // channel so a slow disk never blocks a send; the task ends once
    // every sender handle is dropped.
    let writer_log = Arc::clone(&outcome_log);
    tokio::spawn(async move {
        let mut outcome_rx = outcome_rx;
        while let Some(outcome) = outcome_rx.recv().await {
            if let Err(e) = writer_log.append(&outcome) {
                warn!(id = %outcome.id, "outcome write failed: {e}");
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(run_reminder_poller(
        Arc::clone(&dispatcher),
        Duration::from_secs(config.engine.reminder_poll_minutes * 60),
        shutdown_rx.clone(),
    ));
    tokio::spawn(run_digest_scheduler(
        Arc::clone(&scheduler),
        digests,
        broadcast,
        shutdown_rx.clone(),
    ));
    tokio::spawn(run_resync(
        Arc::clone(&scheduler),
        Arc::clone(&data),
        Duration::from_secs(config.engine.resync_minutes * 60),
        shutdown_rx.clone(),
    ));
    tokio::spawn(run_maintenance(
        Arc::clone(&outcome_log),
        Arc::clone(&dedup),
        shutdown_rx,
    ));

    let state = Arc::new(app::AppState::new(Arc::clone(&scheduler)));
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.http.bind, config.http.port).parse()?;
    info!("pipwatch gateway listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("stopping background tasks");
    let _ = shutdown_tx.send(true);
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("ctrl-c handler failed: {e}");
    }
}

/// Daily housekeeping. Once per UTC day, in the maintenance hour, prune
/// outcome rows past retention and drop expired dedup fingerprints.
async fn run_maintenance(
    outcomes: Arc<OutcomeLog>,
    dedup: Arc<dyn DedupStore>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut last_run: Option<NaiveDate> = None;
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now = Utc::now();
                if now.hour() != MAINTENANCE_HOUR_UTC || last_run == Some(now.date_naive()) {
                    continue;
                }
                last_run = Some(now.date_naive());
                match outcomes.prune_older_than(OUTCOME_RETENTION_DAYS) {
                    Ok(n) if n > 0 => info!(pruned = n, "outcome log pruned"),
                    Ok(_) => {}
                    Err(e) => warn!("outcome prune failed: {e}"),
                }
                match dedup.purge_expired().await {
                    Ok(n) if n > 0 => info!(purged = n, "expired dedup entries purged"),
                    Ok(_) => {}
                    Err(e) => warn!("dedup purge failed: {e}"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("maintenance task shutting down");
                    break;
                }
            }
        }
    }
}

/// Create the parent directory for a file path if it is missing.
fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }
}

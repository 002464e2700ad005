use anyhow::Result;
use clap::Parser;
use reqwest::Url;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

use agroscout::config;
use agroscout::connectivity::ConnectivityMonitor;
use agroscout::db;
use agroscout::engine::{EngineConfig, SyncEngine};
use agroscout::entities;
use agroscout::recognition::RecognitionQueue;
use agroscout::remote::{BackendClient, RemoteService};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Run one sync cycle plus housekeeping and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/agroscout.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let backend = BackendClient::new(
        &cfg.backend.base_url,
        cfg.backend.api_key.clone(),
        cfg.backend.request_timeout_secs,
    )
    .map_err(|e| anyhow::anyhow!("backend client: {e}"))?;
    let remote: Arc<dyn RemoteService> = Arc::new(backend);

    let probe_url = Url::parse(&cfg.backend.base_url)?;
    let monitor = Arc::new(ConnectivityMonitor::new(probe_url));

    let recognition = Arc::new(
        RecognitionQueue::new(pool.clone(), remote.clone(), cfg.images_dir())
            .with_monitor(monitor.clone()),
    );
    let engine = Arc::new(SyncEngine::new(
        pool.clone(),
        remote,
        entities::registry(),
        recognition.clone(),
        EngineConfig {
            batch_size: cfg.app.batch_size,
            max_retries: cfg.app.max_retries,
            sync_interval: Duration::from_secs(cfg.app.sync_interval_secs),
        },
    ));

    if args.once {
        engine.sync().await;
        recognition.cleanup(cfg.recognition.cleanup_after_days).await?;
        let counts = db::pending_counts(&pool).await?;
        info!(?counts, "single sync cycle finished");
        return Ok(());
    }

    let poller = monitor
        .clone()
        .spawn_poller(Duration::from_secs(cfg.app.connectivity_poll_secs));

    // Daily housekeeping for the recognition queue.
    let cleanup_queue = recognition.clone();
    let cleanup_after_days = cfg.recognition.cleanup_after_days;
    let cleanup_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
        loop {
            ticker.tick().await;
            if let Err(err) = cleanup_queue.cleanup(cleanup_after_days).await {
                error!(?err, "recognition cleanup failed");
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine_task = tokio::spawn(engine.run(monitor, shutdown_rx));

    info!("agroscout sync daemon started");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = engine_task.await;
    poller.abort();
    cleanup_task.abort();

    Ok(())
}

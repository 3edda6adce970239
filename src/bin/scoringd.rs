//! scoringd - Detection Scoring Engine daemon
//!
//! This daemon:
//! 1. Loads configuration (JSON file plus SCORING_* environment overrides)
//! 2. Opens the SQLite results store and starts the store writer thread
//! 3. Serves the session API: create, score, complete, fail, results, list
//! 4. Builds per-video ground-truth indexes on first use and shares them
//! 5. On Ctrl-C, completes every accepting session and flushes the store

use anyhow::Result;
use std::sync::{mpsc, Arc};

use scoring_engine::api::{ApiConfig, ApiServer};
use scoring_engine::config::ScoringdConfig;
use scoring_engine::groundtruth::DirGroundTruthSource;
use scoring_engine::registry::SessionRegistry;
use scoring_engine::storage::{spawn_store_writer, SqliteResultsStore};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = ScoringdConfig::load()?;
    log::info!(
        "scoringd starting (db={}, groundtruth={}, tolerance={}s)",
        cfg.db_path,
        cfg.groundtruth_dir.display(),
        cfg.matching.tolerance_seconds
    );

    let store = SqliteResultsStore::open(&cfg.db_path)?;
    let (store_tx, store_rx) = mpsc::channel();
    let writer = spawn_store_writer(Box::new(store), store_rx);

    let source = DirGroundTruthSource::new(cfg.groundtruth_dir.clone());
    let registry = Arc::new(
        SessionRegistry::new(Box::new(source), cfg.session_defaults())
            .with_store_sink(store_tx),
    );

    let api_config = ApiConfig {
        addr: cfg.api_addr.clone(),
        token_path: cfg.api_token_path.clone(),
    };
    let api_handle = ApiServer::new(api_config, registry.clone()).spawn()?;
    log::info!("session api listening on {}", api_handle.addr);
    if let Some(path) = &api_handle.token_path {
        log::info!("session api token written to {}", path.display());
    } else {
        log::warn!(
            "session api token (handle securely): {}",
            api_handle.token
        );
    }

    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })?;

    log::info!("scoringd running. writing to {}", cfg.db_path);
    shutdown_rx
        .recv()
        .map_err(|_| anyhow::anyhow!("shutdown channel closed"))?;

    log::info!("shutdown requested; completing open sessions");
    let closed = registry.stop_all()?;
    log::info!("completed {} open sessions", closed);

    api_handle.stop()?;

    // Dropping the registry drops the store sender; the writer thread drains
    // the queue and exits, so the join is the flush.
    drop(registry);
    writer
        .join()
        .map_err(|_| anyhow::anyhow!("store writer thread panicked"))?;
    log::info!("results store flushed; scoringd exiting");
    Ok(())
}

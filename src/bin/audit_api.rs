//! audit_api - HTTP service for detection/ground-truth comparisons
//!
//! This daemon:
//! 1. Loads configuration (`AUDIT_CONFIG` file + `AUDIT_*` env)
//! 2. Opens the SQLite audit database
//! 3. Serves the comparison API until Ctrl-C

use anyhow::{Context, Result};
use std::sync::{mpsc, Arc};

use activity_audit::{
    api::{ApiConfig, ApiServer},
    config::AuditConfig,
    report::{JsonFileReportSink, LogReportSink},
    AuditService, InMemoryProgressStore, SqliteAuditStore,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = AuditConfig::load()?;
    let store = Arc::new(SqliteAuditStore::open(&config.db_path)?);
    let progress = Arc::new(InMemoryProgressStore::new());

    let mut service = AuditService::new(config.engine(), store, progress)
        .with_sink(Arc::new(LogReportSink));
    if let Some(dir) = &config.report_dir {
        log::info!("json reports will be written to {}", dir.display());
        service = service.with_sink(Arc::new(JsonFileReportSink::new(dir.clone())));
    }

    let api_handle = ApiServer::new(ApiConfig::from(&config), Arc::new(service)).spawn()?;
    log::info!(
        "audit_api running on {} (db {}, match policy {})",
        api_handle.addr,
        config.db_path,
        config.match_policy.as_str()
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("installing Ctrl-C handler")?;

    log::info!("audit_api waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;

    Ok(())
}

//! audit_compare - reconcile one detection file against the audit database

use anyhow::{Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use activity_audit::config::AuditConfig;
use activity_audit::progress::generate_process_id;
use activity_audit::report::{render_summary, JsonFileReportSink};
use activity_audit::{
    AuditService, CompareRequest, InMemoryProgressStore, MatchPolicy, ReconciliationEngine,
    SqliteAuditStore,
};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Detection log to reconcile (JSON array of camera records).
    #[arg(long)]
    input: PathBuf,
    /// Optional config file (JSON, or TOML by extension).
    #[arg(long, env = "AUDIT_CONFIG")]
    config: Option<PathBuf>,
    /// Path to the audit database. Defaults to the configured path.
    #[arg(long)]
    db_path: Option<String>,
    /// Store to load ground truth for. Falls back to the first record's `store`.
    #[arg(long)]
    store_id: Option<String>,
    /// Company id recorded with the result. Falls back to the first record's `company`.
    #[arg(long)]
    company_id: Option<String>,
    /// Monitoring date (YYYY-MM-DD). Falls back to the first record's `date`.
    #[arg(long)]
    date: Option<String>,
    /// Progress id to report under; generated when omitted.
    #[arg(long)]
    process_id: Option<String>,
    /// Write the full result bundle as JSON to this path.
    #[arg(long)]
    output: Option<PathBuf>,
    /// Override the configured match policy (shared|one_to_one).
    #[arg(long, value_name = "POLICY")]
    match_policy: Option<MatchPolicy>,
    /// Also write activity-report-<store>-<date>.json into this directory.
    #[arg(long)]
    report_dir: Option<PathBuf>,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::from_args(Some(&args.ui), is_tty, !stdout_is_tty);

    let config = AuditConfig::load_from(args.config.as_deref())?;
    let db_path = args.db_path.clone().unwrap_or_else(|| config.db_path.clone());
    let policy = args.match_policy.unwrap_or(config.match_policy);
    let engine = ReconciliationEngine::new(config.label_mapper(), policy);

    let payload = {
        let _stage = ui.stage("Read detections");
        std::fs::read(&args.input)
            .with_context(|| format!("reading {}", args.input.display()))?
    };

    let store = {
        let _stage = ui.stage("Open audit database");
        Arc::new(SqliteAuditStore::open(&db_path)?)
    };

    let progress = Arc::new(InMemoryProgressStore::new());
    let mut service = AuditService::new(engine, store, progress.clone());
    if let Some(dir) = args.report_dir.clone().or_else(|| config.report_dir.clone()) {
        service = service.with_sink(Arc::new(JsonFileReportSink::new(dir)));
    }
    let service = Arc::new(service);

    let process_id = args.process_id.clone().unwrap_or_else(generate_process_id);
    let request = CompareRequest {
        store_id: args.store_id.clone(),
        company_id: args.company_id.clone(),
        monitoring_date: args.date.clone(),
        process_id: Some(process_id.clone()),
    };

    let worker = service.clone();
    let job = std::thread::spawn(move || worker.compare(&payload, &request));
    let bundle = ui.follow(progress.as_ref(), &process_id, job)?;

    if let Some(path) = &args.output {
        let _stage = ui.stage("Write result bundle");
        let json = serde_json::to_vec_pretty(&bundle)?;
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    }

    print!("{}", render_summary(&bundle));
    Ok(())
}

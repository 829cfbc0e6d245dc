//! audit_history - list logged comparisons, newest first

use anyhow::Result;
use clap::Parser;
use std::io::IsTerminal;

use activity_audit::config::AuditConfig;
use activity_audit::{AuditStore, SqliteAuditStore};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the audit database. Defaults to the configured path.
    #[arg(long)]
    db_path: Option<String>,
    /// Only show comparisons for this store.
    #[arg(long)]
    store_id: Option<String>,
    /// Maximum rows to show.
    #[arg(long, default_value_t = 10)]
    limit: usize,
    /// Rows to skip (for paging).
    #[arg(long, default_value_t = 0)]
    offset: usize,
    /// Print JSON instead of a table.
    #[arg(long)]
    json: bool,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    let ui = ui::Ui::from_args(
        Some(&args.ui),
        std::io::stderr().is_terminal(),
        !std::io::stdout().is_terminal(),
    );
    let config = AuditConfig::load()?;
    let db_path = args.db_path.unwrap_or(config.db_path);

    let entries = {
        let _stage = ui.stage("Load comparison history");
        let store = SqliteAuditStore::open(&db_path)?;
        store.comparison_history(args.store_id.as_deref(), args.limit, args.offset)?
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("no comparisons logged");
        return Ok(());
    }
    println!(
        "{:>6}  {:<12} {:<12} {:<10} {:>8} {:>8} {:>8}  {}",
        "log", "store", "company", "date", "accuracy", "matched", "truth", "logged at"
    );
    for e in &entries {
        println!(
            "{:>6}  {:<12} {:<12} {:<10} {:>7.2}% {:>8} {:>8}  {}",
            e.log_id,
            e.store_id,
            e.company_id,
            e.analysis_date,
            e.overall_accuracy,
            e.total_matches,
            e.total_ground_truth,
            e.created_at
        );
    }
    Ok(())
}

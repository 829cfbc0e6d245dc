//! Post-processing of finished comparisons.
//!
//! Sinks run after a [`ResultBundle`] exists. A failing sink is logged and
//! skipped; it never turns a finished comparison into an error.

use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::reconcile::ResultBundle;
use crate::storage::AuditStore;

/// Misses listed by name in the text summary.
pub const SUMMARY_MISS_LIMIT: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccuracyBand {
    High,
    Medium,
    Low,
}

impl AccuracyBand {
    pub fn of(accuracy: f64) -> Self {
        if accuracy > 80.0 {
            AccuracyBand::High
        } else if accuracy > 60.0 {
            AccuracyBand::Medium
        } else {
            AccuracyBand::Low
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AccuracyBand::High => "high",
            AccuracyBand::Medium => "medium",
            AccuracyBand::Low => "low",
        }
    }
}

/// Plain-text report of one comparison.
pub fn render_summary(bundle: &ResultBundle) -> String {
    let mut out = String::new();
    let (store, company, date) = match &bundle.metadata {
        Some(m) => (m.store_id.as_str(), m.company_id.as_str(), m.monitoring_date.as_str()),
        None => ("N/A", "N/A", "N/A"),
    };

    let _ = writeln!(out, "Activity monitoring report");
    let _ = writeln!(out, "Store: {} | Company: {}", store, company);
    let _ = writeln!(out, "Date: {}", date);
    let _ = writeln!(
        out,
        "Overall accuracy: {:.2}% ({})",
        bundle.accuracy_percentage,
        AccuracyBand::of(bundle.accuracy_percentage).as_str()
    );
    let _ = writeln!(
        out,
        "Matched: {} | Missed by AI: {} | Ground truth: {}",
        bundle.matched_count, bundle.unmatched_count, bundle.total_ground_truth_records
    );
    let _ = writeln!(
        out,
        "AI detections: {} ({} minute-level)",
        bundle.original_detection_count, bundle.minute_level_detection_count
    );
    let _ = writeln!(
        out,
        "Processing time: {} ms",
        bundle.performance_metrics.total_processing_time_ms
    );
    if let Some(meta) = &bundle.metadata {
        let _ = writeln!(out, "Records processed: {}", meta.total_records_processed);
    }

    if !bundle.activity_breakdown.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "Per activity:");
        for a in &bundle.activity_breakdown {
            let _ = writeln!(
                out,
                "  {:<20} {:>7.2}%  {}/{} matched, {} detections",
                a.activity_name,
                a.accuracy_percentage,
                a.matched_count,
                a.ground_truth_count,
                a.detection_count
            );
        }
    }

    if !bundle.misses.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "Missed by AI:");
        for miss in bundle.misses.iter().take(SUMMARY_MISS_LIMIT) {
            let _ = writeln!(
                out,
                "  {} {} on {} (record {})",
                miss.timestamp, miss.activity_name, miss.camera, miss.ground_truth_record_id
            );
        }
        if bundle.misses.len() > SUMMARY_MISS_LIMIT {
            let _ = writeln!(out, "  ... and {} more", bundle.misses.len() - SUMMARY_MISS_LIMIT);
        }
    }

    let diag = &bundle.diagnostics;
    if !diag.unknown_labels.is_empty() || !diag.missing_activity_ids.is_empty() {
        let _ = writeln!(out);
        for (label, count) in &diag.unknown_labels {
            let _ = writeln!(out, "Unmapped label {:?}: {} bounds", label, count);
        }
        for (id, count) in &diag.missing_activity_ids {
            let _ = writeln!(out, "Activity {} missing from catalog: {} detections", id, count);
        }
    }
    out
}

// -------------------- Sinks --------------------

pub trait ResultSink: Send + Sync {
    fn name(&self) -> &str;
    fn publish(&self, bundle: &ResultBundle) -> Result<()>;
}

/// Hands every bundle to every sink. Returns how many sinks failed.
pub fn publish_all(sinks: &[Arc<dyn ResultSink>], bundle: &ResultBundle) -> usize {
    let mut failed = 0;
    for sink in sinks {
        if let Err(e) = sink.publish(bundle) {
            failed += 1;
            log::error!("result sink {} failed: {:#}", sink.name(), e);
        }
    }
    failed
}

/// Writes the text summary to the log.
#[derive(Clone, Debug, Default)]
pub struct LogReportSink;

impl ResultSink for LogReportSink {
    fn name(&self) -> &str {
        "log"
    }

    fn publish(&self, bundle: &ResultBundle) -> Result<()> {
        for line in render_summary(bundle).lines() {
            log::info!("{}", line);
        }
        Ok(())
    }
}

/// Writes `activity-report-<store>-<date>.json` into a directory.
#[derive(Clone, Debug)]
pub struct JsonFileReportSink {
    dir: PathBuf,
}

impl JsonFileReportSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn report_path(&self, bundle: &ResultBundle) -> PathBuf {
        let (store, date) = match &bundle.metadata {
            Some(m) => (m.store_id.clone(), m.monitoring_date.clone()),
            None => (
                "unknown".to_string(),
                bundle.processed_at.date_naive().to_string(),
            ),
        };
        self.dir.join(format!(
            "activity-report-{}-{}.json",
            sanitize_file_component(&store),
            sanitize_file_component(&date)
        ))
    }
}

impl ResultSink for JsonFileReportSink {
    fn name(&self) -> &str {
        "json-file"
    }

    fn publish(&self, bundle: &ResultBundle) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating report directory {}", self.dir.display()))?;
        let path = self.report_path(bundle);
        let json = serde_json::to_vec_pretty(bundle)?;
        fs::write(&path, json).with_context(|| format!("writing report {}", path.display()))?;
        log::info!("report written to {}", path.display());
        Ok(())
    }
}

/// Persists the bundle through the audit store's comparison log.
pub struct ComparisonLogSink {
    store: Arc<dyn AuditStore>,
}

impl ComparisonLogSink {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }
}

impl ResultSink for ComparisonLogSink {
    fn name(&self) -> &str {
        "comparison-log"
    }

    fn publish(&self, bundle: &ResultBundle) -> Result<()> {
        self.store.log_comparison(bundle).map(|_| ())
    }
}

fn sanitize_file_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(64)
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

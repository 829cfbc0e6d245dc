//! The reconciliation engine.
//!
//! `run` is pure apart from progress updates: it never touches the database,
//! the filesystem or the network. Persistence and reports happen afterwards
//! in [`crate::service`].

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

use crate::dedup::{count_distinct_minute_keys, deduplicate};
use crate::extract::{extract_with_diagnostics, Extraction, ExtractionDiagnostics};
use crate::ingest::RawDetectionRecord;
use crate::mapping::LabelMapper;
use crate::matcher::{match_detections, MatchPolicy};
use crate::progress::ProgressStore;
use crate::{ActivityCatalogEntry, GroundTruthRecord, MatchResult, MissResult};

// -------------------- Result Types --------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub total_processing_time_ms: u64,
    pub activities_processed_per_second: u64,
}

/// Per-activity breakdown of one run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityAccuracy {
    pub activity_id: i64,
    pub activity_name: String,
    pub ground_truth_count: usize,
    pub matched_count: usize,
    pub missed_count: usize,
    /// Minute-level detections for this activity.
    pub detection_count: usize,
    pub accuracy_percentage: f64,
}

/// Who/when a run was for. Attached by the service, not the engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportMetadata {
    pub store_id: String,
    pub company_id: String,
    pub monitoring_date: String,
    pub total_records_processed: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultBundle {
    pub matches: Vec<MatchResult>,
    pub misses: Vec<MissResult>,
    pub total_ground_truth_records: usize,
    pub matched_count: usize,
    pub unmatched_count: usize,
    pub accuracy_percentage: f64,
    pub original_detection_count: usize,
    pub minute_level_detection_count: usize,
    pub activity_breakdown: Vec<ActivityAccuracy>,
    pub performance_metrics: PerformanceMetrics,
    pub diagnostics: ExtractionDiagnostics,
    pub processed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ReportMetadata>,
}

/// Percentage rounded to two decimals; 0 when `whole` is 0.
pub fn percentage(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    (part as f64 / whole as f64 * 10_000.0).round() / 100.0
}

// -------------------- Progress Reporting --------------------

/// Optional progress sink for one run. Failures here never fail the run.
struct StepReporter<'a> {
    target: Option<(&'a dyn ProgressStore, &'a str)>,
}

impl<'a> StepReporter<'a> {
    /// Creates the entry at step 0 unless the caller already started it, in
    /// which case its current label is left alone.
    fn begin(&self) {
        let Some((store, id)) = self.target else {
            return;
        };
        let ready = match store.get(id) {
            Ok(Some(_)) => Ok(()),
            Ok(None) => store.initialize(id).map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = ready {
            log::warn!("progress [{}] could not be initialized: {:#}", id, e);
        }
    }

    fn step(&self, index: usize, message: String) {
        if let Some((store, id)) = self.target {
            if let Err(e) = store.update(id, index, Some(&message)) {
                log::warn!("progress [{}] update failed: {:#}", id, e);
            }
        }
    }

    fn abandon(&self) {
        if let Some((store, id)) = self.target {
            if let Err(e) = store.cleanup(id) {
                log::warn!("progress [{}] cleanup failed: {:#}", id, e);
            }
        }
    }
}

// -------------------- Engine --------------------

#[derive(Clone, Debug, Default)]
pub struct ReconciliationEngine {
    mapper: LabelMapper,
    policy: MatchPolicy,
}

impl ReconciliationEngine {
    pub fn new(mapper: LabelMapper, policy: MatchPolicy) -> Self {
        Self { mapper, policy }
    }

    pub fn mapper(&self) -> &LabelMapper {
        &self.mapper
    }

    pub fn policy(&self) -> MatchPolicy {
        self.policy
    }

    /// Reconciles `records` against `ground_truth`.
    ///
    /// With `progress`, the entry for the given id is created if absent and
    /// walked through steps 0..=3; on failure it is removed.
    pub fn run(
        &self,
        records: &[RawDetectionRecord],
        catalog: &[ActivityCatalogEntry],
        ground_truth: &[GroundTruthRecord],
        progress: Option<(&dyn ProgressStore, &str)>,
    ) -> Result<ResultBundle> {
        let reporter = StepReporter { target: progress };
        match self.run_steps(records, catalog, ground_truth, &reporter) {
            Ok(bundle) => Ok(bundle),
            Err(e) => {
                log::error!("reconciliation failed: {:#}", e);
                reporter.abandon();
                Err(e.context("reconciliation failed"))
            }
        }
    }

    fn run_steps(
        &self,
        records: &[RawDetectionRecord],
        catalog: &[ActivityCatalogEntry],
        ground_truth: &[GroundTruthRecord],
        reporter: &StepReporter<'_>,
    ) -> Result<ResultBundle> {
        let started = Instant::now();
        reporter.begin();
        log::info!(
            "reconciling {} detection records against {} ground-truth records ({} catalog activities)",
            records.len(),
            ground_truth.len(),
            catalog.len()
        );

        if catalog.is_empty() {
            bail!("activity catalog is empty");
        }

        reporter.step(
            1,
            format!("Extracting activities from {} detection records...", records.len()),
        );
        let Extraction {
            events,
            diagnostics,
        } = extract_with_diagnostics(records, catalog, &self.mapper);
        let original_detection_count = events.len();

        reporter.step(
            2,
            format!(
                "Comparing {} detections against {} ground-truth records...",
                original_detection_count,
                ground_truth.len()
            ),
        );
        let minute_level_detection_count = count_distinct_minute_keys(&events);
        let minute_level = deduplicate(events);
        let outcome = match_detections(&minute_level, ground_truth, self.policy);

        reporter.step(3, "Calculating accuracy metrics...".to_string());
        let mut detections_per_activity: HashMap<i64, usize> = HashMap::new();
        for d in &minute_level {
            *detections_per_activity.entry(d.event.activity_id).or_insert(0) += 1;
        }
        let activity_breakdown = breakdown(catalog, &outcome.matches, &outcome.misses, &detections_per_activity);

        let total = ground_truth.len();
        let matched = outcome.matches.len();
        let elapsed = started.elapsed();
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        let throughput = if elapsed_ms > 0.0 {
            (total as f64 / elapsed_ms * 1000.0).round() as u64
        } else {
            0
        };

        let bundle = ResultBundle {
            total_ground_truth_records: total,
            matched_count: matched,
            unmatched_count: outcome.misses.len(),
            accuracy_percentage: percentage(matched, total),
            original_detection_count,
            minute_level_detection_count,
            activity_breakdown,
            performance_metrics: PerformanceMetrics {
                total_processing_time_ms: elapsed.as_millis() as u64,
                activities_processed_per_second: throughput,
            },
            diagnostics,
            processed_at: Utc::now(),
            metadata: None,
            matches: outcome.matches,
            misses: outcome.misses,
        };

        log::info!(
            "reconciled: {} matched, {} missed, accuracy {:.2}% ({} detections, {} minute-level, {} ms)",
            bundle.matched_count,
            bundle.unmatched_count,
            bundle.accuracy_percentage,
            bundle.original_detection_count,
            bundle.minute_level_detection_count,
            bundle.performance_metrics.total_processing_time_ms
        );
        Ok(bundle)
    }
}

fn breakdown(
    catalog: &[ActivityCatalogEntry],
    matches: &[MatchResult],
    misses: &[MissResult],
    detections: &HashMap<i64, usize>,
) -> Vec<ActivityAccuracy> {
    let mut matched: HashMap<i64, usize> = HashMap::new();
    let mut missed: HashMap<i64, usize> = HashMap::new();
    for m in matches {
        *matched.entry(m.activity_id).or_insert(0) += 1;
    }
    for m in misses {
        *missed.entry(m.activity_id).or_insert(0) += 1;
    }

    catalog
        .iter()
        .filter_map(|entry| {
            let matched_count = matched.get(&entry.id).copied().unwrap_or(0);
            let missed_count = missed.get(&entry.id).copied().unwrap_or(0);
            let detection_count = detections.get(&entry.id).copied().unwrap_or(0);
            let ground_truth_count = matched_count + missed_count;
            if ground_truth_count == 0 && detection_count == 0 {
                return None;
            }
            Some(ActivityAccuracy {
                activity_id: entry.id,
                activity_name: entry.name.clone(),
                ground_truth_count,
                matched_count,
                missed_count,
                detection_count,
                accuracy_percentage: percentage(matched_count, ground_truth_count),
            })
        })
        .collect()
}

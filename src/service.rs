//! Comparison orchestration: input checks, data loading, the engine run and
//! post-processing, with progress reported under the caller's process id.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use std::sync::Arc;

use crate::dedup::parse_timestamp;
use crate::ingest::{parse_detection_json, InputError, RawDetectionRecord};
use crate::progress::{validate_process_id, ProgressStore};
use crate::reconcile::{ReconciliationEngine, ReportMetadata, ResultBundle};
use crate::report::{publish_all, ComparisonLogSink, ResultSink};
use crate::storage::AuditStore;

const LOADING_STEP: &str = "Loading database activities and monitoring data...";
const SAVING_STEP: &str = "Saving results and sending report...";
const DONE_STEP: &str = "Comparison completed successfully!";

/// Caller-supplied scope of one comparison. Missing store, company or date
/// fall back to the first detection record.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompareRequest {
    pub store_id: Option<String>,
    pub company_id: Option<String>,
    pub monitoring_date: Option<String>,
    pub process_id: Option<String>,
}

pub struct AuditService {
    engine: ReconciliationEngine,
    store: Arc<dyn AuditStore>,
    progress: Arc<dyn ProgressStore>,
    sinks: Vec<Arc<dyn ResultSink>>,
}

impl AuditService {
    /// The comparison log of `store` is always the first sink.
    pub fn new(
        engine: ReconciliationEngine,
        store: Arc<dyn AuditStore>,
        progress: Arc<dyn ProgressStore>,
    ) -> Self {
        let log_sink: Arc<dyn ResultSink> = Arc::new(ComparisonLogSink::new(store.clone()));
        Self {
            engine,
            store,
            progress,
            sinks: vec![log_sink],
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn engine(&self) -> &ReconciliationEngine {
        &self.engine
    }

    pub fn store(&self) -> &Arc<dyn AuditStore> {
        &self.store
    }

    pub fn progress(&self) -> &Arc<dyn ProgressStore> {
        &self.progress
    }

    /// Runs a comparison for an uploaded detection payload.
    pub fn compare(&self, payload: &[u8], request: &CompareRequest) -> Result<ResultBundle> {
        if let Some(id) = &request.process_id {
            validate_process_id(id)?;
        }
        let records = parse_detection_json(payload)?;
        self.compare_records(&records, request)
    }

    pub fn compare_records(
        &self,
        records: &[RawDetectionRecord],
        request: &CompareRequest,
    ) -> Result<ResultBundle> {
        let metadata = resolve_metadata(request, records)?;
        let process_id = request.process_id.as_deref();

        if let Some(id) = process_id {
            self.progress.initialize(id)?;
            self.progress.update(id, 0, Some(LOADING_STEP))?;
        }

        match self.run_tracked(records, metadata, process_id) {
            Ok(bundle) => Ok(bundle),
            Err(e) => {
                if let Some(id) = process_id {
                    if let Err(cleanup_err) = self.progress.cleanup(id) {
                        log::warn!("progress [{}] cleanup failed: {:#}", id, cleanup_err);
                    }
                }
                Err(e)
            }
        }
    }

    fn run_tracked(
        &self,
        records: &[RawDetectionRecord],
        metadata: ResolvedMetadata,
        process_id: Option<&str>,
    ) -> Result<ResultBundle> {
        log::info!(
            "comparison for store {} company {} on {} ({} records, process {})",
            metadata.store_id,
            metadata.company_id,
            metadata.date,
            records.len(),
            process_id.unwrap_or("none")
        );

        let catalog = self
            .store
            .activity_catalog()
            .context("loading activity catalog")?;
        let ground_truth = self
            .store
            .ground_truth(&metadata.store_id, metadata.date)
            .context("loading monitoring activities")?;

        let progress = process_id.map(|id| (self.progress.as_ref(), id));
        let mut bundle = self
            .engine
            .run(records, &catalog, &ground_truth, progress)?;
        bundle.metadata = Some(ReportMetadata {
            store_id: metadata.store_id,
            company_id: metadata.company_id,
            monitoring_date: metadata.date.to_string(),
            total_records_processed: records.len(),
        });

        if let Some(id) = process_id {
            self.progress.update(id, 4, Some(SAVING_STEP))?;
        }
        let failed = publish_all(&self.sinks, &bundle);
        if failed > 0 {
            log::warn!("{} of {} result sinks failed", failed, self.sinks.len());
        }
        if let Some(id) = process_id {
            self.progress.complete(id, DONE_STEP)?;
        }
        Ok(bundle)
    }
}

struct ResolvedMetadata {
    store_id: String,
    company_id: String,
    date: NaiveDate,
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn resolve_metadata(
    request: &CompareRequest,
    records: &[RawDetectionRecord],
) -> Result<ResolvedMetadata> {
    let first = records.first();
    let store_id = non_empty(request.store_id.as_deref())
        .or_else(|| first.and_then(|r| non_empty(r.store.as_deref())));
    let company_id = non_empty(request.company_id.as_deref())
        .or_else(|| first.and_then(|r| non_empty(r.company.as_deref())));
    let date = non_empty(request.monitoring_date.as_deref())
        .or_else(|| first.and_then(|r| non_empty(r.date.as_deref())));

    let (Some(store_id), Some(company_id), Some(date)) = (store_id, company_id, date) else {
        return Err(InputError::new(
            "missing required metadata: storeId, companyId, or monitoringDate",
        )
        .into());
    };
    let date = parse_monitoring_date(&date)?;
    Ok(ResolvedMetadata {
        store_id,
        company_id,
        date,
    })
}

/// Accepts `YYYY-MM-DD` or any timestamp form the deduplicator understands.
pub fn parse_monitoring_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .ok()
        .or_else(|| parse_timestamp(raw).map(|dt| dt.date_naive()))
        .ok_or_else(|| InputError::new(format!("invalid monitoring date {:?}", raw)).into())
}

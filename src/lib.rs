//! Activity Audit
//!
//! Reconciles AI-generated activity detections (camera observations with
//! bounding-box labels) against the monitoring activities recorded for a
//! store, and reports which recorded activities the AI saw.
//!
//! # Pipeline
//!
//! 1. `ingest`: parse the raw detection JSON array.
//! 2. `mapping` + `extract`: resolve every bounding-box label into activity
//!    detections through the activity catalog.
//! 3. `dedup`: collapse detections sharing a minute, activity and camera.
//! 4. `matcher`: join the minute-level detections against ground truth.
//! 5. `reconcile`: metrics and the final `ResultBundle`.
//!
//! Everything around the pipeline (SQLite access, reports, the HTTP API,
//! progress tracking) is a collaborator passed in by the caller.
//!
//! # Composite key
//!
//! All grouping and joining uses `(minute-truncated timestamp, activity id,
//! camera)`, see [`dedup::MinuteKey`].

use serde::{Deserialize, Serialize};

pub mod api;
pub mod config;
pub mod dedup;
pub mod extract;
pub mod ingest;
pub mod mapping;
pub mod matcher;
pub mod progress;
pub mod reconcile;
pub mod report;
pub mod service;
pub mod storage;

pub use dedup::{count_distinct_minute_keys, deduplicate, normalize_to_minute, MinuteKey};
pub use extract::{extract, extract_with_diagnostics, Extraction, ExtractionDiagnostics};
pub use ingest::{parse_detection_json, BoundingBox, InputError, RawDetectionRecord};
pub use mapping::LabelMapper;
pub use matcher::{match_detections, MatchOutcome, MatchPolicy};
pub use progress::{InMemoryProgressStore, ProgressSnapshot, ProgressStatus, ProgressStore};
pub use reconcile::{PerformanceMetrics, ReconciliationEngine, ReportMetadata, ResultBundle};
pub use service::{AuditService, CompareRequest};
pub use storage::{AuditStore, ComparisonLogEntry, InMemoryAuditStore, SqliteAuditStore};

// -------------------- Reference Data --------------------

/// One activity the store can be monitored for.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityCatalogEntry {
    pub id: i64,
    pub name: String,
}

impl ActivityCatalogEntry {
    pub fn new(id: i64, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
        }
    }
}

/// A monitoring activity recorded in the database. Read-only input.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroundTruthRecord {
    pub record_id: i64,
    pub activity_id: i64,
    pub activity_name: String,
    pub timestamp: String,
    pub camera: String,
}

// -------------------- Detections --------------------

/// One resolved observation: a single (record, bound, activity id) triple.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionEvent {
    pub timestamp: String,
    pub activity_id: i64,
    pub activity_name: String,
    pub label: String,
    pub camera: String,
    pub zone: Option<String>,
    pub confidence: f64,
    pub image: Option<String>,
    pub source_record_index: usize,
    pub source_bound_index: usize,
}

/// The first detection seen for a composite key plus everything collapsed into it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeduplicatedEvent {
    #[serde(flatten)]
    pub event: DetectionEvent,
    /// 1 + number of duplicates.
    pub original_count: usize,
    pub duplicates: Vec<DetectionEvent>,
}

impl DeduplicatedEvent {
    pub fn seed(event: DetectionEvent) -> Self {
        Self {
            event,
            original_count: 1,
            duplicates: Vec::new(),
        }
    }

    pub fn absorb(&mut self, duplicate: DetectionEvent) {
        self.original_count += 1;
        self.duplicates.push(duplicate);
    }
}

// -------------------- Match Results --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchType {
    AccurateDetection,
    MissedByAi,
}

/// A ground-truth record the AI also detected.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    pub timestamp: String,
    pub activity_id: i64,
    pub activity_name: String,
    pub camera: String,
    pub confidence: f64,
    pub zone: Option<String>,
    pub ground_truth_record_id: i64,
    pub detection_record_index: usize,
    /// How many raw detections fell into the matched minute.
    pub original_detection_count: usize,
    pub match_type: MatchType,
}

/// A ground-truth record with no detection in the same minute.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissResult {
    pub timestamp: String,
    pub activity_id: i64,
    pub activity_name: String,
    pub camera: String,
    pub ground_truth_record_id: i64,
    pub match_type: MatchType,
}

//! Flattening raw detection records into activity detections.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::dedup::parse_timestamp;
use crate::ingest::RawDetectionRecord;
use crate::mapping::LabelMapper;
use crate::{ActivityCatalogEntry, DetectionEvent};

/// Soft data-quality faults seen during extraction. None of these fail a run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionDiagnostics {
    /// Bounds whose label has no mapping, counted per label.
    pub unknown_labels: BTreeMap<String, usize>,
    /// Mapped ids that are not in the activity catalog, counted per id.
    pub missing_activity_ids: BTreeMap<i64, usize>,
    /// Emitted events per label.
    pub label_distribution: BTreeMap<String, usize>,
    /// Records whose timestamp could not be parsed. Their events still flow
    /// through with the raw timestamp as key.
    pub unparsable_timestamps: usize,
    pub records_without_bounds: usize,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Extraction {
    pub events: Vec<DetectionEvent>,
    pub diagnostics: ExtractionDiagnostics,
}

/// Expands every (record, bound, mapped id) into a [`DetectionEvent`].
pub fn extract(
    records: &[RawDetectionRecord],
    catalog: &[ActivityCatalogEntry],
    mapper: &LabelMapper,
) -> Vec<DetectionEvent> {
    extract_with_diagnostics(records, catalog, mapper).events
}

pub fn extract_with_diagnostics(
    records: &[RawDetectionRecord],
    catalog: &[ActivityCatalogEntry],
    mapper: &LabelMapper,
) -> Extraction {
    let by_id: HashMap<i64, &ActivityCatalogEntry> =
        catalog.iter().map(|entry| (entry.id, entry)).collect();

    let mut out = Extraction::default();
    let diag = &mut out.diagnostics;
    let mut unparsable_seen: BTreeSet<&str> = BTreeSet::new();

    for (record_index, record) in records.iter().enumerate() {
        if record.bounds.is_empty() {
            diag.records_without_bounds += 1;
            continue;
        }
        if parse_timestamp(record.timestamp()).is_none() {
            if unparsable_seen.insert(record.timestamp()) {
                log::warn!(
                    "record {} has an unparsable timestamp {:?}; keying on the raw value",
                    record_index,
                    record.timestamp()
                );
            }
            diag.unparsable_timestamps += 1;
        }

        for (bound_index, bound) in record.bounds.iter().enumerate() {
            let label = match bound.label.as_deref() {
                Some(label) if !label.is_empty() => label,
                _ => continue,
            };
            let ids = mapper.resolve(label);
            if ids.is_empty() {
                let seen = diag.unknown_labels.entry(label.to_string()).or_insert(0);
                if *seen == 0 {
                    log::warn!("no activity mapping for label {:?}", label);
                }
                *seen += 1;
                continue;
            }

            for &activity_id in ids {
                let entry = match by_id.get(&activity_id) {
                    Some(entry) => entry,
                    None => {
                        let seen = diag.missing_activity_ids.entry(activity_id).or_insert(0);
                        if *seen == 0 {
                            log::warn!(
                                "activity id {} (label {:?}) is not in the catalog",
                                activity_id,
                                label
                            );
                        }
                        *seen += 1;
                        continue;
                    }
                };
                *diag.label_distribution.entry(label.to_string()).or_insert(0) += 1;
                out.events.push(DetectionEvent {
                    timestamp: record.timestamp().to_string(),
                    activity_id,
                    activity_name: entry.name.clone(),
                    label: label.to_string(),
                    camera: record.camera().to_string(),
                    zone: bound.zone.clone(),
                    confidence: bound.confidence,
                    image: record.image.clone(),
                    source_record_index: record_index,
                    source_bound_index: bound_index,
                });
            }
        }
    }

    log::debug!("label distribution: {:?}", out.diagnostics.label_distribution);
    out
}

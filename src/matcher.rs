//! Joining minute-level detections against ground truth.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

use crate::dedup::MinuteKey;
use crate::{DeduplicatedEvent, GroundTruthRecord, MatchResult, MatchType, MissResult};

/// How many ground-truth records one detection may satisfy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    /// A detection satisfies every ground-truth record on its key.
    #[default]
    Shared,
    /// A detection is consumed by the first ground-truth record on its key.
    OneToOne,
}

impl MatchPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchPolicy::Shared => "shared",
            MatchPolicy::OneToOne => "one_to_one",
        }
    }
}

impl FromStr for MatchPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "shared" | "many_to_many" => Ok(MatchPolicy::Shared),
            "one_to_one" => Ok(MatchPolicy::OneToOne),
            other => Err(anyhow!(
                "unknown match policy {:?} (expected shared or one_to_one)",
                other
            )),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MatchOutcome {
    pub matches: Vec<MatchResult>,
    pub misses: Vec<MissResult>,
}

/// Probes every ground-truth record, in input order, against the detections.
///
/// Detections are indexed by [`MinuteKey`]; with duplicate keys in `detections`
/// the later one wins, which cannot happen for `deduplicate` output.
pub fn match_detections(
    detections: &[DeduplicatedEvent],
    ground_truth: &[GroundTruthRecord],
    policy: MatchPolicy,
) -> MatchOutcome {
    let mut index: HashMap<MinuteKey, &DeduplicatedEvent> = detections
        .iter()
        .map(|d| (MinuteKey::of(&d.event), d))
        .collect();

    let mut outcome = MatchOutcome {
        matches: Vec::new(),
        misses: Vec::new(),
    };

    for record in ground_truth {
        let key = MinuteKey::new(&record.timestamp, record.activity_id, &record.camera);
        let hit = match policy {
            MatchPolicy::Shared => index.get(&key).copied(),
            MatchPolicy::OneToOne => index.remove(&key),
        };
        match hit {
            Some(detection) => outcome.matches.push(MatchResult {
                timestamp: record.timestamp.clone(),
                activity_id: record.activity_id,
                activity_name: record.activity_name.clone(),
                camera: record.camera.clone(),
                confidence: detection.event.confidence,
                zone: detection.event.zone.clone(),
                ground_truth_record_id: record.record_id,
                detection_record_index: detection.event.source_record_index,
                original_detection_count: detection.original_count,
                match_type: MatchType::AccurateDetection,
            }),
            None => outcome.misses.push(MissResult {
                timestamp: record.timestamp.clone(),
                activity_id: record.activity_id,
                activity_name: record.activity_name.clone(),
                camera: record.camera.clone(),
                ground_truth_record_id: record.record_id,
                match_type: MatchType::MissedByAi,
            }),
        }
    }

    log::debug!(
        "matched {} of {} ground-truth records against {} minute-level detections ({})",
        outcome.matches.len(),
        ground_truth.len(),
        detections.len(),
        policy.as_str()
    );
    outcome
}

//! Minute-level deduplication.
//!
//! Detectors emit several frames per second; ground truth is recorded per
//! minute. Every detection is reduced to a [`MinuteKey`] and detections that
//! share a key collapse into one [`DeduplicatedEvent`].

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Timelike, Utc};
use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::{DeduplicatedEvent, DetectionEvent};

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

const OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%z",
];

/// Parses a detection or ground-truth timestamp into UTC.
///
/// RFC 3339 with an offset is honoured; naive date-times (and bare dates) are
/// taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(raw, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Truncates to the start of the minute in canonical form
/// (`YYYY-MM-DDTHH:MM:00.000Z`). Unparsable input comes back unchanged.
pub fn normalize_to_minute(raw: &str) -> String {
    match parse_timestamp(raw).and_then(truncate_to_minute) {
        Some(minute) => minute.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => raw.to_string(),
    }
}

fn truncate_to_minute(dt: DateTime<Utc>) -> Option<DateTime<Utc>> {
    dt.with_second(0)?.with_nanosecond(0)
}

/// Composite join key shared by deduplication and matching.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MinuteKey {
    pub minute: String,
    pub activity_id: i64,
    pub camera: String,
}

impl MinuteKey {
    pub fn new(timestamp: &str, activity_id: i64, camera: &str) -> Self {
        Self {
            minute: normalize_to_minute(timestamp),
            activity_id,
            camera: camera.to_string(),
        }
    }

    pub fn of(event: &DetectionEvent) -> Self {
        Self::new(&event.timestamp, event.activity_id, &event.camera)
    }
}

impl fmt::Display for MinuteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.minute, self.activity_id, self.camera)
    }
}

/// Collapses events sharing a [`MinuteKey`].
///
/// The first event for a key is the representative; later ones are appended
/// to its `duplicates`. Output follows first-seen key order.
pub fn deduplicate<I>(events: I) -> Vec<DeduplicatedEvent>
where
    I: IntoIterator<Item = DetectionEvent>,
{
    let mut slots: HashMap<MinuteKey, usize> = HashMap::new();
    let mut grouped: Vec<DeduplicatedEvent> = Vec::new();
    let mut total = 0usize;

    for event in events {
        total += 1;
        let key = MinuteKey::of(&event);
        match slots.get(&key) {
            Some(&slot) => grouped[slot].absorb(event),
            None => {
                slots.insert(key, grouped.len());
                grouped.push(DeduplicatedEvent::seed(event));
            }
        }
    }

    let collapsed = grouped.iter().filter(|g| g.original_count > 1).count();
    if collapsed > 0 {
        log::debug!(
            "minute dedup: {} detections -> {} minute keys ({} keys had duplicates)",
            total,
            grouped.len(),
            collapsed
        );
        for group in grouped.iter().filter(|g| g.original_count > 1) {
            log::trace!(
                "  {} at {} ({}): {} entries in the same minute",
                group.event.activity_name,
                group.event.camera,
                group.event.timestamp,
                group.original_count
            );
        }
    }
    grouped
}

/// Number of distinct minute keys, without building the groups.
pub fn count_distinct_minute_keys(events: &[DetectionEvent]) -> usize {
    events.iter().map(MinuteKey::of).collect::<HashSet<_>>().len()
}

//! Raw detection input.
//!
//! Detection logs come from camera pipelines with loose typing: numeric
//! camera ids, missing confidences, `bounds` that is sometimes `null` or an
//! object. Parsing is lenient at the field level and strict at the shape
//! level: the payload must be a non-empty array of objects.

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::Deserializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Rejected caller input. Surfaces as HTTP 400 / CLI usage error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputError {
    pub message: String,
}

impl InputError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for InputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for InputError {}

/// True when `err` (or anything in its context chain) is an [`InputError`].
pub fn is_input_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<InputError>())
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    #[serde(default, deserialize_with = "lenient_text")]
    pub label: Option<String>,
    #[serde(default, deserialize_with = "lenient_confidence")]
    pub confidence: f64,
    #[serde(default, deserialize_with = "lenient_text")]
    pub zone: Option<String>,
}

/// One camera observation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawDetectionRecord {
    /// Numeric values are epoch milliseconds and are stored as RFC 3339.
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub camera: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub image: Option<String>,
    #[serde(default, deserialize_with = "lenient_bounds")]
    pub bounds: Vec<BoundingBox>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub store: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub company: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub date: Option<String>,
}

impl RawDetectionRecord {
    pub fn timestamp(&self) -> &str {
        self.timestamp.as_deref().unwrap_or("")
    }

    pub fn camera(&self) -> &str {
        self.camera.as_deref().unwrap_or("")
    }
}

/// Parses an uploaded detection payload.
pub fn parse_detection_json(bytes: &[u8]) -> Result<Vec<RawDetectionRecord>> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| InputError::new(format!("invalid JSON payload: {}", e)))?;
    let items = match value {
        Value::Array(items) => items,
        other => {
            return Err(InputError::new(format!(
                "detection payload must be a JSON array, got {}",
                json_kind(&other)
            ))
            .into())
        }
    };
    if items.is_empty() {
        return Err(InputError::new("detection payload is empty").into());
    }

    let mut records = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        if !item.is_object() {
            return Err(InputError::new(format!(
                "record {} must be an object, got {}",
                index,
                json_kind(&item)
            ))
            .into());
        }
        let record: RawDetectionRecord = serde_json::from_value(item)
            .map_err(|e| InputError::new(format!("record {} is malformed: {}", index, e)))?;
        records.push(record);
    }
    Ok(records)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn text_from_value(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn lenient_text<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(text_from_value))
}

fn lenient_timestamp<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => {
            let millis = n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64));
            match millis.and_then(DateTime::<Utc>::from_timestamp_millis) {
                Some(dt) => Some(dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
                None => Some(n.to_string()),
            }
        }
        other => other.and_then(text_from_value),
    })
}

fn lenient_confidence<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    let confidence = match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    };
    if confidence.is_finite() {
        Ok(confidence)
    } else {
        Ok(0.0)
    }
}

// Malformed elements keep their slot so bound indices stay stable.
fn lenient_bounds<'de, D>(deserializer: D) -> std::result::Result<Vec<BoundingBox>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        Some(Value::Array(items)) => Ok(items
            .into_iter()
            .map(|item| serde_json::from_value(item).unwrap_or_default())
            .collect()),
        _ => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_typical_record() {
        let payload = br#"[{
            "timestamp": "2024-01-15T10:30:15.250Z",
            "camera": "cam-1",
            "image": "frame-001.jpg",
            "bounds": [{"label": "person-customer", "confidence": 0.91, "zone": "entrance"}]
        }]"#;
        let records = parse_detection_json(payload).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].camera(), "cam-1");
        assert_eq!(records[0].bounds.len(), 1);
        assert_eq!(records[0].bounds[0].label.as_deref(), Some("person-customer"));
        assert_eq!(records[0].bounds[0].zone.as_deref(), Some("entrance"));
    }

    #[test]
    fn numeric_camera_and_missing_confidence_are_tolerated() {
        let payload = br#"[{"timestamp": "2024-01-15T10:30:00Z", "camera": 3,
            "bounds": [{"label": "stretching"}, {"label": "stretching", "confidence": null}]}]"#;
        let records = parse_detection_json(payload).unwrap();
        assert_eq!(records[0].camera(), "3");
        assert_eq!(records[0].bounds[0].confidence, 0.0);
        assert_eq!(records[0].bounds[1].confidence, 0.0);
    }

    #[test]
    fn numeric_timestamp_is_epoch_millis() {
        let payload = br#"[{"timestamp": 1705314645000, "camera": "cam-1", "bounds": []},
            {"timestamp": 1705314645123.4, "camera": "cam-1"}]"#;
        let records = parse_detection_json(payload).unwrap();
        assert_eq!(records[0].timestamp(), "2024-01-15T10:30:45.000Z");
        assert_eq!(records[1].timestamp(), "2024-01-15T10:30:45.123Z");
    }

    #[test]
    fn non_array_bounds_become_empty() {
        let payload = br#"[
            {"timestamp": "2024-01-15T10:30:00Z", "camera": "c", "bounds": null},
            {"timestamp": "2024-01-15T10:30:00Z", "camera": "c", "bounds": {"label": "x"}},
            {"timestamp": "2024-01-15T10:30:00Z", "camera": "c"}
        ]"#;
        let records = parse_detection_json(payload).unwrap();
        assert!(records.iter().all(|r| r.bounds.is_empty()));
    }

    #[test]
    fn malformed_bound_keeps_its_index() {
        let payload = br#"[{"timestamp": "t", "camera": "c",
            "bounds": [42, {"label": "stretching", "confidence": 0.5}]}]"#;
        let records = parse_detection_json(payload).unwrap();
        assert_eq!(records[0].bounds.len(), 2);
        assert_eq!(records[0].bounds[0], BoundingBox::default());
        assert_eq!(records[0].bounds[1].label.as_deref(), Some("stretching"));
    }

    #[test]
    fn rejects_bad_shapes() {
        for payload in [
            &b"not json"[..],
            &br#"{"timestamp": "t"}"#[..],
            &b"[]"[..],
            &br#"[{"camera": "c"}, 7]"#[..],
        ] {
            let err = parse_detection_json(payload).unwrap_err();
            assert!(is_input_error(&err), "expected input error for {:?}", payload);
        }
    }

    #[test]
    fn error_names_offending_record() {
        let err = parse_detection_json(br#"[{"camera": "c"}, "oops"]"#).unwrap_err();
        assert!(err.to_string().contains("record 1"));
    }

    #[test]
    fn input_error_survives_context() {
        let err = parse_detection_json(b"[]")
            .map_err(|e| e.context("loading upload"))
            .unwrap_err();
        assert!(is_input_error(&err));
    }
}

use activity_audit::progress::InMemoryProgressStore;
use activity_audit::{
    deduplicate, extract, parse_detection_json, ActivityCatalogEntry, GroundTruthRecord,
    LabelMapper, MatchPolicy, MatchType, ProgressStore, ReconciliationEngine,
};

fn catalog() -> Vec<ActivityCatalogEntry> {
    vec![
        ActivityCatalogEntry::new(1, "Sales Desk"),
        ActivityCatalogEntry::new(2, "Stretching"),
        ActivityCatalogEntry::new(3, "Cleaning"),
        ActivityCatalogEntry::new(4, "Making Calls"),
        ActivityCatalogEntry::new(5, "Intake"),
    ]
}

fn truth(record_id: i64, ts: &str, activity_id: i64, camera: &str) -> GroundTruthRecord {
    GroundTruthRecord {
        record_id,
        activity_id,
        activity_name: catalog()
            .into_iter()
            .find(|a| a.id == activity_id)
            .map(|a| a.name)
            .unwrap_or_default(),
        timestamp: ts.to_string(),
        camera: camera.to_string(),
    }
}

#[test]
fn customer_and_employee_bounds_expand_to_five_events() {
    let records = parse_detection_json(
        br#"[{"timestamp": "2024-01-15T10:30:00Z", "camera": "cam-1", "image": "a.jpg",
              "bounds": [{"label": "person-customer", "confidence": 0.92},
                         {"label": "person-employee", "confidence": 0.81}]}]"#,
    )
    .unwrap();
    let events = extract(&records, &catalog(), &LabelMapper::default());
    assert_eq!(events.len(), 5);
    let mut ids: Vec<i64> = events.iter().map(|e| e.activity_id).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
}

#[test]
fn two_records_a_second_apart_collapse() {
    let records = parse_detection_json(
        br#"[{"timestamp": "2024-01-15T10:30:10Z", "camera": "cam-1", "bounds": [{"label": "stretching"}]},
             {"timestamp": "2024-01-15T10:30:11Z", "camera": "cam-1", "bounds": [{"label": "stretching"}]}]"#,
    )
    .unwrap();
    let deduped = deduplicate(extract(&records, &catalog(), &LabelMapper::default()));
    assert_eq!(deduped.len(), 1);
    assert_eq!(deduped[0].original_count, 2);
    assert_eq!(deduped[0].duplicates.len(), 1);
    assert_eq!(deduped[0].event.source_record_index, 0);
}

#[test]
fn three_truth_records_share_one_detection() {
    let records = parse_detection_json(
        br#"[{"timestamp": "2024-01-15T10:30:30Z", "camera": "cam-1",
              "bounds": [{"label": "person-customer", "confidence": 0.7, "zone": "door"}]}]"#,
    )
    .unwrap();
    let gt = vec![
        truth(11, "2024-01-15 10:30:00", 5, "cam-1"),
        truth(12, "2024-01-15 10:30:20", 5, "cam-1"),
        truth(13, "2024-01-15 10:30:59", 5, "cam-1"),
    ];
    let bundle = ReconciliationEngine::default()
        .run(&records, &catalog(), &gt, None)
        .unwrap();
    assert_eq!(bundle.matched_count, 3);
    assert!(bundle
        .matches
        .iter()
        .all(|m| m.detection_record_index == 0 && m.zone.as_deref() == Some("door")));
    assert_eq!(bundle.accuracy_percentage, 100.0);

    let strict = ReconciliationEngine::new(LabelMapper::default(), MatchPolicy::OneToOne)
        .run(&records, &catalog(), &gt, None)
        .unwrap();
    assert_eq!(strict.matched_count, 1);
    assert_eq!(strict.unmatched_count, 2);
}

#[test]
fn truth_without_detection_is_a_miss() {
    let records = parse_detection_json(
        br#"[{"timestamp": "2024-01-15T10:30:30Z", "camera": "cam-1", "bounds": [{"label": "stretching"}]}]"#,
    )
    .unwrap();
    let gt = vec![truth(21, "2024-01-15 14:00:00", 3, "cam-4")];
    let bundle = ReconciliationEngine::default()
        .run(&records, &catalog(), &gt, None)
        .unwrap();
    assert_eq!(bundle.matched_count, 0);
    assert_eq!(bundle.misses.len(), 1);
    assert_eq!(bundle.misses[0].ground_truth_record_id, 21);
    assert_eq!(bundle.misses[0].match_type, MatchType::MissedByAi);
    assert_eq!(bundle.accuracy_percentage, 0.0);
}

#[test]
fn seconds_and_millis_never_split_a_minute() {
    let records = parse_detection_json(
        br#"[{"timestamp": "2024-01-15T10:30:59.999Z", "camera": "cam-2", "bounds": [{"label": "person-customer"}]}]"#,
    )
    .unwrap();
    let gt = vec![truth(31, "2024-01-15T10:30:00.000Z", 5, "cam-2")];
    let bundle = ReconciliationEngine::default()
        .run(&records, &catalog(), &gt, None)
        .unwrap();
    assert_eq!(bundle.matched_count, 1);
}

#[test]
fn unknown_labels_only_show_up_in_diagnostics() {
    let records = parse_detection_json(
        br#"[{"timestamp": "2024-01-15T10:30:00Z", "camera": "cam-1", "bounds": [{"label": "shopping-cart"}]}]"#,
    )
    .unwrap();
    let bundle = ReconciliationEngine::default()
        .run(&records, &catalog(), &[], None)
        .unwrap();
    assert_eq!(bundle.original_detection_count, 0);
    assert_eq!(bundle.diagnostics.unknown_labels.get("shopping-cart"), Some(&1));
}

#[test]
fn minute_level_count_never_exceeds_original() {
    let records = parse_detection_json(
        br#"[{"timestamp": "2024-01-15T10:30:00Z", "camera": "cam-1", "bounds": [{"label": "person-employee"}]},
             {"timestamp": "2024-01-15T10:30:20Z", "camera": "cam-1", "bounds": [{"label": "person-employee"}]},
             {"timestamp": "2024-01-15T10:31:00Z", "camera": "cam-1", "bounds": [{"label": "stretching"}]}]"#,
    )
    .unwrap();
    let bundle = ReconciliationEngine::default()
        .run(&records, &catalog(), &[], None)
        .unwrap();
    assert_eq!(bundle.original_detection_count, 9);
    assert_eq!(bundle.minute_level_detection_count, 5);

    let distinct = parse_detection_json(
        br#"[{"timestamp": "2024-01-15T10:30:00Z", "camera": "cam-1", "bounds": [{"label": "stretching"}]},
             {"timestamp": "2024-01-15T10:31:00Z", "camera": "cam-1", "bounds": [{"label": "stretching"}]}]"#,
    )
    .unwrap();
    let bundle = ReconciliationEngine::default()
        .run(&distinct, &catalog(), &[], None)
        .unwrap();
    assert_eq!(bundle.original_detection_count, bundle.minute_level_detection_count);
}

#[test]
fn result_bundle_serializes_with_camel_case_keys() {
    let records = parse_detection_json(
        br#"[{"timestamp": "2024-01-15T10:30:00Z", "camera": "cam-1", "bounds": [{"label": "stretching"}]}]"#,
    )
    .unwrap();
    let gt = vec![truth(1, "2024-01-15 10:30:00", 2, "cam-1")];
    let bundle = ReconciliationEngine::default()
        .run(&records, &catalog(), &gt, None)
        .unwrap();
    let value = serde_json::to_value(&bundle).unwrap();
    assert_eq!(value["matchedCount"], 1);
    assert_eq!(value["totalGroundTruthRecords"], 1);
    assert_eq!(value["matches"][0]["matchType"], "ACCURATE_DETECTION");
    assert_eq!(value["matches"][0]["groundTruthRecordId"], 1);
    assert!(value["performanceMetrics"]["totalProcessingTimeMs"].is_u64());
    assert!(value.get("metadata").is_none());
}

#[test]
fn progress_reaches_half_way_at_step_two() {
    let store = InMemoryProgressStore::new();
    store.initialize("proc-half").unwrap();
    store.update("proc-half", 2, None).unwrap();
    let snapshot = store.get("proc-half").unwrap().unwrap();
    assert_eq!(snapshot.percentage, 50);
    assert_eq!(snapshot.total_steps, 4);
}

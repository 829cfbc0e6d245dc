use anyhow::Result;
use chrono::NaiveDate;
use serde_json::Value;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use tempfile::tempdir;

use activity_audit::api::{ApiConfig, ApiHandle, ApiServer};
use activity_audit::{AuditService, InMemoryProgressStore, ReconciliationEngine, SqliteAuditStore};

const DETECTIONS: &str = r#"[{"timestamp": "2024-01-15T10:30:12Z", "camera": "cam-1",
  "bounds": [{"label": "person-customer", "confidence": 0.88}]}]"#;

fn read_response(stream: &mut TcpStream) -> Result<(String, Value)> {
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    let mut parts = response.splitn(2, "\r\n\r\n");
    let headers = parts.next().unwrap_or("").to_string();
    let body = parts.next().unwrap_or("");
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(body)?
    };
    Ok((headers, json))
}

struct TestApi {
    _dir: tempfile::TempDir,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new(max_upload_bytes: usize) -> Result<Self> {
        let dir = tempdir()?;
        let db_path = dir.path().join("audit.db");
        let store = SqliteAuditStore::open(&db_path.to_string_lossy())?;
        store.insert_activity(5, "Intake")?;
        let day = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let sm = store.insert_store_monitoring("101", "7", day)?;
        store.insert_monitoring_activity(sm, 5, "2024-01-15 10:30:00", "cam-1", None)?;
        store.insert_monitoring_activity(sm, 5, "2024-01-15 16:45:00", "cam-3", None)?;

        let service = AuditService::new(
            ReconciliationEngine::default(),
            Arc::new(store),
            Arc::new(InMemoryProgressStore::new()),
        );
        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            max_upload_bytes,
            ..ApiConfig::default()
        };
        let api_handle = ApiServer::new(api_config, Arc::new(service)).spawn()?;

        Ok(Self {
            _dir: dir,
            api_handle: Some(api_handle),
        })
    }

    fn handle(&self) -> &ApiHandle {
        self.api_handle
            .as_ref()
            .expect("test API handle should be initialized")
    }

    fn send(&self, request: &str) -> Result<(String, Value)> {
        let mut stream = TcpStream::connect(self.handle().addr)?;
        stream.write_all(request.as_bytes())?;
        read_response(&mut stream)
    }

    fn get(&self, path: &str) -> Result<(String, Value)> {
        self.send(&format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path))
    }

    fn post(&self, path: &str, body: &str) -> Result<(String, Value)> {
        self.send(&format!(
            "POST {} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            path,
            body.len(),
            body
        ))
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            handle.stop().expect("failed to stop API server");
        }
    }
}

#[test]
fn health_and_activities() -> Result<()> {
    let api = TestApi::new(1024 * 1024)?;

    let (headers, body) = api.get("/api/health")?;
    assert!(headers.contains("200 OK"));
    assert_eq!(body["status"], "healthy");
    assert!(body["timestamp"].is_string());

    let (headers, body) = api.get("/api/activities")?;
    assert!(headers.contains("200 OK"));
    assert_eq!(body["count"], 1);
    assert_eq!(body["data"][0]["name"], "Intake");
    Ok(())
}

#[test]
fn activity_lookup_by_id() -> Result<()> {
    let api = TestApi::new(1024 * 1024)?;

    let (headers, body) = api.get("/api/activities/5")?;
    assert!(headers.contains("200 OK"));
    assert_eq!(body["success"], true);
    assert_eq!(body["activity"]["id"], 5);
    assert_eq!(body["activity"]["name"], "Intake");

    let (headers, body) = api.get("/api/activities/42")?;
    assert!(headers.contains("404 Not Found"));
    assert_eq!(body["message"], "Activity with ID 42 not found");

    let (headers, body) = api.get("/api/activities/five")?;
    assert!(headers.contains("400 Bad Request"));
    assert_eq!(body["success"], false);
    Ok(())
}

#[test]
fn compare_then_history() -> Result<()> {
    let api = TestApi::new(1024 * 1024)?;

    let (headers, body) = api.post(
        "/api/monitoring/compare?storeId=101&companyId=7&monitoringDate=2024-01-15&processId=proc-http-1",
        DETECTIONS,
    )?;
    assert!(headers.contains("200 OK"), "{}", headers);
    assert_eq!(body["success"], true);
    assert_eq!(body["processId"], "proc-http-1");
    assert_eq!(body["data"]["matchedCount"], 1);
    assert_eq!(body["data"]["unmatchedCount"], 1);
    assert_eq!(body["data"]["accuracyPercentage"], 50.0);
    assert_eq!(body["data"]["metadata"]["storeId"], "101");

    let (headers, body) = api.get("/api/monitoring/history?storeId=101")?;
    assert!(headers.contains("200 OK"));
    assert_eq!(body["count"], 1);
    assert_eq!(body["data"][0]["totalMatches"], 1);

    let (_, body) = api.get("/api/monitoring/history?storeId=999")?;
    assert_eq!(body["count"], 0);
    Ok(())
}

#[test]
fn compare_without_metadata_is_bad_request() -> Result<()> {
    let api = TestApi::new(1024 * 1024)?;
    let (headers, body) = api.post("/api/monitoring/compare", DETECTIONS)?;
    assert!(headers.contains("400 Bad Request"));
    assert_eq!(body["success"], false);

    let (headers, _) = api.post("/api/monitoring/compare?storeId=101&companyId=7&monitoringDate=2024-01-15", "{}")?;
    assert!(headers.contains("400 Bad Request"));
    Ok(())
}

#[test]
fn oversized_upload_is_rejected_before_reading() -> Result<()> {
    let api = TestApi::new(64)?;
    let (headers, body) = api.send(
        "POST /api/monitoring/compare?storeId=101 HTTP/1.1\r\nHost: localhost\r\nContent-Length: 4096\r\n\r\n",
    )?;
    assert!(headers.contains("413 Payload Too Large"));
    assert_eq!(body["success"], false);
    Ok(())
}

#[test]
fn progress_and_cleanup_routes() -> Result<()> {
    let api = TestApi::new(1024 * 1024)?;

    let (headers, body) = api.get("/api/monitoring/progress/proc-unknown")?;
    assert!(headers.contains("404 Not Found"));
    assert_eq!(body["message"], "Process not found or already completed");

    let (headers, body) = api.get("/api/monitoring/active-processes")?;
    assert!(headers.contains("200 OK"));
    assert!(body["data"].is_array());

    let (headers, body) =
        api.send("DELETE /api/monitoring/cleanup-progress HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    assert!(headers.contains("200 OK"));
    assert_eq!(body["cleanedCount"], 0);

    let (headers, _) = api.get("/api/monitoring/cleanup-progress")?;
    assert!(headers.contains("405 Method Not Allowed"));
    Ok(())
}

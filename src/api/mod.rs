//! HTTP API over a plain `TcpListener`.
//!
//! The accept loop runs on one thread and hands each connection to its own
//! worker so progress polls are answered while a comparison is running.

use anyhow::{anyhow, Result};
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::ingest::is_input_error;
use crate::progress::{validate_process_id, DEFAULT_FINISHED_GRACE, DEFAULT_MAX_AGE};
use crate::service::{AuditService, CompareRequest};

const MAX_HEADER_BYTES: usize = 16 * 1024;
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_HISTORY_LIMIT: usize = 10;
const MAX_HISTORY_LIMIT: usize = 1000;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub max_upload_bytes: usize,
    pub progress_max_age: Duration,
    pub finished_grace: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:3901".to_string(),
            max_upload_bytes: 100 * 1024 * 1024,
            progress_max_age: DEFAULT_MAX_AGE,
            finished_grace: DEFAULT_FINISHED_GRACE,
        }
    }
}

impl From<&crate::config::AuditConfig> for ApiConfig {
    fn from(cfg: &crate::config::AuditConfig) -> Self {
        Self {
            addr: cfg.api.addr.clone(),
            max_upload_bytes: cfg.api.max_upload_bytes,
            progress_max_age: cfg.progress.max_age,
            finished_grace: cfg.progress.finished_grace,
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    service: Arc<AuditService>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, service: Arc<AuditService>) -> Self {
        Self { cfg, service }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cfg = self.cfg.clone();
        let service = self.service.clone();
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, cfg, service, shutdown_thread) {
                log::error!("audit api stopped: {}", err);
            }
        });

        log::info!("audit api listening on {}", addr);
        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    cfg: ApiConfig,
    service: Arc<AuditService>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let cfg = Arc::new(cfg);
    let mut last_sweep = Instant::now();
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        if last_sweep.elapsed() >= SWEEP_INTERVAL {
            sweep_progress(&service, &cfg);
            last_sweep = Instant::now();
        }
        match listener.accept() {
            Ok((stream, _)) => {
                let service = service.clone();
                let cfg = cfg.clone();
                std::thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &service, &cfg) {
                        log::warn!("audit api request rejected: {:#}", err);
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn sweep_progress(service: &AuditService, cfg: &ApiConfig) {
    let progress = service.progress();
    let stale = progress.sweep_older_than(cfg.progress_max_age);
    let finished = progress.sweep_finished(cfg.finished_grace);
    match (stale, finished) {
        (Ok(0), Ok(0)) => {}
        (Ok(stale), Ok(finished)) => {
            log::debug!("progress sweep removed {} stale and {} finished entries", stale, finished)
        }
        (Err(e), _) | (_, Err(e)) => log::warn!("progress sweep failed: {:#}", e),
    }
}

fn handle_connection(mut stream: TcpStream, service: &AuditService, cfg: &ApiConfig) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, &json!({"success": false, "message": "forbidden"}))?;
        return Ok(());
    }

    let request = match read_request(&mut stream, cfg.max_upload_bytes) {
        Ok(ReadOutcome::Request(request)) => request,
        Ok(ReadOutcome::TooLarge { declared }) => {
            let body = json!({
                "success": false,
                "message": format!(
                    "upload of {} bytes exceeds the {} byte limit",
                    declared, cfg.max_upload_bytes
                ),
            });
            write_json_response(&mut stream, 413, &body)?;
            return Ok(());
        }
        Ok(ReadOutcome::LengthRequired) => {
            let body = json!({"success": false, "message": "content-length required"});
            write_json_response(&mut stream, 411, &body)?;
            return Ok(());
        }
        Err(err) => {
            let body = json!({"success": false, "message": "malformed request"});
            let _ = write_json_response(&mut stream, 400, &body);
            return Err(err);
        }
    };

    let (status, body) = route(&request, service, cfg);
    write_json_response(&mut stream, status, &body)
}

// -------------------- Routing --------------------

fn route(request: &HttpRequest, service: &AuditService, cfg: &ApiConfig) -> (u16, Value) {
    let method = request.method.as_str();
    let path = request.path.trim_end_matches('/');

    if let Some(process_id) = path.strip_prefix("/api/monitoring/progress/") {
        return match method {
            "GET" => progress_for(service, process_id),
            _ => method_not_allowed(),
        };
    }

    if let Some(raw_id) = path.strip_prefix("/api/activities/") {
        return match method {
            "GET" => activity_for(service, raw_id),
            _ => method_not_allowed(),
        };
    }

    match (method, path) {
        ("GET", "/api/health") => (
            200,
            json!({
                "status": "healthy",
                "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            }),
        ),
        ("GET", "/api/activities") => match service.store().activity_catalog() {
            Ok(catalog) => (
                200,
                json!({"success": true, "count": catalog.len(), "data": catalog}),
            ),
            Err(e) => internal_error("Failed to load activities", &e),
        },
        ("POST", "/api/monitoring/compare") => compare(request, service),
        ("GET", "/api/monitoring/active-processes") => match service.progress().list_active() {
            Ok(active) => (
                200,
                json!({"success": true, "count": active.len(), "data": active}),
            ),
            Err(e) => internal_error("Failed to get active processes", &e),
        },
        ("GET", "/api/monitoring/history") => history(request, service),
        ("DELETE", "/api/monitoring/cleanup-progress") => {
            match service.progress().sweep_older_than(cfg.progress_max_age) {
                Ok(cleaned) => (
                    200,
                    json!({
                        "success": true,
                        "message": format!("Cleaned up {} old progress tracking entries", cleaned),
                        "cleanedCount": cleaned,
                    }),
                ),
                Err(e) => internal_error("Failed to cleanup progress tracking", &e),
            }
        }
        (
            _,
            "/api/health"
            | "/api/activities"
            | "/api/monitoring/compare"
            | "/api/monitoring/active-processes"
            | "/api/monitoring/history"
            | "/api/monitoring/cleanup-progress",
        ) => method_not_allowed(),
        _ => (404, json!({"success": false, "message": "not found"})),
    }
}

fn compare(request: &HttpRequest, service: &AuditService) -> (u16, Value) {
    let query = request.query();
    let compare_request = CompareRequest {
        store_id: query.get("storeId").cloned(),
        company_id: query.get("companyId").cloned(),
        monitoring_date: query.get("monitoringDate").cloned(),
        process_id: query.get("processId").cloned().filter(|id| !id.is_empty()),
    };
    match service.compare(&request.body, &compare_request) {
        Ok(bundle) => (
            200,
            json!({
                "success": true,
                "message": "Comparison completed successfully",
                "processId": compare_request.process_id,
                "data": bundle,
            }),
        ),
        Err(e) if is_input_error(&e) => (
            400,
            json!({
                "success": false,
                "message": format!("{:#}", e),
                "processId": compare_request.process_id,
            }),
        ),
        Err(e) => {
            log::error!("comparison failed: {:#}", e);
            (
                500,
                json!({
                    "success": false,
                    "message": "Comparison failed",
                    "error": format!("{:#}", e),
                    "processId": compare_request.process_id,
                }),
            )
        }
    }
}

fn activity_for(service: &AuditService, raw_id: &str) -> (u16, Value) {
    let Ok(activity_id) = raw_id.parse::<i64>() else {
        return (
            400,
            json!({"success": false, "message": "Invalid activity ID"}),
        );
    };
    match service.store().activity_by_id(activity_id) {
        Ok(Some(activity)) => (200, json!({"success": true, "activity": activity})),
        Ok(None) => (
            404,
            json!({
                "success": false,
                "message": format!("Activity with ID {} not found", activity_id),
            }),
        ),
        Err(e) => internal_error("Failed to load activity", &e),
    }
}

fn progress_for(service: &AuditService, process_id: &str) -> (u16, Value) {
    if let Err(e) = validate_process_id(process_id) {
        return (400, json!({"success": false, "message": e.to_string()}));
    }
    match service.progress().get(process_id) {
        Ok(Some(snapshot)) => (200, json!({"success": true, "progress": snapshot})),
        Ok(None) => (
            404,
            json!({
                "success": false,
                "message": "Process not found or already completed",
                "processId": process_id,
            }),
        ),
        Err(e) => internal_error("Failed to get progress information", &e),
    }
}

fn history(request: &HttpRequest, service: &AuditService) -> (u16, Value) {
    let query = request.query();
    let limit = match parse_count(query.get("limit"), DEFAULT_HISTORY_LIMIT) {
        Some(limit) => limit.min(MAX_HISTORY_LIMIT),
        None => return (400, json!({"success": false, "message": "limit must be a non-negative integer"})),
    };
    let offset = match parse_count(query.get("offset"), 0) {
        Some(offset) => offset,
        None => return (400, json!({"success": false, "message": "offset must be a non-negative integer"})),
    };
    let store_id = query.get("storeId").map(String::as_str).filter(|s| !s.is_empty());
    match service.store().comparison_history(store_id, limit, offset) {
        Ok(entries) => (
            200,
            json!({"success": true, "count": entries.len(), "data": entries}),
        ),
        Err(e) => internal_error("Failed to fetch comparison history", &e),
    }
}

fn parse_count(raw: Option<&String>, default: usize) -> Option<usize> {
    match raw {
        None => Some(default),
        Some(value) if value.trim().is_empty() => Some(default),
        Some(value) => value.trim().parse().ok(),
    }
}

fn method_not_allowed() -> (u16, Value) {
    (405, json!({"success": false, "message": "method not allowed"}))
}

fn internal_error(message: &str, err: &anyhow::Error) -> (u16, Value) {
    log::error!("{}: {:#}", message, err);
    (500, json!({"success": false, "message": message}))
}

// -------------------- Wire --------------------

enum ReadOutcome {
    Request(HttpRequest),
    TooLarge { declared: usize },
    LengthRequired,
}

fn read_request(stream: &mut TcpStream, max_body: usize) -> Result<ReadOutcome> {
    stream.set_read_timeout(Some(Duration::from_secs(30)))?;
    let mut buf = [0u8; 8192];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of headers"));
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("request headers too large"));
        }
    };

    let head = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length {:?}", value))?,
        None if headers.contains_key("transfer-encoding") => return Ok(ReadOutcome::LengthRequired),
        None => 0,
    };
    if content_length > max_body {
        return Ok(ReadOutcome::TooLarge {
            declared: content_length,
        });
    }
    if headers
        .get("expect")
        .map(|v| v.eq_ignore_ascii_case("100-continue"))
        .unwrap_or(false)
    {
        stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n")?;
    }

    let mut body = data.split_off(header_end);
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!(
                "connection closed after {} of {} body bytes",
                body.len(),
                content_length
            ));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(ReadOutcome::Request(HttpRequest {
        method: method.to_string(),
        path,
        raw_path: raw_path.to_string(),
        body,
    }))
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &Value) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        411 => "HTTP/1.1 411 Length Required",
        413 => "HTTP/1.1 413 Payload Too Large",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    raw_path: String,
    body: Vec<u8>,
}

impl HttpRequest {
    /// Decoded query parameters; the first occurrence of a key wins.
    fn query(&self) -> HashMap<String, String> {
        let mut out = HashMap::new();
        if let Some(query) = self.raw_path.split_once('?').map(|(_, q)| q) {
            for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
                out.entry(k.into_owned()).or_insert_with(|| v.into_owned());
            }
        }
        out
    }
}

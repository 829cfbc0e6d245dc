use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};

use crate::reconcile::ResultBundle;
use crate::{ActivityCatalogEntry, GroundTruthRecord};

pub trait CatalogProvider: Send + Sync {
    fn activity_catalog(&self) -> Result<Vec<ActivityCatalogEntry>>;
    fn activity_by_id(&self, activity_id: i64) -> Result<Option<ActivityCatalogEntry>>;
}

pub trait GroundTruthProvider: Send + Sync {
    /// Monitoring activities recorded for `store_id` on `date`, oldest first.
    /// An empty result is valid.
    fn ground_truth(&self, store_id: &str, date: NaiveDate) -> Result<Vec<GroundTruthRecord>>;
}

/// Everything the comparison service needs from its database.
pub trait AuditStore: CatalogProvider + GroundTruthProvider {
    /// Persists a finished comparison and returns the log id.
    fn log_comparison(&self, bundle: &ResultBundle) -> Result<i64>;

    /// Logged comparisons, newest first.
    fn comparison_history(
        &self,
        store_id: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ComparisonLogEntry>>;
}

/// One row of comparison history. The full result JSON is stored but not
/// returned in listings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonLogEntry {
    pub log_id: i64,
    pub store_id: String,
    pub company_id: String,
    pub analysis_date: String,
    pub overall_accuracy: f64,
    pub total_matches: i64,
    pub total_detections: i64,
    pub total_ground_truth: i64,
    pub processing_time_ms: i64,
    pub created_at: String,
}

impl ComparisonLogEntry {
    fn from_bundle(log_id: i64, bundle: &ResultBundle) -> Self {
        let (store_id, company_id, analysis_date) = match &bundle.metadata {
            Some(meta) => (
                meta.store_id.clone(),
                meta.company_id.clone(),
                meta.monitoring_date.clone(),
            ),
            None => (
                String::new(),
                String::new(),
                bundle.processed_at.date_naive().to_string(),
            ),
        };
        Self {
            log_id,
            store_id,
            company_id,
            analysis_date,
            overall_accuracy: bundle.accuracy_percentage,
            total_matches: bundle.matched_count as i64,
            total_detections: bundle.original_detection_count as i64,
            total_ground_truth: bundle.total_ground_truth_records as i64,
            processing_time_ms: bundle.performance_metrics.total_processing_time_ms as i64,
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

// -------------------- SQLite --------------------

pub struct SqliteAuditStore {
    conn: Mutex<Connection>,
}

impl SqliteAuditStore {
    /// Opens (or creates) the database. `":memory:"` gives a private
    /// in-memory database.
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("opening audit database {}", db_path))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("audit database lock poisoned"))
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS activities (
              activity_id INTEGER PRIMARY KEY,
              activity_name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS store_monitoring (
              store_monitoring_id INTEGER PRIMARY KEY AUTOINCREMENT,
              store_id TEXT NOT NULL,
              company_id TEXT NOT NULL,
              monitoring_date TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS monitoring_activities (
              monitoring_activity_id INTEGER PRIMARY KEY AUTOINCREMENT,
              store_monitoring_id INTEGER NOT NULL REFERENCES store_monitoring(store_monitoring_id),
              activity_id INTEGER NOT NULL REFERENCES activities(activity_id),
              timestamp TEXT NOT NULL,
              camera_no TEXT NOT NULL,
              image_url TEXT
            );

            CREATE TABLE IF NOT EXISTS comparison_logs (
              log_id INTEGER PRIMARY KEY AUTOINCREMENT,
              store_id TEXT NOT NULL,
              company_id TEXT NOT NULL,
              analysis_date TEXT NOT NULL,
              overall_accuracy REAL NOT NULL,
              total_matches INTEGER NOT NULL,
              total_detections INTEGER NOT NULL,
              total_ground_truth INTEGER NOT NULL,
              processing_time_ms INTEGER NOT NULL,
              results_json TEXT NOT NULL,
              created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_store_monitoring_store ON store_monitoring(store_id);
            CREATE INDEX IF NOT EXISTS idx_monitoring_activities_ts
              ON monitoring_activities(store_monitoring_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_comparison_logs_store ON comparison_logs(store_id, log_id);
            "#,
        )?;
        Ok(())
    }

    pub fn insert_activity(&self, activity_id: i64, name: &str) -> Result<()> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO activities(activity_id, activity_name) VALUES (?1, ?2)",
            params![activity_id, name],
        )?;
        Ok(())
    }

    pub fn insert_store_monitoring(
        &self,
        store_id: &str,
        company_id: &str,
        monitoring_date: NaiveDate,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO store_monitoring(store_id, company_id, monitoring_date) VALUES (?1, ?2, ?3)",
            params![store_id, company_id, monitoring_date.to_string()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_monitoring_activity(
        &self,
        store_monitoring_id: i64,
        activity_id: i64,
        timestamp: &str,
        camera: &str,
        image_url: Option<&str>,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO monitoring_activities(store_monitoring_id, activity_id, timestamp, camera_no, image_url)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![store_monitoring_id, activity_id, timestamp, camera, image_url],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Raw result JSON of one logged comparison.
    pub fn comparison_results_json(&self, log_id: i64) -> Result<Option<String>> {
        let conn = self.conn()?;
        let json = conn
            .query_row(
                "SELECT results_json FROM comparison_logs WHERE log_id = ?1",
                params![log_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(json)
    }
}

impl CatalogProvider for SqliteAuditStore {
    fn activity_catalog(&self) -> Result<Vec<ActivityCatalogEntry>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT activity_id, activity_name FROM activities ORDER BY activity_id")?;
        let rows = stmt.query_map([], |row| {
            Ok(ActivityCatalogEntry {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?;
        let catalog = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        log::debug!("loaded {} activities", catalog.len());
        Ok(catalog)
    }

    fn activity_by_id(&self, activity_id: i64) -> Result<Option<ActivityCatalogEntry>> {
        let conn = self.conn()?;
        let entry = conn
            .query_row(
                "SELECT activity_id, activity_name FROM activities WHERE activity_id = ?1",
                params![activity_id],
                |row| {
                    Ok(ActivityCatalogEntry {
                        id: row.get(0)?,
                        name: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }
}

impl GroundTruthProvider for SqliteAuditStore {
    fn ground_truth(&self, store_id: &str, date: NaiveDate) -> Result<Vec<GroundTruthRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT ma.monitoring_activity_id, ma.activity_id, a.activity_name, ma.timestamp, ma.camera_no
            FROM monitoring_activities ma
            JOIN activities a ON ma.activity_id = a.activity_id
            JOIN store_monitoring sm ON ma.store_monitoring_id = sm.store_monitoring_id
            WHERE sm.store_id = ?1 AND substr(ma.timestamp, 1, 10) = ?2
            ORDER BY ma.timestamp, ma.monitoring_activity_id
            "#,
        )?;
        let rows = stmt.query_map(params![store_id, date.to_string()], |row| {
            Ok(GroundTruthRecord {
                record_id: row.get(0)?,
                activity_id: row.get(1)?,
                activity_name: row.get(2)?,
                timestamp: row.get(3)?,
                camera: row.get(4)?,
            })
        })?;
        let records = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        log::debug!(
            "loaded {} monitoring activities for store {} on {}",
            records.len(),
            store_id,
            date
        );
        Ok(records)
    }
}

impl AuditStore for SqliteAuditStore {
    fn log_comparison(&self, bundle: &ResultBundle) -> Result<i64> {
        let entry = ComparisonLogEntry::from_bundle(0, bundle);
        let results_json = serde_json::to_string(bundle)?;
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO comparison_logs(store_id, company_id, analysis_date, overall_accuracy,
              total_matches, total_detections, total_ground_truth, processing_time_ms,
              results_json, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                entry.store_id,
                entry.company_id,
                entry.analysis_date,
                entry.overall_accuracy,
                entry.total_matches,
                entry.total_detections,
                entry.total_ground_truth,
                entry.processing_time_ms,
                results_json,
                entry.created_at
            ],
        )?;
        let log_id = conn.last_insert_rowid();
        log::info!("comparison logged with id {}", log_id);
        Ok(log_id)
    }

    fn comparison_history(
        &self,
        store_id: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ComparisonLogEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT log_id, store_id, company_id, analysis_date, overall_accuracy,
                   total_matches, total_detections, total_ground_truth, processing_time_ms, created_at
            FROM comparison_logs
            WHERE ?1 IS NULL OR store_id = ?1
            ORDER BY created_at DESC, log_id DESC
            LIMIT ?2 OFFSET ?3
            "#,
        )?;
        let rows = stmt.query_map(params![store_id, limit as i64, offset as i64], |row| {
            Ok(ComparisonLogEntry {
                log_id: row.get(0)?,
                store_id: row.get(1)?,
                company_id: row.get(2)?,
                analysis_date: row.get(3)?,
                overall_accuracy: row.get(4)?,
                total_matches: row.get(5)?,
                total_detections: row.get(6)?,
                total_ground_truth: row.get(7)?,
                processing_time_ms: row.get(8)?,
                created_at: row.get(9)?,
            })
        })?;
        let entries = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }
}

// -------------------- In-Memory --------------------

/// Test double with the same semantics as the SQLite store.
#[derive(Default)]
pub struct InMemoryAuditStore {
    catalog: Vec<ActivityCatalogEntry>,
    monitoring: Vec<(String, GroundTruthRecord)>,
    logs: Mutex<Vec<ComparisonLogEntry>>,
}

impl InMemoryAuditStore {
    pub fn new(catalog: Vec<ActivityCatalogEntry>) -> Self {
        Self {
            catalog,
            ..Self::default()
        }
    }

    pub fn add_ground_truth(&mut self, store_id: &str, record: GroundTruthRecord) {
        self.monitoring.push((store_id.to_string(), record));
    }

    fn logs(&self) -> Result<MutexGuard<'_, Vec<ComparisonLogEntry>>> {
        self.logs
            .lock()
            .map_err(|_| anyhow!("comparison log lock poisoned"))
    }
}

impl CatalogProvider for InMemoryAuditStore {
    fn activity_catalog(&self) -> Result<Vec<ActivityCatalogEntry>> {
        let mut catalog = self.catalog.clone();
        catalog.sort_by_key(|a| a.id);
        Ok(catalog)
    }

    fn activity_by_id(&self, activity_id: i64) -> Result<Option<ActivityCatalogEntry>> {
        Ok(self.catalog.iter().find(|a| a.id == activity_id).cloned())
    }
}

impl GroundTruthProvider for InMemoryAuditStore {
    fn ground_truth(&self, store_id: &str, date: NaiveDate) -> Result<Vec<GroundTruthRecord>> {
        let day = date.to_string();
        let mut records: Vec<GroundTruthRecord> = self
            .monitoring
            .iter()
            .filter(|(store, r)| store == store_id && r.timestamp.get(..10) == Some(day.as_str()))
            .map(|(_, r)| r.clone())
            .collect();
        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(records)
    }
}

impl AuditStore for InMemoryAuditStore {
    fn log_comparison(&self, bundle: &ResultBundle) -> Result<i64> {
        let mut logs = self.logs()?;
        let log_id = logs.len() as i64 + 1;
        logs.push(ComparisonLogEntry::from_bundle(log_id, bundle));
        Ok(log_id)
    }

    fn comparison_history(
        &self,
        store_id: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ComparisonLogEntry>> {
        let logs = self.logs()?;
        Ok(logs
            .iter()
            .rev()
            .filter(|e| store_id.map_or(true, |s| e.store_id == s))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
    }

    fn record(id: i64, ts: &str) -> GroundTruthRecord {
        GroundTruthRecord {
            record_id: id,
            activity_id: 5,
            activity_name: "Intake".to_string(),
            timestamp: ts.to_string(),
            camera: "cam-1".to_string(),
        }
    }

    #[test]
    fn in_memory_filters_by_store_and_day() {
        let mut store = InMemoryAuditStore::new(vec![ActivityCatalogEntry::new(5, "Intake")]);
        store.add_ground_truth("s1", record(2, "2024-01-15 11:00:00"));
        store.add_ground_truth("s1", record(1, "2024-01-15 09:00:00"));
        store.add_ground_truth("s1", record(3, "2024-01-16 09:00:00"));
        store.add_ground_truth("s2", record(4, "2024-01-15 09:00:00"));
        let ids: Vec<i64> = store
            .ground_truth("s1", day())
            .unwrap()
            .iter()
            .map(|r| r.record_id)
            .collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(store.activity_by_id(5).unwrap().unwrap().name, "Intake");
        assert!(store.activity_by_id(6).unwrap().is_none());
    }

    #[test]
    fn sqlite_schema_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.db");
        let path = path.to_str().unwrap();
        {
            let store = SqliteAuditStore::open(path).unwrap();
            store.insert_activity(1, "Sales Desk").unwrap();
        }
        let store = SqliteAuditStore::open(path).unwrap();
        assert_eq!(store.activity_catalog().unwrap().len(), 1);
        assert_eq!(
            store.activity_by_id(1).unwrap(),
            Some(ActivityCatalogEntry::new(1, "Sales Desk"))
        );
        assert!(store.activity_by_id(2).unwrap().is_none());
    }
}

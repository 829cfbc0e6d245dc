//! Step-based progress tracking keyed by process id.
//!
//! The computing thread drives one entry forward through a fixed plan while
//! HTTP handlers or a terminal UI poll it. Reads hand out cloned snapshots,
//! never references into the store.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};
use std::time::{Duration, Instant};

use crate::ingest::InputError;

pub const DEFAULT_PLAN: [&str; 4] = [
    "Preparing data structures...",
    "Extracting and indexing activities...",
    "Performing high-speed comparison...",
    "Generating results...",
];

/// Entries started longer ago than this are stale regardless of status.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(30 * 60);

/// How long a finished entry stays readable so pollers can see the outcome.
pub const DEFAULT_FINISHED_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Running,
    Completed,
    Failed,
}

impl ProgressStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ProgressStatus::Running)
    }
}

/// Point-in-time copy of one entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub process_id: String,
    pub percentage: u8,
    pub current_step: String,
    pub step_index: usize,
    pub total_steps: usize,
    pub steps: Vec<String>,
    pub status: ProgressStatus,
    pub start_time: DateTime<Utc>,
    /// Whole seconds since start, rounded.
    pub elapsed_time: u64,
    pub elapsed_ms: u64,
}

pub trait ProgressStore: Send + Sync {
    /// Creates (or resets) the entry at step 0 of the plan.
    fn initialize(&self, process_id: &str) -> Result<ProgressSnapshot>;
    /// Moves the entry to `step`. Unknown ids are ignored.
    fn update(&self, process_id: &str, step: usize, message: Option<&str>) -> Result<()>;
    fn complete(&self, process_id: &str, message: &str) -> Result<()>;
    fn fail(&self, process_id: &str, message: &str) -> Result<()>;
    fn get(&self, process_id: &str) -> Result<Option<ProgressSnapshot>>;
    /// Removes the entry; returns whether one existed.
    fn cleanup(&self, process_id: &str) -> Result<bool>;
    fn list_active(&self) -> Result<Vec<ProgressSnapshot>>;
    /// Removes entries started more than `age` ago, whatever their status.
    fn sweep_older_than(&self, age: Duration) -> Result<usize>;
    /// Removes completed/failed entries that finished more than `grace` ago.
    fn sweep_finished(&self, grace: Duration) -> Result<usize>;
}

#[derive(Clone, Debug)]
struct ProgressEntry {
    process_id: String,
    percentage: u8,
    current_step: String,
    step_index: usize,
    status: ProgressStatus,
    start_time: DateTime<Utc>,
    started: Instant,
    finished: Option<Instant>,
}

pub struct InMemoryProgressStore {
    steps: Vec<String>,
    entries: RwLock<HashMap<String, ProgressEntry>>,
}

impl Default for InMemoryProgressStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryProgressStore {
    pub fn new() -> Self {
        Self {
            steps: DEFAULT_PLAN.iter().map(|s| s.to_string()).collect(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_plan(steps: Vec<String>) -> Result<Self> {
        if steps.is_empty() {
            return Err(anyhow!("progress plan must have at least one step"));
        }
        Ok(Self {
            steps,
            entries: RwLock::new(HashMap::new()),
        })
    }

    pub fn total_steps(&self) -> usize {
        self.steps.len()
    }

    fn percentage_for(&self, step: usize) -> u8 {
        let pct = (step as f64 / self.steps.len() as f64 * 100.0).round();
        pct.min(100.0) as u8
    }

    fn snapshot(&self, entry: &ProgressEntry) -> ProgressSnapshot {
        let elapsed = entry.started.elapsed();
        ProgressSnapshot {
            process_id: entry.process_id.clone(),
            percentage: entry.percentage,
            current_step: entry.current_step.clone(),
            step_index: entry.step_index,
            total_steps: self.steps.len(),
            steps: self.steps.clone(),
            status: entry.status,
            start_time: entry.start_time,
            elapsed_time: (elapsed.as_millis() as f64 / 1000.0).round() as u64,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, ProgressEntry>>> {
        self.entries
            .write()
            .map_err(|_| anyhow!("progress store lock poisoned"))
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, ProgressEntry>>> {
        self.entries
            .read()
            .map_err(|_| anyhow!("progress store lock poisoned"))
    }

    fn finish(&self, process_id: &str, status: ProgressStatus, message: &str) -> Result<()> {
        let mut entries = self.write()?;
        let Some(entry) = entries.get_mut(process_id) else {
            return Ok(());
        };
        if status == ProgressStatus::Completed {
            entry.percentage = 100;
            entry.step_index = self.steps.len();
        }
        entry.status = status;
        entry.current_step = message.to_string();
        entry.finished = Some(Instant::now());
        log::debug!("progress [{}] {:?}: {}", process_id, status, message);
        Ok(())
    }
}

impl ProgressStore for InMemoryProgressStore {
    fn initialize(&self, process_id: &str) -> Result<ProgressSnapshot> {
        let entry = ProgressEntry {
            process_id: process_id.to_string(),
            percentage: 0,
            current_step: self.steps[0].clone(),
            step_index: 0,
            status: ProgressStatus::Running,
            start_time: Utc::now(),
            started: Instant::now(),
            finished: None,
        };
        let snapshot = self.snapshot(&entry);
        self.write()?.insert(process_id.to_string(), entry);
        log::debug!("progress [{}] initialized", process_id);
        Ok(snapshot)
    }

    fn update(&self, process_id: &str, step: usize, message: Option<&str>) -> Result<()> {
        let percentage = self.percentage_for(step);
        let mut entries = self.write()?;
        let Some(entry) = entries.get_mut(process_id) else {
            return Ok(());
        };
        entry.step_index = step;
        entry.percentage = percentage;
        if let Some(label) = message.or_else(|| self.steps.get(step).map(String::as_str)) {
            entry.current_step = label.to_string();
        }
        log::debug!(
            "progress [{}] {}% - {}",
            process_id,
            entry.percentage,
            entry.current_step
        );
        Ok(())
    }

    fn complete(&self, process_id: &str, message: &str) -> Result<()> {
        self.finish(process_id, ProgressStatus::Completed, message)
    }

    fn fail(&self, process_id: &str, message: &str) -> Result<()> {
        self.finish(process_id, ProgressStatus::Failed, message)
    }

    fn get(&self, process_id: &str) -> Result<Option<ProgressSnapshot>> {
        Ok(self.read()?.get(process_id).map(|e| self.snapshot(e)))
    }

    fn cleanup(&self, process_id: &str) -> Result<bool> {
        Ok(self.write()?.remove(process_id).is_some())
    }

    fn list_active(&self) -> Result<Vec<ProgressSnapshot>> {
        let entries = self.read()?;
        let mut out: Vec<ProgressSnapshot> = entries.values().map(|e| self.snapshot(e)).collect();
        out.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        Ok(out)
    }

    fn sweep_older_than(&self, age: Duration) -> Result<usize> {
        let mut entries = self.write()?;
        let before = entries.len();
        entries.retain(|_, e| e.started.elapsed() < age);
        Ok(before - entries.len())
    }

    fn sweep_finished(&self, grace: Duration) -> Result<usize> {
        let mut entries = self.write()?;
        let before = entries.len();
        entries.retain(|_, e| match e.finished {
            Some(at) => at.elapsed() < grace,
            None => true,
        });
        Ok(before - entries.len())
    }
}

/// A fresh random process id, `proc-` followed by 16 hex characters.
pub fn generate_process_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("proc-{}", hex::encode(bytes))
}

pub fn validate_process_id(process_id: &str) -> Result<()> {
    static PROCESS_ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = PROCESS_ID_RE.get_or_init(|| {
        regex::Regex::new(r"^[A-Za-z0-9_.:-]{1,128}$").expect("process id regex must compile")
    });
    if re.is_match(process_id) {
        Ok(())
    } else {
        Err(InputError::new(format!(
            "process id must match [A-Za-z0-9_.:-]{{1,128}}, got {:?}",
            process_id
        ))
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_starts_at_zero() {
        let store = InMemoryProgressStore::new();
        let snap = store.initialize("p1").unwrap();
        assert_eq!(snap.percentage, 0);
        assert_eq!(snap.step_index, 0);
        assert_eq!(snap.total_steps, 4);
        assert_eq!(snap.current_step, "Preparing data structures...");
        assert_eq!(snap.status, ProgressStatus::Running);
    }

    #[test]
    fn update_two_of_four_is_half() {
        let store = InMemoryProgressStore::new();
        store.initialize("p1").unwrap();
        store.update("p1", 2, None).unwrap();
        let snap = store.get("p1").unwrap().unwrap();
        assert_eq!(snap.percentage, 50);
        assert_eq!(snap.current_step, "Performing high-speed comparison...");
    }

    #[test]
    fn custom_message_wins_and_past_plan_keeps_label() {
        let store = InMemoryProgressStore::new();
        store.initialize("p1").unwrap();
        store.update("p1", 1, Some("Extracting from 10 records...")).unwrap();
        assert_eq!(store.get("p1").unwrap().unwrap().current_step, "Extracting from 10 records...");
        store.update("p1", 6, None).unwrap();
        let snap = store.get("p1").unwrap().unwrap();
        assert_eq!(snap.percentage, 100);
        assert_eq!(snap.current_step, "Extracting from 10 records...");
    }

    #[test]
    fn update_unknown_id_is_a_no_op() {
        let store = InMemoryProgressStore::new();
        store.update("ghost", 2, None).unwrap();
        assert!(store.get("ghost").unwrap().is_none());
    }

    #[test]
    fn cleanup_is_idempotent() {
        let store = InMemoryProgressStore::new();
        store.initialize("p1").unwrap();
        assert!(store.cleanup("p1").unwrap());
        assert!(!store.cleanup("p1").unwrap());
        assert!(store.get("p1").unwrap().is_none());
    }

    #[test]
    fn terminal_transitions() {
        let store = InMemoryProgressStore::new();
        store.initialize("ok").unwrap();
        store.initialize("bad").unwrap();
        store.complete("ok", "done").unwrap();
        store.fail("bad", "boom").unwrap();
        let ok = store.get("ok").unwrap().unwrap();
        assert_eq!(ok.status, ProgressStatus::Completed);
        assert_eq!(ok.percentage, 100);
        let bad = store.get("bad").unwrap().unwrap();
        assert_eq!(bad.status, ProgressStatus::Failed);
        assert_eq!(bad.current_step, "boom");
    }

    #[test]
    fn sweeps() {
        let store = InMemoryProgressStore::new();
        store.initialize("a").unwrap();
        store.initialize("b").unwrap();
        store.complete("b", "done").unwrap();

        assert_eq!(store.sweep_older_than(DEFAULT_MAX_AGE).unwrap(), 0);
        assert_eq!(store.sweep_finished(Duration::from_secs(3600)).unwrap(), 0);
        assert_eq!(store.sweep_finished(Duration::ZERO).unwrap(), 1);
        assert_eq!(store.list_active().unwrap().len(), 1);
        assert_eq!(store.sweep_older_than(Duration::ZERO).unwrap(), 1);
        assert!(store.list_active().unwrap().is_empty());
    }

    #[test]
    fn custom_plan() {
        assert!(InMemoryProgressStore::with_plan(Vec::new()).is_err());
        let store = InMemoryProgressStore::with_plan(vec!["one".into(), "two".into(), "three".into()]).unwrap();
        store.initialize("p").unwrap();
        store.update("p", 1, None).unwrap();
        assert_eq!(store.get("p").unwrap().unwrap().percentage, 33);
    }

    #[test]
    fn process_ids() {
        let id = generate_process_id();
        assert!(id.starts_with("proc-"));
        assert_eq!(id.len(), 21);
        assert!(validate_process_id(&id).is_ok());
        assert!(validate_process_id("job:2024-01-15.store_7").is_ok());
        assert!(validate_process_id("").is_err());
        assert!(validate_process_id("../etc").is_err());
        assert!(validate_process_id(&"x".repeat(129)).is_err());
    }
}

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::mapping::LabelMapper;
use crate::matcher::MatchPolicy;
use crate::progress::{DEFAULT_FINISHED_GRACE, DEFAULT_MAX_AGE};
use crate::reconcile::ReconciliationEngine;

const DEFAULT_DB_PATH: &str = "activity_audit.db";
const DEFAULT_API_ADDR: &str = "127.0.0.1:3901";
const DEFAULT_MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;

#[derive(Debug, Deserialize, Default)]
struct AuditConfigFile {
    db_path: Option<String>,
    api: Option<ApiConfigFile>,
    progress: Option<ProgressConfigFile>,
    report: Option<ReportConfigFile>,
    labels: Option<BTreeMap<String, Vec<i64>>>,
    match_policy: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    max_upload_bytes: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct ProgressConfigFile {
    max_age_secs: Option<u64>,
    finished_grace_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ReportConfigFile {
    dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub db_path: String,
    pub api: ApiSettings,
    pub progress: ProgressSettings,
    pub report_dir: Option<PathBuf>,
    /// Extra or replacement label mappings on top of the built-in table.
    pub labels: BTreeMap<String, Vec<i64>>,
    pub match_policy: MatchPolicy,
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub addr: String,
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct ProgressSettings {
    pub max_age: Duration,
    pub finished_grace: Duration,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            db_path: DEFAULT_DB_PATH.to_string(),
            api: ApiSettings {
                addr: DEFAULT_API_ADDR.to_string(),
                max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            },
            progress: ProgressSettings {
                max_age: DEFAULT_MAX_AGE,
                finished_grace: DEFAULT_FINISHED_GRACE,
            },
            report_dir: None,
            labels: BTreeMap::new(),
            match_policy: MatchPolicy::default(),
        }
    }
}

impl AuditConfig {
    /// File named by `AUDIT_CONFIG` (if any), then `AUDIT_*` overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("AUDIT_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: AuditConfigFile) -> Result<Self> {
        let defaults = Self::default();
        let match_policy = match file.match_policy.as_deref() {
            Some(raw) => raw.parse()?,
            None => defaults.match_policy,
        };
        let api = ApiSettings {
            addr: file
                .api
                .as_ref()
                .and_then(|api| api.addr.clone())
                .unwrap_or(defaults.api.addr),
            max_upload_bytes: file
                .api
                .as_ref()
                .and_then(|api| api.max_upload_bytes)
                .unwrap_or(defaults.api.max_upload_bytes),
        };
        let progress = ProgressSettings {
            max_age: file
                .progress
                .as_ref()
                .and_then(|p| p.max_age_secs)
                .map(Duration::from_secs)
                .unwrap_or(defaults.progress.max_age),
            finished_grace: file
                .progress
                .as_ref()
                .and_then(|p| p.finished_grace_secs)
                .map(Duration::from_secs)
                .unwrap_or(defaults.progress.finished_grace),
        };
        Ok(Self {
            db_path: file.db_path.unwrap_or(defaults.db_path),
            api,
            progress,
            report_dir: file.report.and_then(|r| r.dir),
            labels: file.labels.unwrap_or_default(),
            match_policy,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("AUDIT_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(addr) = std::env::var("AUDIT_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api.addr = addr;
            }
        }
        if let Ok(limit) = std::env::var("AUDIT_MAX_UPLOAD_BYTES") {
            self.api.max_upload_bytes = limit
                .trim()
                .parse()
                .map_err(|_| anyhow!("AUDIT_MAX_UPLOAD_BYTES must be an integer number of bytes"))?;
        }
        if let Ok(age) = std::env::var("AUDIT_PROGRESS_MAX_AGE_SECS") {
            let seconds: u64 = age.trim().parse().map_err(|_| {
                anyhow!("AUDIT_PROGRESS_MAX_AGE_SECS must be an integer number of seconds")
            })?;
            self.progress.max_age = Duration::from_secs(seconds);
        }
        if let Ok(dir) = std::env::var("AUDIT_REPORT_DIR") {
            if !dir.trim().is_empty() {
                self.report_dir = Some(PathBuf::from(dir));
            }
        }
        if let Ok(policy) = std::env::var("AUDIT_MATCH_POLICY") {
            if !policy.trim().is_empty() {
                self.match_policy = policy.parse()?;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.api.max_upload_bytes == 0 {
            return Err(anyhow!("max upload size must be greater than zero"));
        }
        if self.progress.max_age.as_secs() == 0 {
            return Err(anyhow!("progress max age must be greater than zero"));
        }
        for (label, ids) in &self.labels {
            if label.trim().is_empty() {
                return Err(anyhow!("label overrides must not use an empty label"));
            }
            if ids.is_empty() {
                return Err(anyhow!("label override {:?} maps to no activity ids", label));
            }
        }
        Ok(())
    }

    pub fn label_mapper(&self) -> LabelMapper {
        LabelMapper::with_overrides(self.labels.clone())
    }

    pub fn engine(&self) -> ReconciliationEngine {
        ReconciliationEngine::new(self.label_mapper(), self.match_policy)
    }
}

fn read_config_file(path: &Path) -> Result<AuditConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

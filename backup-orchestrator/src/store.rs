//! Durable backup records on the target roots.
//!
//! Layout under each target root:
//!
//! ```text
//! <root>/<backup_id>/manifest.json
//! <root>/<backup_id>/job.log
//! <root>/<backup_id>/data/<component>/...
//! <root>/<backup_id>/record.json      written only when the backup succeeded
//! <root>/restores/<job_id>/manifest.json
//! <root>/restores/<job_id>/job.log
//! ```
//!
//! A backup exists for listing, restore and deletion purposes if and only if
//! its `record.json` is present. Aborted and failed runs keep their manifest
//! and log for post-mortem but never show up as records.

use crate::executor::manifest::Manifest;
use crate::job::{JobId, Target};
use crate::utils::errors::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const RECORD_FILE: &str = "record.json";
pub const LOG_FILE: &str = "job.log";
pub const DATA_DIR: &str = "data";
pub const RESTORES_DIR: &str = "restores";

/// Listable representation of a completed backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub job_id: JobId,
    pub target: Target,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub manifest: Manifest,
}

/// Aggregate numbers for the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupStats {
    pub total_count: usize,
    pub last_backup: Option<DateTime<Utc>>,
    pub total_size_bytes: u64,
    pub total_size: String,
}

impl BackupStats {
    pub fn from_records(records: &[BackupRecord]) -> Self {
        let total_size_bytes: u64 = records.iter().map(|r| r.size_bytes).sum();
        Self {
            total_count: records.len(),
            last_backup: records.iter().map(|r| r.created_at).max(),
            total_size_bytes,
            total_size: format_gib(total_size_bytes),
        }
    }
}

fn format_gib(bytes: u64) -> String {
    if bytes == 0 {
        "0 GB".to_string()
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Backup id: UTC timestamp plus the first 8 characters of the job id.
pub fn backup_id(job_id: &str, at: DateTime<Utc>) -> String {
    let short: String = job_id.chars().filter(|c| *c != '-').take(8).collect();
    format!("{}-{}", at.format("%Y%m%dT%H%M%SZ"), short)
}

/// Ids come from callers; refuse anything that could escape a target root.
fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id != RESTORES_DIR
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[derive(Debug, Clone)]
pub struct BackupStore {
    roots: BTreeMap<Target, PathBuf>,
}

impl BackupStore {
    pub fn new(roots: BTreeMap<Target, PathBuf>) -> Self {
        Self { roots }
    }

    pub fn root(&self, target: Target) -> Result<&Path> {
        self.roots
            .get(&target)
            .map(PathBuf::as_path)
            .ok_or_else(|| {
                OrchestratorError::Config(format!("no root configured for target {target}"))
            })
    }

    pub fn backup_dir(&self, target: Target, backup_id: &str) -> Result<PathBuf> {
        Ok(self.root(target)?.join(backup_id))
    }

    pub fn restore_dir(&self, target: Target, job_id: &str) -> Result<PathBuf> {
        Ok(self.root(target)?.join(RESTORES_DIR).join(job_id))
    }

    /// Write `record.json` for a finished backup (temp file + rename).
    pub async fn publish(&self, dir: &Path, record: &BackupRecord) -> Result<()> {
        let tmp = dir.join(format!("{RECORD_FILE}.tmp"));
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(record)?).await?;
        tokio::fs::rename(&tmp, dir.join(RECORD_FILE)).await?;
        tracing::info!(
            backup_id = %record.id,
            target = %record.target,
            size_bytes = record.size_bytes,
            "Backup record published"
        );
        Ok(())
    }

    /// Records across all targets (or one), newest first.
    pub async fn list(&self, target: Option<Target>) -> Result<Vec<BackupRecord>> {
        let roots: Vec<(Target, PathBuf)> = self
            .roots
            .iter()
            .filter(|(t, _)| target.map_or(true, |wanted| wanted == **t))
            .map(|(t, p)| (*t, p.clone()))
            .collect();

        let mut records = tokio::task::spawn_blocking(move || {
            roots
                .iter()
                .flat_map(|(t, root)| scan_root(*t, root))
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| OrchestratorError::Io(std::io::Error::other(e)))?;

        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(records)
    }

    /// Locate a record and its directory by id.
    pub async fn find(&self, id: &str) -> Result<Option<(PathBuf, BackupRecord)>> {
        if !is_valid_id(id) {
            return Ok(None);
        }
        for root in self.roots.values() {
            let dir = root.join(id);
            match tokio::fs::read(dir.join(RECORD_FILE)).await {
                Ok(bytes) => match serde_json::from_slice::<BackupRecord>(&bytes) {
                    Ok(record) => return Ok(Some((dir, record))),
                    Err(e) => {
                        tracing::warn!(path = %dir.display(), "Unreadable backup record: {}", e);
                    }
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// Unpublish a backup by removing its `record.json`. The directory stays
    /// on disk for [`BackupStore::purge`]. The caller checks that no restore
    /// uses it.
    pub async fn retire(&self, id: &str) -> Result<(PathBuf, BackupRecord)> {
        let (dir, record) = self
            .find(id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("backup {id}")))?;

        // Without the record the tree is never listed or restored from.
        tokio::fs::remove_file(dir.join(RECORD_FILE)).await?;
        tracing::info!(backup_id = %id, path = %dir.display(), "Backup retired");
        Ok((dir, record))
    }

    /// Remove a retired backup directory.
    pub async fn purge(&self, dir: &Path) -> Result<()> {
        tokio::fs::remove_dir_all(dir).await?;
        tracing::info!(path = %dir.display(), "Backup deleted");
        Ok(())
    }

    pub async fn stats(&self) -> Result<BackupStats> {
        Ok(BackupStats::from_records(&self.list(None).await?))
    }
}

fn scan_root(target: Target, root: &Path) -> Vec<BackupRecord> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(root = %root.display(), "Failed to scan target root: {}", e);
            }
            return Vec::new();
        }
    };

    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name() != RESTORES_DIR)
        .filter_map(|entry| {
            let path = entry.path().join(RECORD_FILE);
            let bytes = std::fs::read(&path).ok()?;
            match serde_json::from_slice::<BackupRecord>(&bytes) {
                Ok(record) if record.target == target => Some(record),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        "Skipping unreadable backup record: {}",
                        e
                    );
                    None
                }
            }
        })
        .collect()
}

/// Total size of regular files below `dir`.
pub async fn dir_size(dir: &Path) -> u64 {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || {
        WalkDir::new(&dir)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum()
    })
    .await
    .unwrap_or(0)
}

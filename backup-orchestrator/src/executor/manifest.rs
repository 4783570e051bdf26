//! Job manifests.
//!
//! A manifest records what a job intends to transfer: the target, the
//! selected components and the source path each component resolved to. It is
//! written once, right before the engine is launched, as `manifest.json` in
//! the job's artifact directory so a later restore can discover what a backup
//! contains without replaying the original request.

use crate::job::{JobId, JobKind, Target};
use crate::utils::errors::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub job_id: JobId,
    pub kind: JobKind,
    pub target: Target,
    /// Backup written by this job, or the backup a restore reads from.
    pub backup_id: String,
    pub components: Vec<String>,
    pub generated_at: DateTime<Utc>,
    pub source_paths: BTreeMap<String, PathBuf>,
}

/// A manifest that has been persisted.
#[derive(Debug, Clone)]
pub struct ManifestHandle {
    pub path: PathBuf,
}

/// Resolves component names and persists manifests.
#[derive(Debug, Clone)]
pub struct ManifestWriter {
    components: BTreeMap<String, PathBuf>,
}

impl ManifestWriter {
    pub fn new(components: BTreeMap<String, PathBuf>) -> Self {
        Self { components }
    }

    pub fn known_components(&self) -> impl Iterator<Item = &str> {
        self.components.keys().map(String::as_str)
    }

    /// Map each requested name to its source path. Fails on the first name
    /// without a mapping.
    pub fn resolve(&self, names: &[String]) -> Result<BTreeMap<String, PathBuf>> {
        names
            .iter()
            .map(|name| {
                self.components
                    .get(name)
                    .map(|path| (name.clone(), path.clone()))
                    .ok_or_else(|| OrchestratorError::UnknownComponent(name.clone()))
            })
            .collect()
    }

    /// Write `manifest` into `dir`, creating the directory if needed.
    /// The file is written to a temporary name and renamed into place.
    pub async fn write(&self, dir: &Path, manifest: Manifest) -> Result<ManifestHandle> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(MANIFEST_FILE);
        let tmp = dir.join(format!("{MANIFEST_FILE}.tmp"));

        let json = serde_json::to_vec_pretty(&manifest)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;

        tracing::debug!(job_id = %manifest.job_id, path = %path.display(), "Manifest written");
        Ok(ManifestHandle { path })
    }
}

/// Read a manifest back from an artifact directory.
pub async fn read(dir: &Path) -> Result<Manifest> {
    let bytes = tokio::fs::read(dir.join(MANIFEST_FILE)).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer() -> ManifestWriter {
        let mut map = BTreeMap::new();
        map.insert("config".to_string(), PathBuf::from("/opt/nvr/config"));
        map.insert("data".to_string(), PathBuf::from("/opt/nvr/data"));
        ManifestWriter::new(map)
    }

    #[test]
    fn test_resolve_known_components() {
        let resolved = writer()
            .resolve(&["data".to_string(), "config".to_string()])
            .unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved["config"], PathBuf::from("/opt/nvr/config"));
    }

    #[test]
    fn test_resolve_unknown_component() {
        let err = writer()
            .resolve(&["config".to_string(), "photos".to_string()])
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownComponent(name) if name == "photos"));
    }

    #[tokio::test]
    async fn test_write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer();
        let components = vec!["config".to_string()];
        let manifest = Manifest {
            version: MANIFEST_VERSION,
            job_id: "job-1".into(),
            kind: JobKind::Backup,
            target: Target::Usb,
            backup_id: "20260101T000000Z-job1job1".into(),
            source_paths: writer.resolve(&components).unwrap(),
            components,
            generated_at: Utc::now(),
        };

        let artifact_dir = dir.path().join("20260101T000000Z-job1job1");
        let handle = writer.write(&artifact_dir, manifest.clone()).await.unwrap();
        assert_eq!(handle.path, artifact_dir.join(MANIFEST_FILE));
        assert!(!artifact_dir.join("manifest.json.tmp").exists());

        let loaded = read(&artifact_dir).await.unwrap();
        assert_eq!(loaded, manifest);
    }
}

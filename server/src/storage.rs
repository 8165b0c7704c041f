use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::error::{ServiceError, ServiceResult};

#[derive(Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    copy_permits: Arc<Semaphore>,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>, copy_workers: usize) -> Self {
        Self { root: root.into(), copy_permits: Arc::new(Semaphore::new(copy_workers.max(1))) }
    }

    pub fn endpoint_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn path_for(&self, name: &str, version: u64) -> PathBuf {
        self.endpoint_dir(name).join(version.to_string())
    }

    /// Populate the directory for `name`/`version` from `src`, then check
    /// that every required file is present. A failed check removes the
    /// half-written version directory.
    pub async fn stage(&self, name: &str, version: u64, src: &Path, required_files: &[String]) -> ServiceResult<PathBuf> {
        if !src.is_dir() {
            return Err(ServiceError::BadRequest(format!("source path {} is not a directory", src.display())));
        }
        let dest = self.path_for(name, version);
        let _permit = self.copy_permits.acquire().await.map_err(|e| ServiceError::Internal(e.to_string()))?;
        let (from, to) = (src.to_path_buf(), dest.clone());
        let copied = tokio::task::spawn_blocking(move || -> Result<u64> {
            if to.exists() {
                std::fs::remove_dir_all(&to).with_context(|| format!("clearing {}", to.display()))?;
            }
            copy_dir(&from, &to)
        })
        .await
        .map_err(|e| ServiceError::Internal(format!("copy task failed: {}", e)))?
        .map_err(|e| ServiceError::Internal(format!("{:#}", e)))?;

        let missing: Vec<&String> = required_files.iter().filter(|f| !dest.join(f.as_str()).is_file()).collect();
        if !missing.is_empty() {
            let _ = std::fs::remove_dir_all(&dest);
            return Err(ServiceError::BadRequest(format!("missing required files for {}: {}", name, missing.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", "))));
        }
        info!(%name, version, bytes = copied, dest = %dest.display(), "artifacts staged");
        Ok(dest)
    }

    /// Remove every version of `name`. Absent directories are not an error.
    pub async fn remove_endpoint(&self, name: &str) -> Result<bool> {
        let dir = self.endpoint_dir(name);
        tokio::task::spawn_blocking(move || -> Result<bool> {
            if !dir.exists() {
                return Ok(false);
            }
            std::fs::remove_dir_all(&dir).with_context(|| format!("removing {}", dir.display()))?;
            Ok(true)
        })
        .await?
    }

    /// Keep `current` and `current - 1`, drop every older version directory.
    pub async fn cleanup_old_versions(&self, name: &str, current: u64) -> Result<Vec<u64>> {
        let dir = self.endpoint_dir(name);
        let keep_from = current.saturating_sub(1);
        let removed = tokio::task::spawn_blocking(move || -> Result<Vec<u64>> {
            let mut removed = Vec::new();
            let entries = match std::fs::read_dir(&dir) {
                Ok(e) => e,
                Err(_) => return Ok(removed),
            };
            for entry in entries {
                let entry = entry?;
                let Some(version) = entry.file_name().to_str().and_then(|s| s.parse::<u64>().ok()) else { continue };
                if version < keep_from && entry.path().is_dir() {
                    match std::fs::remove_dir_all(entry.path()) {
                        Ok(()) => removed.push(version),
                        Err(err) => warn!(path = %entry.path().display(), %err, "failed to remove old version"),
                    }
                }
            }
            removed.sort_unstable();
            Ok(removed)
        })
        .await??;
        if !removed.is_empty() {
            debug!(%name, current, removed = ?removed, "old versions cleaned up");
        }
        Ok(removed)
    }
}

fn copy_dir(src: &Path, dst: &Path) -> Result<u64> {
    std::fs::create_dir_all(dst).with_context(|| format!("creating {}", dst.display()))?;
    let mut total = 0;
    for entry in std::fs::read_dir(src).with_context(|| format!("reading {}", src.display()))? {
        let entry = entry?;
        let p = entry.path();
        let target = dst.join(entry.file_name());
        if p.is_dir() {
            total += copy_dir(&p, &target)?;
        } else {
            total += std::fs::copy(&p, &target).with_context(|| format!("copying {}", p.display()))?;
        }
    }
    Ok(total)
}

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::endpoint::{EndpointRecord, EndpointType};
use crate::error::ServiceResult;
use crate::loader::{LoadSource, LoadStatus, LoaderResponse, ObjectLoader};
use crate::state_file::StateFile;
use crate::storage::ArtifactStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingLoad {
    pub name: String,
    pub endpoint_type: EndpointType,
    pub version: u64,
    pub source: LoadSource,
    pub is_update: bool,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct StateDiff {
    pub changed: Vec<PendingLoad>,
    pub removed: Vec<String>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ReconcileReport {
    pub revision: u64,
    pub loaded: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: BTreeMap<String, String>,
    /// Loads still in progress when the wait ran out.
    pub timed_out: Vec<String>,
    pub removed: Vec<String>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.loaded.is_empty() && self.skipped.is_empty() && self.failed.is_empty() && self.timed_out.is_empty() && self.removed.is_empty()
    }
}

/// Names that are new or carry a different version than the table, and
/// names the table holds that the records no longer do.
pub fn diff(records: &BTreeMap<String, EndpointRecord>, loaded: &BTreeMap<String, u64>, artifacts: &ArtifactStore) -> StateDiff {
    let mut out = StateDiff::default();
    for (name, rec) in records {
        let current = loaded.get(name);
        if current == Some(&rec.version) {
            continue;
        }
        let source = match rec.target() {
            Some(target) => LoadSource::Target(target.to_string()),
            None => LoadSource::Path(artifacts.path_for(name, rec.version)),
        };
        out.changed.push(PendingLoad { name: name.clone(), endpoint_type: rec.endpoint_type(), version: rec.version, source, is_update: current.is_some() });
    }
    out.removed = loaded.keys().filter(|name| !records.contains_key(*name)).cloned().collect();
    out
}

pub struct Reconciler {
    state_path: PathBuf,
    loader: ObjectLoader,
    artifacts: ArtifactStore,
    load_timeout: Duration,
    poll_interval: Duration,
    /// Revision of the last completed pass; also serializes passes.
    last_revision: Mutex<Option<u64>>,
}

impl Reconciler {
    pub fn new(state_path: impl Into<PathBuf>, loader: ObjectLoader, artifacts: ArtifactStore, load_timeout: Duration, poll_interval: Duration) -> Self {
        Self { state_path: state_path.into(), loader, artifacts, load_timeout, poll_interval, last_revision: Mutex::new(None) }
    }

    /// Re-read the state file and issue loads and deletes for whatever
    /// changed since the last pass.
    pub async fn reconcile(&self) -> ServiceResult<ReconcileReport> {
        let mut last = self.last_revision.lock().await;
        let state = StateFile::load_async(self.state_path.clone()).await?;
        let mut report = ReconcileReport { revision: state.revision, ..ReconcileReport::default() };
        if *last == Some(state.revision) {
            debug!(revision = state.revision, "state unchanged, nothing to reconcile");
            return Ok(report);
        }

        let plan = diff(&state.endpoints, &self.loader.table().versions(), &self.artifacts);
        for pending in plan.changed {
            self.apply_load(pending, &mut report).await;
        }
        for name in plan.removed {
            self.loader.delete_objects(vec![name.clone()]).await;
            match self.artifacts.remove_endpoint(&name).await {
                Ok(true) => debug!(%name, "artifacts removed"),
                Ok(false) => {}
                Err(err) => warn!(%name, error = %format!("{:#}", err), "failed to remove artifacts"),
            }
            report.removed.push(name);
        }

        // A skipped load may be an older version still in flight; leave the
        // revision unmarked so the next pass retries it.
        if report.skipped.is_empty() {
            *last = Some(state.revision);
        }
        if !report.is_noop() {
            info!(revision = report.revision, loaded = ?report.loaded, failed = ?report.failed.keys().collect::<Vec<_>>(), timed_out = ?report.timed_out, removed = ?report.removed, "reconciled");
        }
        Ok(report)
    }

    async fn apply_load(&self, pending: PendingLoad, report: &mut ReconcileReport) {
        let PendingLoad { name, endpoint_type, version, source, is_update } = pending;
        let mut response = self.loader.load_object(&name, source.clone(), version, is_update, endpoint_type).await;
        if response == LoaderResponse::DownloadSkipped {
            // An earlier load of this name is still running. Let it finish,
            // then queue this version behind it.
            if self.wait_for_load(&name).await != Some(LoadStatus::LoadInProgress) {
                debug!(%name, version, "retrying load after in-flight load settled");
                response = self.loader.load_object(&name, source, version, is_update, endpoint_type).await;
            }
        }
        match response {
            LoaderResponse::DownloadSkipped => {
                report.skipped.push(name);
                return;
            }
            LoaderResponse::LoadFailed(reason) => {
                report.failed.insert(name, reason);
                return;
            }
            _ => {}
        }
        match self.wait_for_load(&name).await {
            Some(LoadStatus::LoadSuccessful) => {
                if endpoint_type == EndpointType::Model && version > 2 {
                    if let Err(err) = self.artifacts.cleanup_old_versions(&name, version).await {
                        warn!(%name, error = %format!("{:#}", err), "old version cleanup failed");
                    }
                }
                report.loaded.push(name);
            }
            Some(LoadStatus::LoadFailed) => {
                let reason = self.loader.table().get(&name).and_then(|e| e.last_error).unwrap_or_else(|| "load failed".to_string());
                report.failed.insert(name, reason);
            }
            Some(LoadStatus::LoadInProgress) => {
                warn!(%name, version, timeout_ms = self.load_timeout.as_millis() as u64, "load timed out");
                report.timed_out.push(name);
            }
            None => {
                report.failed.insert(name, "object removed while loading".to_string());
            }
        }
    }

    /// Poll until the entry leaves `LoadInProgress` or the timeout passes.
    async fn wait_for_load(&self, name: &str) -> Option<LoadStatus> {
        let deadline = Instant::now() + self.load_timeout;
        loop {
            let status = self.loader.table().status(name);
            if status != Some(LoadStatus::LoadInProgress) || Instant::now() >= deadline {
                return status;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

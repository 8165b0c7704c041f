//! Object table and the background loader that owns its transitions.
//!
//! Every request goes through [`ObjectLoader::manage_request`]. Loads are
//! acknowledged on the caller's task and materialized on a single worker
//! task, so the request path never waits for a model to be read. Deletes and
//! flushes are queued behind pending loads to keep per-name ordering.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::endpoint::EndpointType;
use crate::materializer::{Materializer, QueryObject};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoadStatus {
    LoadInProgress,
    LoadSuccessful,
    LoadFailed,
}

/// The materialized form of an endpoint.
#[derive(Clone)]
pub enum LoadedObject {
    Model(Arc<dyn QueryObject>),
    /// Alias entries hold the name they point at.
    Alias(String),
}

impl std::fmt::Debug for LoadedObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadedObject::Model(_) => f.write_str("Model(..)"),
            LoadedObject::Alias(target) => f.debug_tuple("Alias").field(target).finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ObjectEntry {
    pub version: u64,
    pub endpoint_type: EndpointType,
    pub object: Option<LoadedObject>,
    pub status: LoadStatus,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectSummary {
    pub version: u64,
    #[serde(rename = "type")]
    pub endpoint_type: EndpointType,
    pub status: LoadStatus,
    pub last_error: Option<String>,
}

/// Runtime state per endpoint name. Readable from anywhere; written only by
/// the loader in this module.
#[derive(Default)]
pub struct ObjectTable {
    entries: RwLock<HashMap<String, ObjectEntry>>,
}

impl ObjectTable {
    pub fn get(&self, name: &str) -> Option<ObjectEntry> {
        self.read().get(name).cloned()
    }

    pub fn status(&self, name: &str) -> Option<LoadStatus> {
        self.read().get(name).map(|e| e.status)
    }

    pub fn versions(&self) -> BTreeMap<String, u64> {
        self.read().iter().map(|(k, e)| (k.clone(), e.version)).collect()
    }

    fn summaries(&self) -> BTreeMap<String, ObjectSummary> {
        self.read()
            .iter()
            .map(|(k, e)| (k.clone(), ObjectSummary { version: e.version, endpoint_type: e.endpoint_type, status: e.status, last_error: e.last_error.clone() }))
            .collect()
    }

    fn loaded_count(&self) -> usize {
        self.read().values().filter(|e| e.object.is_some()).count()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, ObjectEntry>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, ObjectEntry>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Where a load reads from: a version directory for models, the target name
/// for aliases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadSource {
    Path(PathBuf),
    Target(String),
}

#[derive(Debug)]
pub enum LoaderRequest {
    LoadObject { name: String, source: LoadSource, version: u64, is_update: bool, endpoint_type: EndpointType },
    DeleteObjects { names: Vec<String> },
    FlushObjects,
    CountObjects,
    ListObjects,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoaderResponse {
    LoadInProgress,
    DownloadSkipped,
    LoadFailed(String),
    ObjectsDeleted(Vec<String>),
    ObjectsFlushed(usize),
    ObjectCount(usize),
    ObjectList(BTreeMap<String, ObjectSummary>),
}

enum Job {
    Materialize { name: String, source: LoadSource, version: u64, endpoint_type: EndpointType },
    Delete { names: Vec<String>, reply: oneshot::Sender<Vec<String>> },
    Flush { reply: oneshot::Sender<usize> },
}

#[derive(Clone)]
pub struct ObjectLoader {
    table: Arc<ObjectTable>,
    jobs: mpsc::UnboundedSender<Job>,
}

impl ObjectLoader {
    /// Start the worker task. Must be called inside a tokio runtime.
    pub fn spawn(materializer: Arc<dyn Materializer>) -> Self {
        let table = Arc::new(ObjectTable::default());
        let (jobs, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(table.clone(), materializer, rx));
        Self { table, jobs }
    }

    pub fn table(&self) -> &Arc<ObjectTable> {
        &self.table
    }

    pub async fn manage_request(&self, request: LoaderRequest) -> LoaderResponse {
        match request {
            LoaderRequest::LoadObject { name, source, version, is_update, endpoint_type } => self.begin_load(name, source, version, is_update, endpoint_type),
            LoaderRequest::DeleteObjects { names } => {
                let (reply, rx) = oneshot::channel();
                if self.jobs.send(Job::Delete { names, reply }).is_err() {
                    warn!("loader worker is gone, delete dropped");
                    return LoaderResponse::ObjectsDeleted(Vec::new());
                }
                LoaderResponse::ObjectsDeleted(rx.await.unwrap_or_default())
            }
            LoaderRequest::FlushObjects => {
                let (reply, rx) = oneshot::channel();
                if self.jobs.send(Job::Flush { reply }).is_err() {
                    warn!("loader worker is gone, flush dropped");
                    return LoaderResponse::ObjectsFlushed(0);
                }
                LoaderResponse::ObjectsFlushed(rx.await.unwrap_or_default())
            }
            LoaderRequest::CountObjects => LoaderResponse::ObjectCount(self.table.loaded_count()),
            LoaderRequest::ListObjects => LoaderResponse::ObjectList(self.table.summaries()),
        }
    }

    pub async fn load_object(&self, name: &str, source: LoadSource, version: u64, is_update: bool, endpoint_type: EndpointType) -> LoaderResponse {
        self.manage_request(LoaderRequest::LoadObject { name: name.to_string(), source, version, is_update, endpoint_type }).await
    }

    pub async fn delete_objects(&self, names: Vec<String>) -> Vec<String> {
        match self.manage_request(LoaderRequest::DeleteObjects { names }).await {
            LoaderResponse::ObjectsDeleted(removed) => removed,
            _ => Vec::new(),
        }
    }

    pub async fn flush_objects(&self) -> usize {
        match self.manage_request(LoaderRequest::FlushObjects).await {
            LoaderResponse::ObjectsFlushed(n) => n,
            _ => 0,
        }
    }

    pub async fn count_objects(&self) -> usize {
        match self.manage_request(LoaderRequest::CountObjects).await {
            LoaderResponse::ObjectCount(n) => n,
            _ => 0,
        }
    }

    pub async fn list_objects(&self) -> BTreeMap<String, ObjectSummary> {
        match self.manage_request(LoaderRequest::ListObjects).await {
            LoaderResponse::ObjectList(list) => list,
            _ => BTreeMap::new(),
        }
    }

    /// Check-and-claim under the table lock, then queue the work.
    fn begin_load(&self, name: String, source: LoadSource, version: u64, is_update: bool, endpoint_type: EndpointType) -> LoaderResponse {
        if version == 0 {
            let reason = format!("invalid version 0 for {}", name);
            warn!(%name, "rejecting load: {}", reason);
            return LoaderResponse::LoadFailed(reason);
        }
        let source_ok = matches!((&source, endpoint_type), (LoadSource::Path(_), EndpointType::Model) | (LoadSource::Target(_), EndpointType::Alias));
        if !source_ok {
            let reason = format!("{} load for {} given mismatched source {:?}", endpoint_type, name, source);
            warn!(%name, "rejecting load: {}", reason);
            return LoaderResponse::LoadFailed(reason);
        }
        {
            let mut entries = self.table.write();
            if let Some(existing) = entries.get(&name) {
                let skip = match existing.status {
                    LoadStatus::LoadInProgress => true,
                    LoadStatus::LoadSuccessful => version <= existing.version,
                    LoadStatus::LoadFailed => false,
                };
                if skip {
                    debug!(%name, version, current = existing.version, status = ?existing.status, "load skipped");
                    return LoaderResponse::DownloadSkipped;
                }
            }
            entries.insert(name.clone(), ObjectEntry { version, endpoint_type, object: None, status: LoadStatus::LoadInProgress, last_error: None });
        }
        info!(%name, version, is_update, kind = %endpoint_type, "load queued");
        if self.jobs.send(Job::Materialize { name: name.clone(), source, version, endpoint_type }).is_err() {
            let reason = "loader worker is not running".to_string();
            self.table.write().insert(name, ObjectEntry { version, endpoint_type, object: None, status: LoadStatus::LoadFailed, last_error: Some(reason.clone()) });
            return LoaderResponse::LoadFailed(reason);
        }
        LoaderResponse::LoadInProgress
    }
}

async fn run_worker(table: Arc<ObjectTable>, materializer: Arc<dyn Materializer>, mut rx: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = rx.recv().await {
        match job {
            Job::Materialize { name, source, version, endpoint_type } => {
                let outcome = materialize(&materializer, &name, source).await;
                finish_load(&table, &name, version, endpoint_type, outcome);
            }
            Job::Delete { names, reply } => {
                let mut removed = Vec::new();
                {
                    let mut entries = table.write();
                    for name in names {
                        if entries.remove(&name).is_some() {
                            removed.push(name);
                        } else {
                            debug!(%name, "delete of unknown object ignored");
                        }
                    }
                }
                if !removed.is_empty() {
                    info!(removed = ?removed, "objects deleted");
                }
                let _ = reply.send(removed);
            }
            Job::Flush { reply } => {
                let n = {
                    let mut entries = table.write();
                    let n = entries.len();
                    entries.clear();
                    n
                };
                info!(count = n, "object table flushed");
                let _ = reply.send(n);
            }
        }
    }
    debug!("loader worker stopped");
}

async fn materialize(materializer: &Arc<dyn Materializer>, name: &str, source: LoadSource) -> Result<LoadedObject, String> {
    match source {
        LoadSource::Target(target) => Ok(LoadedObject::Alias(target)),
        LoadSource::Path(path) => {
            let materializer = materializer.clone();
            let owned = name.to_string();
            let res = tokio::task::spawn_blocking(move || materializer.materialize(&owned, &path)).await;
            match res {
                Ok(Ok(object)) => Ok(LoadedObject::Model(object)),
                Ok(Err(err)) => Err(format!("{:#}", err)),
                Err(join) => Err(format!("materializer panicked: {}", join)),
            }
        }
    }
}

fn finish_load(table: &ObjectTable, name: &str, version: u64, endpoint_type: EndpointType, outcome: Result<LoadedObject, String>) {
    let mut entries = table.write();
    // A delete or flush may have run while this load was in flight.
    let claimed = entries.get(name).map(|e| e.status == LoadStatus::LoadInProgress && e.version == version).unwrap_or(false);
    if !claimed {
        debug!(%name, version, "discarding stale load result");
        return;
    }
    let entry = match outcome {
        Ok(object) => {
            info!(%name, version, "load successful");
            ObjectEntry { version, endpoint_type, object: Some(object), status: LoadStatus::LoadSuccessful, last_error: None }
        }
        Err(err) => {
            warn!(%name, version, error = %err, "load failed");
            ObjectEntry { version, endpoint_type, object: None, status: LoadStatus::LoadFailed, last_error: Some(err) }
        }
    };
    entries.insert(name.to_string(), entry);
}

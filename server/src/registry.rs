//! Endpoint registry: the only writer of the state file.
//!
//! Each mutation holds the registry lock across read, validate and persist,
//! and applies its change to a copy that replaces the in-memory state only
//! after the file write succeeded.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::info;

use crate::endpoint::{now_secs, validate_name, EndpointKind, EndpointRecord, EndpointSpec, EndpointType};
use crate::error::{ServiceError, ServiceResult};
use crate::resolver::{dependents_of, would_cycle};
use crate::state_file::{ServiceInfo, StateFile};

pub struct EndpointRegistry {
    path: PathBuf,
    state: Mutex<StateFile>,
}

impl EndpointRegistry {
    /// Load the state file at `path`, creating it with `defaults` when it
    /// does not exist yet.
    pub fn open(path: impl Into<PathBuf>, defaults: ServiceInfo) -> ServiceResult<Self> {
        let path = path.into();
        let state = if path.exists() {
            StateFile::load(&path)?
        } else {
            let fresh = StateFile::new(defaults);
            fresh.save(&path)?;
            info!(path = %path.display(), "created new state file");
            fresh
        };
        Ok(Self { path, state: Mutex::new(state) })
    }

    pub fn state_path(&self) -> &Path {
        &self.path
    }

    pub async fn service_info(&self) -> ServiceInfo {
        self.state.lock().await.service.clone()
    }

    pub async fn revision(&self) -> u64 {
        self.state.lock().await.revision
    }

    /// All records, or just `name`. Only a specific missing name is an error.
    pub async fn get_endpoints(&self, name: Option<&str>) -> ServiceResult<BTreeMap<String, EndpointRecord>> {
        let state = self.state.lock().await;
        match name {
            None => Ok(state.endpoints.clone()),
            Some(name) => {
                let record = state.endpoints.get(name).ok_or_else(|| ServiceError::NotFound(name.to_string()))?;
                Ok(BTreeMap::from([(name.to_string(), record.clone())]))
            }
        }
    }

    pub async fn get_endpoint(&self, name: &str) -> ServiceResult<EndpointRecord> {
        let state = self.state.lock().await;
        state.endpoints.get(name).cloned().ok_or_else(|| ServiceError::NotFound(name.to_string()))
    }

    pub async fn add_endpoint(&self, name: &str, spec: EndpointSpec) -> ServiceResult<EndpointRecord> {
        validate_name(name)?;
        let mut state = self.state.lock().await;
        if state.endpoints.contains_key(name) {
            return Err(ServiceError::DuplicateName(name.to_string()));
        }
        let kind = build_kind(name, &spec, None, &state.endpoints)?;
        let now = now_secs();
        let record = EndpointRecord {
            dependencies: kind.dependencies(),
            kind,
            version: 1,
            description: spec.description.unwrap_or_default(),
            docstring: spec.doc.unwrap_or_default(),
            schema: spec.schema,
            creation_time: now,
            last_modified_time: now,
            is_public: spec.is_public.unwrap_or(false),
        };
        let mut next = state.clone();
        next.endpoints.insert(name.to_string(), record.clone());
        next.revision += 1;
        *state = next.save_async(self.path.clone()).await?;
        info!(%name, kind = %record.endpoint_type(), revision = state.revision, "endpoint added");
        Ok(record)
    }

    /// Merge `spec` over the current record. The stored version is always the
    /// current one plus one; a supplied version below the current one is stale.
    pub async fn update_endpoint(&self, name: &str, spec: EndpointSpec) -> ServiceResult<EndpointRecord> {
        let mut state = self.state.lock().await;
        let prev = state.endpoints.get(name).cloned().ok_or_else(|| ServiceError::NotFound(name.to_string()))?;
        let version = prev.version + 1;
        if let Some(supplied) = spec.version {
            if supplied < prev.version {
                return Err(ServiceError::VersionConflict { name: name.to_string(), supplied, current: prev.version });
            }
        }
        let kind = build_kind(name, &spec, Some(&prev.kind), &state.endpoints)?;
        let record = EndpointRecord {
            dependencies: kind.dependencies(),
            kind,
            version,
            description: spec.description.unwrap_or(prev.description),
            docstring: spec.doc.unwrap_or(prev.docstring),
            schema: spec.schema.or(prev.schema),
            creation_time: prev.creation_time,
            last_modified_time: now_secs(),
            is_public: spec.is_public.unwrap_or(prev.is_public),
        };
        let mut next = state.clone();
        next.endpoints.insert(name.to_string(), record.clone());
        next.revision += 1;
        *state = next.save_async(self.path.clone()).await?;
        info!(%name, version, revision = state.revision, "endpoint updated");
        Ok(record)
    }

    /// Remove `name` unless another record depends on it; returns the
    /// removed record.
    pub async fn delete_endpoint(&self, name: &str) -> ServiceResult<EndpointRecord> {
        let mut state = self.state.lock().await;
        if !state.endpoints.contains_key(name) {
            return Err(ServiceError::NotFound(name.to_string()));
        }
        let dependents = dependents_of(name, &state.endpoints);
        if !dependents.is_empty() {
            return Err(ServiceError::DependencyConflict { name: name.to_string(), dependents });
        }
        let mut next = state.clone();
        let removed = next.endpoints.remove(name).ok_or_else(|| ServiceError::NotFound(name.to_string()))?;
        next.revision += 1;
        *state = next.save_async(self.path.clone()).await?;
        info!(%name, revision = state.revision, "endpoint deleted");
        Ok(removed)
    }

    /// Docstring-only bookkeeping; persisted without a revision bump.
    pub async fn set_docstring(&self, name: &str, docstring: &str) -> ServiceResult<()> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let record = next.endpoints.get_mut(name).ok_or_else(|| ServiceError::NotFound(name.to_string()))?;
        record.docstring = docstring.to_string();
        *state = next.save_async(self.path.clone()).await?;
        Ok(())
    }
}

/// Work out the endpoint kind from the request and, on update, the previous
/// kind. Alias targets must exist and must not lead back to `name`.
fn build_kind(name: &str, spec: &EndpointSpec, prev: Option<&EndpointKind>, records: &BTreeMap<String, EndpointRecord>) -> ServiceResult<EndpointKind> {
    let endpoint_type = spec
        .endpoint_type
        .or_else(|| prev.map(|k| k.endpoint_type()))
        .unwrap_or(if spec.target.is_some() { EndpointType::Alias } else { EndpointType::Model });
    match endpoint_type {
        EndpointType::Alias => {
            let target = spec
                .target
                .clone()
                .or_else(|| prev.and_then(|k| k.target().map(str::to_string)))
                .filter(|t| !t.is_empty())
                .ok_or_else(|| ServiceError::InvalidTarget(format!("alias {} needs a target", name)))?;
            if !records.contains_key(&target) {
                return Err(ServiceError::InvalidTarget(format!("target endpoint {} does not exist", target)));
            }
            if would_cycle(name, &target, records) {
                return Err(ServiceError::InvalidTarget(format!("pointing {} at {} creates a cycle", name, target)));
            }
            Ok(EndpointKind::Alias { target })
        }
        EndpointType::Model => {
            if spec.target.is_some() {
                return Err(ServiceError::InvalidTarget(format!("model {} cannot have a target", name)));
            }
            let (prev_src, prev_files) = match prev {
                Some(EndpointKind::Model { src_path, required_files }) => (src_path.clone(), required_files.clone()),
                _ => (None, Vec::new()),
            };
            Ok(EndpointKind::Model { src_path: spec.src_path.clone().or(prev_src), required_files: spec.required_files.clone().unwrap_or(prev_files) })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn open_registry(dir: &tempfile::TempDir) -> EndpointRegistry {
        EndpointRegistry::open(dir.path().join("state.ini"), ServiceInfo::new("test", "")).unwrap()
    }

    fn model() -> EndpointSpec {
        EndpointSpec { description: Some("a model".into()), ..EndpointSpec::default() }
    }

    fn alias(target: &str) -> EndpointSpec {
        EndpointSpec { endpoint_type: Some(EndpointType::Alias), target: Some(target.into()), ..EndpointSpec::default() }
    }

    #[tokio::test]
    async fn add_then_update_bumps_version_and_keeps_creation_time() {
        let dir = tempfile::tempdir().unwrap();
        let reg = open_registry(&dir);
        let added = reg.add_endpoint("ttest", model()).await.unwrap();
        assert_eq!(reg.get_endpoints(Some("ttest")).await.unwrap()["ttest"].version, 1);

        // Timestamps are whole seconds.
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let updated = reg.update_endpoint("ttest", EndpointSpec { doc: Some("new doc".into()), ..EndpointSpec::default() }).await.unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.creation_time, added.creation_time);
        assert!(updated.last_modified_time > added.last_modified_time);
        assert_eq!(updated.description, "a model");
        assert_eq!(updated.docstring, "new doc");
        assert_eq!(reg.revision().await, 2);
    }

    #[tokio::test]
    async fn duplicate_and_invalid_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let reg = open_registry(&dir);
        reg.add_endpoint("ttest", model()).await.unwrap();
        assert!(matches!(reg.add_endpoint("ttest", model()).await, Err(ServiceError::DuplicateName(_))));
        assert!(matches!(reg.add_endpoint("", model()).await, Err(ServiceError::InvalidName(_))));
        assert!(matches!(reg.add_endpoint("bad/name", model()).await, Err(ServiceError::InvalidName(_))));
        assert_eq!(reg.revision().await, 1);
    }

    #[tokio::test]
    async fn alias_needs_existing_target() {
        let dir = tempfile::tempdir().unwrap();
        let reg = open_registry(&dir);
        assert!(matches!(reg.add_endpoint("t", alias("ttest")).await, Err(ServiceError::InvalidTarget(_))));
        let no_target = EndpointSpec { endpoint_type: Some(EndpointType::Alias), ..EndpointSpec::default() };
        assert!(matches!(reg.add_endpoint("t", no_target).await, Err(ServiceError::InvalidTarget(_))));
        reg.add_endpoint("ttest", model()).await.unwrap();
        let rec = reg.add_endpoint("t", alias("ttest")).await.unwrap();
        assert_eq!(rec.target(), Some("ttest"));
        assert!(rec.dependencies.contains("ttest"));
    }

    #[tokio::test]
    async fn target_without_type_means_alias() {
        let dir = tempfile::tempdir().unwrap();
        let reg = open_registry(&dir);
        reg.add_endpoint("m", model()).await.unwrap();
        let rec = reg.add_endpoint("a", EndpointSpec { target: Some("m".into()), ..EndpointSpec::default() }).await.unwrap();
        assert_eq!(rec.endpoint_type(), EndpointType::Alias);
    }

    #[tokio::test]
    async fn delete_blocked_by_dependents() {
        let dir = tempfile::tempdir().unwrap();
        let reg = open_registry(&dir);
        reg.add_endpoint("ttest", model()).await.unwrap();
        reg.add_endpoint("t", alias("ttest")).await.unwrap();
        match reg.delete_endpoint("ttest").await {
            Err(ServiceError::DependencyConflict { dependents, .. }) => assert_eq!(dependents, vec!["t"]),
            other => panic!("unexpected {other:?}"),
        }
        let removed = reg.delete_endpoint("t").await.unwrap();
        assert_eq!(removed.target(), Some("ttest"));
        reg.delete_endpoint("ttest").await.unwrap();
        assert!(reg.get_endpoints(None).await.unwrap().is_empty());
        assert!(matches!(reg.delete_endpoint("ttest").await, Err(ServiceError::NotFound(_))));
    }

    #[tokio::test]
    async fn update_cannot_create_alias_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let reg = open_registry(&dir);
        reg.add_endpoint("m", model()).await.unwrap();
        reg.add_endpoint("a", alias("m")).await.unwrap();
        reg.add_endpoint("b", alias("a")).await.unwrap();
        assert!(matches!(reg.update_endpoint("a", alias("b")).await, Err(ServiceError::InvalidTarget(_))));
        assert!(matches!(reg.update_endpoint("a", alias("a")).await, Err(ServiceError::InvalidTarget(_))));
    }

    #[tokio::test]
    async fn stale_version_is_a_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let reg = open_registry(&dir);
        reg.add_endpoint("m", model()).await.unwrap();
        let same = reg.update_endpoint("m", EndpointSpec { version: Some(1), ..EndpointSpec::default() }).await.unwrap();
        assert_eq!(same.version, 2);
        let ahead = reg.update_endpoint("m", EndpointSpec { version: Some(9), ..EndpointSpec::default() }).await.unwrap();
        assert_eq!(ahead.version, 3);
        let stale = reg.update_endpoint("m", EndpointSpec { version: Some(2), ..EndpointSpec::default() }).await;
        assert!(matches!(stale, Err(ServiceError::VersionConflict { supplied: 2, current: 3, .. })));
        assert_eq!(reg.get_endpoint("m").await.unwrap().version, 3);
        assert!(matches!(reg.update_endpoint("missing", model()).await, Err(ServiceError::NotFound(_))));
    }

    #[tokio::test]
    async fn get_without_name_returns_empty_map() {
        let dir = tempfile::tempdir().unwrap();
        let reg = open_registry(&dir);
        assert!(reg.get_endpoints(None).await.unwrap().is_empty());
        assert!(matches!(reg.get_endpoints(Some("x")).await, Err(ServiceError::NotFound(_))));
    }

    #[tokio::test]
    async fn mutations_persist_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let reg = open_registry(&dir);
            reg.add_endpoint("m", EndpointSpec { doc: Some("line one\nline two".into()), ..model() }).await.unwrap();
            reg.add_endpoint("a", alias("m")).await.unwrap();
        }
        let reg = open_registry(&dir);
        let all = reg.get_endpoints(None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["m"].docstring, "line one\nline two");
        assert_eq!(reg.revision().await, 2);
    }

    #[tokio::test]
    async fn docstring_bookkeeping_keeps_revision() {
        let dir = tempfile::tempdir().unwrap();
        let reg = open_registry(&dir);
        reg.add_endpoint("m", model()).await.unwrap();
        reg.set_docstring("m", "documented").await.unwrap();
        assert_eq!(reg.revision().await, 1);
        assert_eq!(StateFile::load(reg.state_path()).unwrap().endpoints["m"].docstring, "documented");
    }

    #[tokio::test]
    async fn concurrent_updates_do_not_lose_versions() {
        let dir = tempfile::tempdir().unwrap();
        let reg = Arc::new(open_registry(&dir));
        reg.add_endpoint("X", model()).await.unwrap();
        let mut tasks = Vec::new();
        for i in 0..10 {
            let reg = reg.clone();
            tasks.push(tokio::spawn(async move { reg.update_endpoint("X", EndpointSpec { description: Some(format!("u{i}")), ..EndpointSpec::default() }).await.unwrap().version }));
        }
        let mut versions = Vec::new();
        for t in tasks {
            versions.push(t.await.unwrap());
        }
        versions.sort_unstable();
        assert_eq!(versions, (2..=11).collect::<Vec<u64>>());
        assert_eq!(reg.get_endpoint("X").await.unwrap().version, 11);
    }

    #[tokio::test]
    async fn failed_write_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let reg = open_registry(&dir);
        reg.add_endpoint("m", model()).await.unwrap();
        std::fs::create_dir(dir.path().join("state.ini.tmp")).unwrap();
        assert!(matches!(reg.add_endpoint("n", model()).await, Err(ServiceError::WriteError(_))));
        assert!(matches!(reg.get_endpoint("n").await, Err(ServiceError::NotFound(_))));
        assert_eq!(reg.revision().await, 1);
    }
}

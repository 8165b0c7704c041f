use std::time::Instant;

use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::{ServiceError, ServiceResult};
use crate::evaluator::EvalError;
use crate::loader::{LoadedObject, ObjectTable};
use crate::materializer::QueryArgs;
use crate::resolver::resolve;

#[derive(Debug, Clone, Serialize)]
pub struct QuerySuccess {
    pub model: String,
    pub version: u64,
    pub response: JsonValue,
    pub uuid: String,
}

pub async fn query(table: &ObjectTable, name: &str, params: JsonValue, request_id: &str) -> ServiceResult<QuerySuccess> {
    let args = QueryArgs::from_json(params).ok_or_else(|| ServiceError::QueryFailed("query parameters must be an object or an array".to_string()))?;
    let resolution = resolve(table, name)?;
    let object = match resolution.entry.object {
        Some(LoadedObject::Model(object)) => object,
        _ => {
            let reason = resolution.entry.last_error.map(|e| format!(" (last error: {})", e)).unwrap_or_default();
            return Err(ServiceError::UnknownUri(format!("{} is not loaded, status {:?}{}", resolution.terminal, resolution.entry.status, reason)));
        }
    };

    let started = Instant::now();
    match object.query(args).await {
        Ok(response) => {
            info!(%name, model = %resolution.terminal, via = ?resolution.chain, version = resolution.entry.version, request_id, took_ms = started.elapsed().as_millis() as u64, "query served");
            Ok(QuerySuccess { model: resolution.terminal, version: resolution.entry.version, response, uuid: request_id.to_string() })
        }
        Err(err) => {
            warn!(%name, model = %resolution.terminal, request_id, error = %err, "query failed");
            Err(eval_failure(err))
        }
    }
}

/// Timeouts keep their own kind; everything else is a query failure with a
/// `Kind : message` summary.
pub fn eval_failure(err: EvalError) -> ServiceError {
    match err {
        EvalError::Timeout(d) => ServiceError::Timeout(d.as_secs_f64()),
        EvalError::Runtime { .. } => ServiceError::QueryFailed(err.to_string()),
        EvalError::Spawn(_) => ServiceError::QueryFailed(format!("EvaluatorError : {}", err)),
    }
}

/// Hex SHA-256 of the serialized response, used as the `ETag`.
pub fn content_fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointType;
    use crate::loader::tests::{wait_settled, CountingMaterializer};
    use crate::loader::{LoadSource, ObjectLoader};
    use crate::materializer::{Materializer, QueryObject};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    struct FailingObject(EvalError);

    #[async_trait]
    impl QueryObject for FailingObject {
        async fn query(&self, _args: QueryArgs) -> Result<JsonValue, EvalError> {
            Err(match &self.0 {
                EvalError::Timeout(d) => EvalError::Timeout(*d),
                EvalError::Runtime { kind, message } => EvalError::Runtime { kind: kind.clone(), message: message.clone() },
                EvalError::Spawn(s) => EvalError::Spawn(s.clone()),
            })
        }
    }

    struct SumObject;

    #[async_trait]
    impl QueryObject for SumObject {
        async fn query(&self, args: QueryArgs) -> Result<JsonValue, EvalError> {
            let values: Vec<JsonValue> = match args {
                QueryArgs::Named(map) => map.into_iter().map(|(_, v)| v).collect(),
                QueryArgs::Positional(v) => v,
            };
            Ok(serde_json::json!(values.iter().filter_map(|v| v.as_i64()).sum::<i64>()))
        }
    }

    /// Picks the object by the last path component.
    struct PickMaterializer;

    impl Materializer for PickMaterializer {
        fn materialize(&self, _name: &str, path: &Path) -> anyhow::Result<Arc<dyn QueryObject>> {
            match path.file_name().and_then(|n| n.to_str()) {
                Some("sum") => Ok(Arc::new(SumObject)),
                Some("boom") => Ok(Arc::new(FailingObject(EvalError::Runtime { kind: "ValueError".into(), message: "boom".into() }))),
                Some("slow") => Ok(Arc::new(FailingObject(EvalError::Timeout(Duration::from_secs(30))))),
                _ => anyhow::bail!("no such model at {}", path.display()),
            }
        }
    }

    async fn loader_with(models: &[(&str, &str)]) -> ObjectLoader {
        let loader = ObjectLoader::spawn(Arc::new(PickMaterializer));
        for (name, kind) in models {
            loader.load_object(name, LoadSource::Path(format!("/m/{kind}").into()), 1, false, EndpointType::Model).await;
            wait_settled(&loader, name).await;
        }
        loader
    }

    #[tokio::test]
    async fn dispatches_named_and_positional_params() {
        let loader = loader_with(&[("add", "sum")]).await;
        let out = query(loader.table(), "add", serde_json::json!({"a": 1, "b": 2}), "r1").await.unwrap();
        assert_eq!(out.response, 3);
        assert_eq!(out.version, 1);
        let out = query(loader.table(), "add", serde_json::json!([4, 5, 6]), "r2").await.unwrap();
        assert_eq!(out.response, 15);
        assert_eq!(out.uuid, "r2");
    }

    #[tokio::test]
    async fn query_through_alias_reports_model() {
        let loader = loader_with(&[("add", "sum")]).await;
        loader.load_object("plus", LoadSource::Target("add".into()), 1, false, EndpointType::Alias).await;
        wait_settled(&loader, "plus").await;
        let out = query(loader.table(), "plus", serde_json::json!([1, 1]), "r").await.unwrap();
        assert_eq!(out.model, "add");
    }

    #[tokio::test]
    async fn unknown_name_is_unknown_uri() {
        let loader = loader_with(&[]).await;
        assert!(matches!(query(loader.table(), "unknown_name", serde_json::json!({}), "r").await, Err(ServiceError::UnknownUri(_))));
    }

    #[tokio::test]
    async fn scalar_params_are_rejected() {
        let loader = loader_with(&[("add", "sum")]).await;
        assert!(matches!(query(loader.table(), "add", serde_json::json!(5), "r").await, Err(ServiceError::QueryFailed(_))));
    }

    #[tokio::test]
    async fn invocation_errors_become_query_failed() {
        let loader = loader_with(&[("bad", "boom"), ("slow", "slow")]).await;
        match query(loader.table(), "bad", serde_json::json!({}), "r").await {
            Err(ServiceError::QueryFailed(msg)) => assert_eq!(msg, "ValueError : boom"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(query(loader.table(), "slow", serde_json::json!({}), "r").await, Err(ServiceError::Timeout(_))));
    }

    #[tokio::test]
    async fn failed_load_is_unknown_uri_not_a_crash() {
        let loader = ObjectLoader::spawn(Arc::new(CountingMaterializer::default()));
        loader.load_object("m", LoadSource::Path("/bad/path".into()), 1, false, EndpointType::Model).await;
        wait_settled(&loader, "m").await;
        match query(loader.table(), "m", serde_json::json!({}), "r").await {
            Err(ServiceError::UnknownUri(msg)) => assert!(msg.contains("LoadFailed")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let a = content_fingerprint(br#"{"response":3}"#);
        assert_eq!(a, content_fingerprint(br#"{"response":3}"#));
        assert_ne!(a, content_fingerprint(br#"{"response":4}"#));
        assert_eq!(a.len(), 64);
    }
}

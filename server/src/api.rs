use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tokio::sync::Mutex;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::dispatcher::{self, content_fingerprint, eval_failure};
use crate::endpoint::{validate_name, EndpointKind, EndpointRecord, EndpointSpec, EndpointType};
use crate::error::{json_error, ServiceError, ServiceResult};
use crate::evaluator::{positional_arguments, Evaluator, ProcessEvaluator};
use crate::loader::ObjectLoader;
use crate::materializer::{FileMaterializer, Materializer};
use crate::reconciler::{ReconcileReport, Reconciler};
use crate::registry::EndpointRegistry;
use crate::state_file::ServiceInfo;
use crate::storage::ArtifactStore;

const REQUEST_ID_HEADER: &str = "x-request-id";

pub struct AppState {
    pub start_time: Instant,
    pub config: Config,
    pub registry: EndpointRegistry,
    pub loader: ObjectLoader,
    pub reconciler: Reconciler,
    pub artifacts: ArtifactStore,
    pub evaluator: Arc<dyn Evaluator>,
    // Serializes stage + registry write + reconcile for HTTP mutations.
    mutation_guard: Mutex<()>,
}

impl AppState {
    /// Production wiring: subprocess evaluator and `endpoint.json` models.
    pub fn initialize(config: Config) -> anyhow::Result<Arc<Self>> {
        let evaluator: Arc<dyn Evaluator> = Arc::new(ProcessEvaluator::new(config.evaluator_cmd.clone(), config.query_timeout));
        let materializer = Arc::new(FileMaterializer::new(evaluator.clone()));
        Self::with_parts(config, evaluator, materializer)
    }

    pub fn with_parts(config: Config, evaluator: Arc<dyn Evaluator>, materializer: Arc<dyn Materializer>) -> anyhow::Result<Arc<Self>> {
        let objects_dir = config.query_objects_dir();
        std::fs::create_dir_all(&objects_dir).with_context(|| format!("creating {}", objects_dir.display()))?;
        let mut defaults = ServiceInfo::new(config.service_name.clone(), config.service_description.clone());
        defaults.cors_origin = config.cors_origin.clone();
        let registry = EndpointRegistry::open(config.state_file(), defaults)?;
        let loader = ObjectLoader::spawn(materializer);
        let artifacts = ArtifactStore::new(objects_dir, config.copy_workers);
        let reconciler = Reconciler::new(config.state_file(), loader.clone(), artifacts.clone(), config.load_timeout, config.load_poll_interval);
        Ok(Arc::new(Self {
            start_time: Instant::now(),
            config,
            registry,
            loader,
            reconciler,
            artifacts,
            evaluator,
            mutation_guard: Mutex::new(()),
        }))
    }

    /// Reconcile after a committed mutation. The change is already on disk,
    /// so a failure here is logged and reported as a missing report.
    async fn reconcile_after_mutation(&self) -> Option<ReconcileReport> {
        match self.reconciler.reconcile().await {
            Ok(report) => Some(report),
            Err(err) => {
                warn!(error = %err, "reconcile after mutation failed");
                None
            }
        }
    }
}

pub async fn build_router(state: Arc<AppState>) -> Router {
    let service = state.registry.service_info().await;
    let router = Router::new()
        .route("/health", get(health))
        .route("/info", get(service_info))
        .route("/status", get(status))
        .route("/endpoints", get(list_endpoints).post(add_endpoint))
        .route("/endpoints/:name", get(get_endpoint).put(update_endpoint).delete(delete_endpoint))
        .route("/query/:name", get(query_endpoint).post(query_endpoint))
        .route("/evaluate", post(evaluate))
        .layer(TraceLayer::new_for_http())
        .with_state(state);
    match cors_layer(&service) {
        Some(cors) => router.layer(cors),
        None => router,
    }
}

/// CORS from the `Service Info` keys; no origin configured means no layer.
fn cors_layer(service: &ServiceInfo) -> Option<CorsLayer> {
    let origin = service.cors_origin.as_deref().map(str::trim).filter(|o| !o.is_empty())?;
    let allow_origin = if origin == "*" {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(origin.split(',').filter_map(|o| HeaderValue::from_str(o.trim()).ok()))
    };
    let allow_methods = match service.cors_methods.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
        Some(methods) => AllowMethods::list(methods.split(',').filter_map(|m| m.trim().parse::<Method>().ok())),
        None => AllowMethods::list([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS]),
    };
    let allow_headers = match service.cors_headers.as_deref().map(str::trim).filter(|h| !h.is_empty()) {
        Some(headers) => AllowHeaders::list(headers.split(',').filter_map(|h| h.trim().parse::<HeaderName>().ok())),
        None => AllowHeaders::any(),
    };
    Some(CorsLayer::new().allow_origin(allow_origin).allow_methods(allow_methods).allow_headers(allow_headers))
}

/// An empty body reads as `{}` so GET requests without one still parse.
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> ServiceResult<T> {
    let raw: &[u8] = if body.iter().all(|b| b.is_ascii_whitespace()) { b"{}" } else { &body[..] };
    serde_json::from_slice(raw).map_err(|e| ServiceError::BadRequest(format!("invalid JSON body: {}", e)))
}

fn set_request_id(response: &mut Response, request_id: &str) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
}

async fn health() -> Json<Health> {
    Json(Health { status: "ok" })
}

#[derive(Serialize)]
struct InfoResponse {
    name: String,
    description: String,
    creation_time: i64,
    state_path: String,
    server_version: &'static str,
    evaluate_enabled: bool,
    uptime_ms: u64,
}

async fn service_info(State(state): State<Arc<AppState>>) -> Json<InfoResponse> {
    let service = state.registry.service_info().await;
    Json(InfoResponse {
        name: service.name,
        description: service.description,
        creation_time: service.creation_time,
        state_path: state.registry.state_path().display().to_string(),
        server_version: env!("CARGO_PKG_VERSION"),
        evaluate_enabled: state.config.evaluate_enabled,
        uptime_ms: state.start_time.elapsed().as_millis() as u64,
    })
}

async fn status(State(state): State<Arc<AppState>>) -> Json<JsonValue> {
    let objects = state.loader.list_objects().await;
    let loaded = state.loader.count_objects().await;
    Json(serde_json::json!({
        "revision": state.registry.revision().await,
        "loaded": loaded,
        "objects": objects,
    }))
}

async fn list_endpoints(State(state): State<Arc<AppState>>) -> ServiceResult<Json<JsonValue>> {
    let records = state.registry.get_endpoints(None).await?;
    Ok(Json(serde_json::to_value(records).map_err(|e| ServiceError::Internal(e.to_string()))?))
}

async fn get_endpoint(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> ServiceResult<Json<JsonValue>> {
    let records = state.registry.get_endpoints(Some(&name)).await?;
    Ok(Json(serde_json::to_value(records).map_err(|e| ServiceError::Internal(e.to_string()))?))
}

#[derive(Debug, Deserialize)]
struct AddEndpointRequest {
    name: String,
    #[serde(flatten)]
    spec: EndpointSpec,
}

async fn add_endpoint(State(state): State<Arc<AppState>>, body: Bytes) -> ServiceResult<(StatusCode, Json<JsonValue>)> {
    let AddEndpointRequest { name, spec } = parse_body(&body)?;
    validate_name(&name)?;
    let _guard = state.mutation_guard.try_lock().map_err(|_| ServiceError::MutationInProgress)?;
    if state.registry.get_endpoint(&name).await.is_ok() {
        return Err(ServiceError::DuplicateName(name));
    }
    let staged = stage_model(&state, &name, 1, &spec, None).await?;
    let record = match state.registry.add_endpoint(&name, spec).await {
        Ok(record) => record,
        Err(err) => {
            unstage(staged).await;
            return Err(err);
        }
    };
    let report = state.reconcile_after_mutation().await;
    Ok((StatusCode::CREATED, Json(mutation_body(&name, Some(&record), report))))
}

async fn update_endpoint(State(state): State<Arc<AppState>>, Path(name): Path<String>, body: Bytes) -> ServiceResult<Json<JsonValue>> {
    let spec: EndpointSpec = parse_body(&body)?;
    let _guard = state.mutation_guard.try_lock().map_err(|_| ServiceError::MutationInProgress)?;
    let prev = state.registry.get_endpoint(&name).await?;
    let version = prev.version + 1;
    if let Some(supplied) = spec.version {
        if supplied < prev.version {
            return Err(ServiceError::VersionConflict { name, supplied, current: prev.version });
        }
    }
    let staged = stage_model(&state, &name, version, &spec, Some(&prev)).await?;
    let record = match state.registry.update_endpoint(&name, spec).await {
        Ok(record) => record,
        Err(err) => {
            unstage(staged).await;
            return Err(err);
        }
    };
    let report = state.reconcile_after_mutation().await;
    Ok(Json(mutation_body(&name, Some(&record), report)))
}

async fn delete_endpoint(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> ServiceResult<Json<JsonValue>> {
    let _guard = state.mutation_guard.try_lock().map_err(|_| ServiceError::MutationInProgress)?;
    state.registry.delete_endpoint(&name).await?;
    let report = state.reconcile_after_mutation().await;
    Ok(Json(mutation_body(&name, None, report)))
}

fn mutation_body(name: &str, record: Option<&EndpointRecord>, report: Option<ReconcileReport>) -> JsonValue {
    serde_json::json!({ "name": name, "endpoint": record, "reconcile": report })
}

/// Copy model artifacts for `version` into place ahead of the registry
/// write. Without a `src_path`, an update carries the previous version's
/// files forward. Returns the staged directory so a failed write can undo it.
async fn stage_model(state: &AppState, name: &str, version: u64, spec: &EndpointSpec, prev: Option<&EndpointRecord>) -> ServiceResult<Option<PathBuf>> {
    let prev_kind = prev.map(|r| &r.kind);
    let endpoint_type = spec
        .endpoint_type
        .or_else(|| prev_kind.map(EndpointKind::endpoint_type))
        .unwrap_or(if spec.target.is_some() { EndpointType::Alias } else { EndpointType::Model });
    if endpoint_type != EndpointType::Model {
        return Ok(None);
    }
    let required_files = match (&spec.required_files, prev_kind) {
        (Some(files), _) => files.clone(),
        (None, Some(EndpointKind::Model { required_files, .. })) => required_files.clone(),
        _ => Vec::new(),
    };
    let source = match (&spec.src_path, prev) {
        (Some(src), _) => PathBuf::from(src),
        (None, Some(prev)) if prev.endpoint_type() == EndpointType::Model => {
            let dir = state.artifacts.path_for(name, prev.version);
            if !dir.is_dir() {
                return Ok(None);
            }
            dir
        }
        _ => return Ok(None),
    };
    state.artifacts.stage(name, version, &source, &required_files).await.map(Some)
}

async fn unstage(dir: Option<PathBuf>) {
    if let Some(dir) = dir {
        if let Err(err) = tokio::fs::remove_dir_all(&dir).await {
            warn!(path = %dir.display(), %err, "failed to remove staged artifacts");
        }
    }
}

#[derive(Debug, Deserialize)]
struct QueryRequest {
    #[serde(default = "empty_object")]
    data: JsonValue,
}

fn empty_object() -> JsonValue {
    JsonValue::Object(Map::new())
}

async fn query_endpoint(State(state): State<Arc<AppState>>, Path(name): Path<String>, body: Bytes) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let mut response = match run_query(&state, &name, &body, &request_id).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    };
    set_request_id(&mut response, &request_id);
    response
}

async fn run_query(state: &AppState, name: &str, body: &Bytes, request_id: &str) -> ServiceResult<Response> {
    let QueryRequest { data } = parse_body(body)?;
    let out = dispatcher::query(state.loader.table(), name, data, request_id).await?;
    let bytes = serde_json::to_vec(&out).map_err(|e| ServiceError::Internal(e.to_string()))?;
    let etag = format!("\"{}\"", content_fingerprint(&bytes));
    let mut response = (StatusCode::OK, [(header::CONTENT_TYPE, "application/json")], bytes).into_response();
    if let Ok(value) = HeaderValue::from_str(&etag) {
        response.headers_mut().insert(header::ETAG, value);
    }
    Ok(response)
}

#[derive(Debug, Deserialize)]
struct EvaluateRequest {
    script: String,
    #[serde(default)]
    data: JsonValue,
}

async fn evaluate(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    if !state.config.evaluate_enabled {
        return json_error(StatusCode::NOT_FOUND, "NotFound", JsonValue::String("/evaluate is disabled".to_string()));
    }
    let request_id = Uuid::new_v4().to_string();
    let mut response = match run_evaluate(&state, &body, &request_id).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    };
    set_request_id(&mut response, &request_id);
    response
}

async fn run_evaluate(state: &AppState, body: &Bytes, request_id: &str) -> ServiceResult<Response> {
    let EvaluateRequest { script, data } = parse_body(body)?;
    let arguments = match data {
        JsonValue::Null => Map::new(),
        JsonValue::Object(map) => map,
        JsonValue::Array(values) => positional_arguments(values),
        _ => return Err(ServiceError::BadRequest("data must be an object or an array".to_string())),
    };
    let started = Instant::now();
    match state.evaluator.evaluate(&script, &arguments).await {
        Ok(response) => {
            info!(request_id, took_ms = started.elapsed().as_millis() as u64, "script evaluated");
            Ok(Json(serde_json::json!({ "response": response, "uuid": request_id })).into_response())
        }
        Err(err) => {
            warn!(request_id, error = %err, "evaluation failed");
            Err(eval_failure(err))
        }
    }
}

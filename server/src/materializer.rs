use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};

use crate::evaluator::{positional_arguments, EvalError, Evaluator};

pub const DESCRIPTOR_FILE: &str = "endpoint.json";

#[derive(Debug, Clone, PartialEq)]
pub enum QueryArgs {
    Named(Map<String, JsonValue>),
    Positional(Vec<JsonValue>),
}

impl QueryArgs {
    /// Objects become named arguments and arrays positional ones; anything
    /// else is not a valid parameter set.
    pub fn from_json(value: JsonValue) -> Option<Self> {
        match value {
            JsonValue::Object(map) => Some(QueryArgs::Named(map)),
            JsonValue::Array(values) => Some(QueryArgs::Positional(values)),
            _ => None,
        }
    }
}

#[async_trait]
pub trait QueryObject: Send + Sync {
    async fn query(&self, args: QueryArgs) -> Result<JsonValue, EvalError>;
}

/// Builds query objects from a version directory. Called off the async
/// runtime, so implementations may block on file I/O.
pub trait Materializer: Send + Sync {
    fn materialize(&self, name: &str, path: &Path) -> anyhow::Result<Arc<dyn QueryObject>>;
}

#[derive(Debug, Deserialize)]
struct ModelDescriptor {
    script: String,
    #[serde(default)]
    arguments: Vec<String>,
}

pub struct ScriptObject {
    source: String,
    /// Declared parameter names; positional calls are bound to these when
    /// the counts match, otherwise they arrive as `_argN`.
    arguments: Vec<String>,
    evaluator: Arc<dyn Evaluator>,
}

impl ScriptObject {
    pub fn new(source: impl Into<String>, arguments: Vec<String>, evaluator: Arc<dyn Evaluator>) -> Self {
        Self { source: source.into(), arguments, evaluator }
    }

    fn bind(&self, args: QueryArgs) -> Map<String, JsonValue> {
        match args {
            QueryArgs::Named(map) => map,
            QueryArgs::Positional(values) if !self.arguments.is_empty() && values.len() == self.arguments.len() => {
                self.arguments.iter().cloned().zip(values).collect()
            }
            QueryArgs::Positional(values) => positional_arguments(values),
        }
    }
}

#[async_trait]
impl QueryObject for ScriptObject {
    async fn query(&self, args: QueryArgs) -> Result<JsonValue, EvalError> {
        let bound = self.bind(args);
        self.evaluator.evaluate(&self.source, &bound).await
    }
}

pub struct FileMaterializer {
    evaluator: Arc<dyn Evaluator>,
}

impl FileMaterializer {
    pub fn new(evaluator: Arc<dyn Evaluator>) -> Self {
        Self { evaluator }
    }
}

impl Materializer for FileMaterializer {
    fn materialize(&self, name: &str, path: &Path) -> anyhow::Result<Arc<dyn QueryObject>> {
        let file = path.join(DESCRIPTOR_FILE);
        let raw = std::fs::read_to_string(&file).with_context(|| format!("reading {} for {}", file.display(), name))?;
        let desc: ModelDescriptor = serde_json::from_str(&raw).with_context(|| format!("parsing {}", file.display()))?;
        if desc.script.trim().is_empty() {
            bail!("{} declares an empty script", file.display());
        }
        Ok(Arc::new(ScriptObject::new(desc.script, desc.arguments, self.evaluator.clone())))
    }
}

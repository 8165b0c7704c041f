//! Script evaluation capability.
//!
//! The server never runs user code itself; it hands the script text and its
//! named arguments to an [`Evaluator`]. The default [`ProcessEvaluator`]
//! spawns an interpreter command per call, writes
//! `{"script": ..., "arguments": {...}}` to its stdin and reads one JSON value
//! from its stdout.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("evaluation timed out after {0:?}")]
    Timeout(Duration),

    /// The script ran and failed; `kind` is the failure class reported by the
    /// interpreter when it can be recovered.
    #[error("{kind} : {message}")]
    Runtime { kind: String, message: String },

    #[error("failed to start evaluator: {0}")]
    Spawn(String),
}

#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, script: &str, arguments: &Map<String, JsonValue>) -> Result<JsonValue, EvalError>;
}

/// Positional query parameters are exposed to scripts as `_arg1`, `_arg2`, ...
pub fn positional_arguments(values: Vec<JsonValue>) -> Map<String, JsonValue> {
    values.into_iter().enumerate().map(|(i, v)| (format!("_arg{}", i + 1), v)).collect()
}

pub struct ProcessEvaluator {
    command: Vec<String>,
    timeout: Duration,
}

impl ProcessEvaluator {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

#[async_trait]
impl Evaluator for ProcessEvaluator {
    async fn evaluate(&self, script: &str, arguments: &Map<String, JsonValue>) -> Result<JsonValue, EvalError> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(EvalError::Spawn("no evaluator command configured".to_string()));
        };
        let envelope = serde_json::json!({ "script": script, "arguments": arguments });
        let payload = serde_json::to_vec(&envelope).map_err(|e| EvalError::Spawn(e.to_string()))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EvalError::Spawn(format!("{}: {}", program, e)))?;

        let run = async move {
            if let Some(mut stdin) = child.stdin.take() {
                // The interpreter may exit without reading its input.
                if let Err(err) = stdin.write_all(&payload).await {
                    debug!(%err, "evaluator closed stdin early");
                }
            }
            child.wait_with_output().await
        };
        let output = match tokio::time::timeout(self.timeout, run).await {
            Ok(res) => res.map_err(|e| EvalError::Spawn(e.to_string()))?,
            Err(_) => return Err(EvalError::Timeout(self.timeout)),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(runtime_error(&stderr, output.status.code()));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let text = stdout.trim();
        if text.is_empty() {
            return Ok(JsonValue::Null);
        }
        Ok(serde_json::from_str(text).unwrap_or_else(|_| JsonValue::String(text.to_string())))
    }
}

/// Build a runtime error from interpreter stderr. A last line shaped like
/// `SomeError: message` yields that class name as the kind.
fn runtime_error(stderr: &str, code: Option<i32>) -> EvalError {
    let last = stderr.lines().rev().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    if let Some((kind, message)) = last.split_once(": ") {
        if !kind.is_empty() && kind.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.') {
            return EvalError::Runtime { kind: kind.to_string(), message: message.to_string() };
        }
    }
    let message = if last.is_empty() { format!("evaluator exited with status {}", code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string())) } else { last.to_string() };
    EvalError::Runtime { kind: "ScriptError".to_string(), message }
}

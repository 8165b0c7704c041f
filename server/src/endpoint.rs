use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{ServiceError, ServiceResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointType {
    Model,
    Alias,
}

impl EndpointType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointType::Model => "model",
            EndpointType::Alias => "alias",
        }
    }
}

impl std::fmt::Display for EndpointType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an endpoint is backed by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EndpointKind {
    Model {
        /// Staging directory the artifacts were copied from, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src_path: Option<String>,
        #[serde(default)]
        required_files: Vec<String>,
    },
    Alias {
        target: String,
    },
}

impl EndpointKind {
    pub fn endpoint_type(&self) -> EndpointType {
        match self {
            EndpointKind::Model { .. } => EndpointType::Model,
            EndpointKind::Alias { .. } => EndpointType::Alias,
        }
    }

    pub fn target(&self) -> Option<&str> {
        match self {
            EndpointKind::Alias { target } => Some(target),
            EndpointKind::Model { .. } => None,
        }
    }

    /// Names this endpoint relies on; only aliases have any.
    pub fn dependencies(&self) -> BTreeSet<String> {
        match self {
            EndpointKind::Alias { target } => BTreeSet::from([target.clone()]),
            EndpointKind::Model { .. } => BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointRecord {
    #[serde(flatten)]
    pub kind: EndpointKind,
    pub version: u64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub docstring: String,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<JsonValue>,
    /// Unix time in seconds.
    pub creation_time: i64,
    pub last_modified_time: i64,
    #[serde(default)]
    pub is_public: bool,
}

impl EndpointRecord {
    pub fn endpoint_type(&self) -> EndpointType {
        self.kind.endpoint_type()
    }

    pub fn target(&self) -> Option<&str> {
        self.kind.target()
    }
}

/// Caller-supplied fields for add and update. Anything left `None` keeps
/// its previous value on update.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndpointSpec {
    #[serde(rename = "type")]
    pub endpoint_type: Option<EndpointType>,
    pub version: Option<u64>,
    pub description: Option<String>,
    #[serde(alias = "docstring")]
    pub doc: Option<String>,
    pub target: Option<String>,
    pub src_path: Option<String>,
    pub required_files: Option<Vec<String>>,
    pub schema: Option<JsonValue>,
    pub is_public: Option<bool>,
}

pub fn validate_name(name: &str) -> ServiceResult<()> {
    if name.is_empty() || !name_pattern().is_match(name) {
        return Err(ServiceError::InvalidName(name.to_string()));
    }
    Ok(())
}

pub fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_ -]+$").expect("static endpoint name pattern"))
}

//! Sectioned text state file holding service info, endpoint records and the
//! revision counter.
//!
//! Layout:
//!
//! ```text
//! [Service Info]
//! Name = ...
//! [Query Objects Service Versions]
//! <endpoint> = {"type":"model","version":2,...}
//! [Query Objects Docstrings]
//! <endpoint> = escaped docstring
//! [Meta]
//! Revision Number = 7
//! ```
//!
//! Keys and values are escaped so any text survives a round trip.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::Value as JsonValue;

use crate::endpoint::{now_secs, EndpointRecord};
use crate::error::{ServiceError, ServiceResult};

pub const SECTION_SERVICE: &str = "Service Info";
pub const SECTION_VERSIONS: &str = "Query Objects Service Versions";
pub const SECTION_DOCSTRINGS: &str = "Query Objects Docstrings";
pub const SECTION_META: &str = "Meta";
const KEY_REVISION: &str = "Revision Number";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
	pub name: String,
	pub description: String,
	pub creation_time: i64,
	pub cors_origin: Option<String>,
	pub cors_headers: Option<String>,
	pub cors_methods: Option<String>,
}

impl ServiceInfo {
	pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
		Self { name: name.into(), description: description.into(), creation_time: now_secs(), cors_origin: None, cors_headers: None, cors_methods: None }
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateFile {
	pub service: ServiceInfo,
	pub endpoints: BTreeMap<String, EndpointRecord>,
	pub revision: u64,
}

impl StateFile {
	pub fn new(service: ServiceInfo) -> Self {
		Self { service, endpoints: BTreeMap::new(), revision: 0 }
	}

	/// Read and parse the state file. A missing file or a missing mandatory
	/// section is `ConfigMissing`.
	pub fn load(path: &Path) -> ServiceResult<Self> {
		let raw = std::fs::read_to_string(path).map_err(|e| ServiceError::ConfigMissing(format!("{}: {}", path.display(), e)))?;
		Self::parse(&raw)
	}

	/// Write to a sibling temp file and rename it over `path`, so a failed
	/// write leaves the previous content intact.
	pub fn save(&self, path: &Path) -> ServiceResult<()> {
		let text = self.render()?;
		let write_err = |e: std::io::Error| ServiceError::WriteError(format!("{}: {}", path.display(), e));
		if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
			std::fs::create_dir_all(parent).map_err(write_err)?;
		}
		let tmp = temp_path(path);
		let result = (|| {
			let mut file = std::fs::File::create(&tmp)?;
			file.write_all(text.as_bytes())?;
			file.sync_all()?;
			std::fs::rename(&tmp, path)
		})();
		if let Err(e) = result {
			let _ = std::fs::remove_file(&tmp);
			return Err(write_err(e));
		}
		Ok(())
	}

	/// `load` on the blocking pool.
	pub async fn load_async(path: PathBuf) -> ServiceResult<Self> {
		tokio::task::spawn_blocking(move || Self::load(&path))
			.await
			.map_err(|e| ServiceError::Internal(format!("state file read task: {}", e)))?
	}

	/// `save` on the blocking pool. Hands the state back once it is on disk.
	pub async fn save_async(self, path: PathBuf) -> ServiceResult<Self> {
		tokio::task::spawn_blocking(move || self.save(&path).map(|()| self))
			.await
			.map_err(|e| ServiceError::Internal(format!("state file write task: {}", e)))?
	}

	pub fn parse(raw: &str) -> ServiceResult<Self> {
		let sections = parse_sections(raw)?;
		let section = |name: &str| sections.get(name).ok_or_else(|| ServiceError::ConfigMissing(format!("missing section [{}]", name)));

		let info = section(SECTION_SERVICE)?;
		let service = ServiceInfo {
			name: info.get("Name").cloned().unwrap_or_default(),
			description: info.get("Description").cloned().unwrap_or_default(),
			creation_time: info.get("Creation Time").and_then(|v| v.parse().ok()).unwrap_or(0),
			cors_origin: info.get("Access-Control-Allow-Origin").cloned().filter(|v| !v.is_empty()),
			cors_headers: info.get("Access-Control-Allow-Headers").cloned().filter(|v| !v.is_empty()),
			cors_methods: info.get("Access-Control-Allow-Methods").cloned().filter(|v| !v.is_empty()),
		};

		let docstrings = sections.get(SECTION_DOCSTRINGS);
		let mut endpoints = BTreeMap::new();
		for (name, blob) in section(SECTION_VERSIONS)? {
			let mut record: EndpointRecord = serde_json::from_str(blob).map_err(|e| ServiceError::ConfigMissing(format!("malformed record for {}: {}", name, e)))?;
			record.docstring = docstrings.and_then(|d| d.get(name)).cloned().unwrap_or_default();
			endpoints.insert(name.clone(), record);
		}

		let revision = section(SECTION_META)?
			.get(KEY_REVISION)
			.ok_or_else(|| ServiceError::ConfigMissing(format!("missing {} in [{}]", KEY_REVISION, SECTION_META)))?
			.parse::<u64>()
			.map_err(|e| ServiceError::ConfigMissing(format!("bad {}: {}", KEY_REVISION, e)))?;

		Ok(Self { service, endpoints, revision })
	}

	pub fn render(&self) -> ServiceResult<String> {
		let mut out = String::new();
		push_section(&mut out, SECTION_SERVICE);
		push_entry(&mut out, "Name", &self.service.name);
		push_entry(&mut out, "Description", &self.service.description);
		push_entry(&mut out, "Creation Time", &self.service.creation_time.to_string());
		for (key, value) in [
			("Access-Control-Allow-Origin", &self.service.cors_origin),
			("Access-Control-Allow-Headers", &self.service.cors_headers),
			("Access-Control-Allow-Methods", &self.service.cors_methods),
		] {
			push_entry(&mut out, key, value.as_deref().unwrap_or(""));
		}

		push_section(&mut out, SECTION_VERSIONS);
		for (name, record) in &self.endpoints {
			let mut blob = serde_json::to_value(record).map_err(|e| ServiceError::WriteError(e.to_string()))?;
			if let JsonValue::Object(map) = &mut blob {
				map.remove("docstring");
			}
			push_entry(&mut out, name, &blob.to_string());
		}

		push_section(&mut out, SECTION_DOCSTRINGS);
		for (name, record) in &self.endpoints {
			push_entry(&mut out, name, &record.docstring);
		}

		push_section(&mut out, SECTION_META);
		push_entry(&mut out, KEY_REVISION, &self.revision.to_string());
		Ok(out)
	}
}

fn temp_path(path: &Path) -> PathBuf {
	let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
	name.push(".tmp");
	path.with_file_name(name)
}

fn push_section(out: &mut String, name: &str) {
	if !out.is_empty() {
		out.push('\n');
	}
	out.push('[');
	out.push_str(name);
	out.push_str("]\n");
}

fn push_entry(out: &mut String, key: &str, value: &str) {
	out.push_str(&escape(key));
	out.push_str(" = ");
	out.push_str(&escape(value));
	out.push('\n');
}

type Sections = BTreeMap<String, BTreeMap<String, String>>;

fn parse_sections(raw: &str) -> ServiceResult<Sections> {
	let mut sections = Sections::new();
	let mut current: Option<String> = None;
	for (lineno, line) in raw.lines().enumerate() {
		let trimmed = line.trim();
		if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
			continue;
		}
		if let Some(name) = trimmed.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
			sections.entry(name.to_string()).or_default();
			current = Some(name.to_string());
			continue;
		}
		let Some(section) = current.as_ref() else {
			return Err(ServiceError::ConfigMissing(format!("line {}: entry outside of a section", lineno + 1)));
		};
		let Some(eq) = line.find('=') else {
			return Err(ServiceError::ConfigMissing(format!("line {}: expected key = value", lineno + 1)));
		};
		// Only the ASCII padding written by `push_entry` is stripped; other
		// whitespace belongs to the value.
		let key = unescape(line[..eq].trim_matches(' '));
		let value = unescape(line[eq + 1..].trim_matches(' '));
		sections.entry(section.clone()).or_default().insert(key, value);
	}
	Ok(sections)
}

/// Escape backslashes, line breaks, tabs and `=`, plus leading/trailing
/// spaces which the parser would otherwise trim.
pub fn escape(raw: &str) -> String {
	let mut out = String::with_capacity(raw.len());
	let last = raw.chars().count().saturating_sub(1);
	for (i, c) in raw.chars().enumerate() {
		match c {
			'\\' => out.push_str("\\\\"),
			'\n' => out.push_str("\\n"),
			'\r' => out.push_str("\\r"),
			'\t' => out.push_str("\\t"),
			'=' => out.push_str("\\e"),
			' ' if i == 0 || i == last => out.push_str("\\s"),
			c => out.push(c),
		}
	}
	out
}

pub fn unescape(raw: &str) -> String {
	let mut out = String::with_capacity(raw.len());
	let mut chars = raw.chars();
	while let Some(c) = chars.next() {
		if c != '\\' {
			out.push(c);
			continue;
		}
		match chars.next() {
			Some('\\') => out.push('\\'),
			Some('n') => out.push('\n'),
			Some('r') => out.push('\r'),
			Some('t') => out.push('\t'),
			Some('e') => out.push('='),
			Some('s') => out.push(' '),
			Some(other) => {
				out.push('\\');
				out.push(other);
			}
			None => out.push('\\'),
		}
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::endpoint::EndpointKind;
	use std::collections::BTreeSet;

	fn record(kind: EndpointKind, docstring: &str) -> EndpointRecord {
		let dependencies = kind.dependencies();
		EndpointRecord { kind, version: 3, description: "desc = with equals".into(), docstring: docstring.into(), dependencies, schema: Some(serde_json::json!({"input": ["x"]})), creation_time: 1_700_000_000, last_modified_time: 1_700_000_500, is_public: true }
	}

	fn sample() -> StateFile {
		let mut service = ServiceInfo::new("svc", "multi\nline description");
		service.cors_origin = Some("*".into());
		let mut state = StateFile::new(service);
		state.endpoints.insert("ttest".into(), record(EndpointKind::Model { src_path: Some("/staging/ttest".into()), required_files: vec!["endpoint.json".into()] }, "Adds two numbers.\n\n  x: first\\second\ttabbed \r\n"));
		state.endpoints.insert("t".into(), record(EndpointKind::Alias { target: "ttest".into() }, "  leading and trailing  "));
		state.revision = 42;
		state
	}

	#[test]
	fn escape_round_trips_awkward_text() {
		for raw in ["", " ", "a\\nb", "line1\nline2", "\\", "trailing\\", " x = y ", "tab\tcr\r", "\\s literal", "Returns x.\u{a0}", "\u{3000}wide\u{b}\u{c}\u{85}"] {
			assert_eq!(unescape(&escape(raw)), raw, "{raw:?}");
			assert!(!escape(raw).contains('\n'));
		}
	}

	#[test]
	fn save_and_load_round_trip() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("state.ini");
		let state = sample();
		state.save(&path).unwrap();
		let loaded = StateFile::load(&path).unwrap();
		assert_eq!(loaded, state);
		assert_eq!(loaded.endpoints["t"].dependencies, BTreeSet::from(["ttest".to_string()]));
		assert!(!dir.path().join("state.ini.tmp").exists());
	}

	#[test]
	fn unicode_whitespace_at_the_edges_survives_render_and_parse() {
		let mut state = sample();
		state.service.name = "\u{3000}svc\u{a0}".into();
		state.endpoints.get_mut("ttest").unwrap().docstring = "Returns x.\u{a0}".into();
		state.endpoints.get_mut("t").unwrap().description = "\u{b}\u{c}desc\u{85}".into();
		let parsed = StateFile::parse(&state.render().unwrap()).unwrap();
		assert_eq!(parsed.endpoints["ttest"].docstring, "Returns x.\u{a0}");
		assert_eq!(parsed.endpoints["t"].description, "\u{b}\u{c}desc\u{85}");
		assert_eq!(parsed, state);
	}

	#[test]
	fn docstrings_live_in_their_own_section() {
		let text = sample().render().unwrap();
		let versions = text.split("[Query Objects Docstrings]").next().unwrap();
		assert!(!versions.contains("Adds two numbers"));
		assert!(text.contains("ttest = Adds two numbers.\\n\\n"));
	}

	#[test]
	fn missing_file_is_config_missing() {
		let dir = tempfile::tempdir().unwrap();
		let err = StateFile::load(&dir.path().join("absent.ini")).unwrap_err();
		assert!(matches!(err, ServiceError::ConfigMissing(_)));
	}

	#[test]
	fn missing_meta_section_is_config_missing() {
		let raw = "[Service Info]\nName = x\n[Query Objects Service Versions]\n";
		assert!(matches!(StateFile::parse(raw), Err(ServiceError::ConfigMissing(_))));
	}

	#[test]
	fn comments_and_blank_lines_are_ignored() {
		let raw = "# generated\n[Service Info]\nName = x\n\n; note\n[Query Objects Service Versions]\n[Meta]\nRevision Number = 5\n";
		let state = StateFile::parse(raw).unwrap();
		assert_eq!(state.revision, 5);
		assert!(state.endpoints.is_empty());
		assert_eq!(state.service.name, "x");
	}

	#[test]
	fn failed_save_keeps_previous_content() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("state.ini");
		sample().save(&path).unwrap();
		let before = std::fs::read_to_string(&path).unwrap();
		// A directory squatting on the temp name makes the write fail.
		std::fs::create_dir(dir.path().join("state.ini.tmp")).unwrap();
		let mut changed = sample();
		changed.revision = 99;
		assert!(matches!(changed.save(&path), Err(ServiceError::WriteError(_))));
		assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
	}
}

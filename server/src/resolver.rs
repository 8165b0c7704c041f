use std::collections::{BTreeMap, HashSet};

use crate::endpoint::{EndpointRecord, EndpointType};
use crate::error::{ServiceError, ServiceResult};
use crate::loader::{LoadedObject, ObjectEntry, ObjectTable};

#[derive(Debug, Clone)]
pub struct Resolution {
    pub terminal: String,
    /// Every name visited, starting with the queried one and ending with
    /// `terminal`.
    pub chain: Vec<String>,
    pub entry: ObjectEntry,
}

/// Follow alias entries until a model entry is reached.
pub fn resolve(table: &ObjectTable, name: &str) -> ServiceResult<Resolution> {
    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut current = name.to_string();
    loop {
        if !seen.insert(current.clone()) {
            chain.push(current);
            return Err(ServiceError::UnknownUri(format!("alias cycle {}", chain.join(" -> "))));
        }
        let entry = table.get(&current).ok_or_else(|| ServiceError::UnknownUri(unknown(name, &chain, &current)))?;
        chain.push(current.clone());
        match entry.endpoint_type {
            EndpointType::Model => return Ok(Resolution { terminal: current, chain, entry }),
            EndpointType::Alias => match entry.object {
                Some(LoadedObject::Alias(target)) => current = target,
                _ => return Err(ServiceError::UnknownUri(format!("alias {} is not loaded", current))),
            },
        }
    }
}

fn unknown(queried: &str, chain: &[String], missing: &str) -> String {
    if chain.is_empty() {
        queried.to_string()
    } else {
        format!("{} (via {} -> {})", queried, chain.join(" -> "), missing)
    }
}

/// Names of records that depend on `name`, sorted.
pub fn dependents_of(name: &str, records: &BTreeMap<String, EndpointRecord>) -> Vec<String> {
    records.iter().filter(|(other, rec)| other.as_str() != name && rec.dependencies.contains(name)).map(|(other, _)| other.clone()).collect()
}

/// Whether pointing `name` at `target` would close a loop through existing
/// alias records.
pub fn would_cycle(name: &str, target: &str, records: &BTreeMap<String, EndpointRecord>) -> bool {
    let mut seen = HashSet::new();
    let mut current = target;
    loop {
        if current == name {
            return true;
        }
        if !seen.insert(current) {
            return true;
        }
        match records.get(current).and_then(|r| r.target()) {
            Some(next) => current = next,
            None => return false,
        }
    }
}

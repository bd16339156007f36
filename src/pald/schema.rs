//! PALD schema loading and validation.
//!
//! The schema is a nested JSON object. Any node that is an empty object, or
//! whose value is not an object, is a leaf; the dotted path from a section
//! root down to a leaf is an allowed key. Validation keeps only entries
//! whose exact key is allowed and silently drops everything else.

use std::collections::BTreeSet;
use std::path::Path;

use serde_json::{Map, Value};

use super::{PaldDocument, SECTIONS};
use crate::errors::SchemaError;

/// Parsed attribute schema. An empty tree allows no keys.
pub type SchemaTree = Map<String, Value>;

/// Load a schema file, falling back to an empty tree on any failure.
///
/// Failures are logged at error level since they indicate a deployment
/// problem, but never propagate.
pub fn load_schema(path: impl AsRef<Path>) -> SchemaTree {
    match try_load_schema(path.as_ref()) {
        Ok(tree) => tree,
        Err(e) => {
            log::error!("Falling back to empty PALD schema: {}", e);
            SchemaTree::new()
        }
    }
}

fn try_load_schema(path: &Path) -> Result<SchemaTree, SchemaError> {
    let display = path.display().to_string();
    let text = std::fs::read_to_string(path).map_err(|source| SchemaError::Read {
        path: display.clone(),
        source,
    })?;
    let value: Value = serde_json::from_str(&text).map_err(|source| SchemaError::Parse {
        path: display.clone(),
        source,
    })?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(SchemaError::NotAnObject { path: display }),
    }
}

/// All dotted keys the schema sanctions, walked depth-first per section.
///
/// Top-level entries other than `global`, `medium` and `detail` are
/// ignored, as is a section that is itself a leaf.
pub fn allowed_keys(schema: &SchemaTree) -> BTreeSet<String> {
    let mut keys = BTreeSet::new();
    for section in SECTIONS {
        if let Some(Value::Object(children)) = schema.get(section) {
            for (name, child) in children {
                collect_leaves(&format!("{}.{}", section, name), child, &mut keys);
            }
        }
    }
    keys
}

fn collect_leaves(path: &str, node: &Value, keys: &mut BTreeSet<String>) {
    match node {
        Value::Object(children) if !children.is_empty() => {
            for (name, child) in children {
                collect_leaves(&format!("{}.{}", path, name), child, keys);
            }
        }
        _ => {
            keys.insert(path.to_string());
        }
    }
}

/// Reduce `data` to schema-sanctioned entries.
///
/// Pure and idempotent. Anything other than a JSON object, `null` included,
/// yields an empty document.
pub fn validate(data: &Value, schema: &SchemaTree) -> PaldDocument {
    validate_with_keys(data, &allowed_keys(schema))
}

/// [`validate`] against a precomputed key set.
pub fn validate_with_keys(data: &Value, allowed: &BTreeSet<String>) -> PaldDocument {
    match data {
        Value::Object(map) => map
            .iter()
            .filter(|(key, _)| allowed.contains(key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
        _ => PaldDocument::empty(),
    }
}

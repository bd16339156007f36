//! PALD attribute documents.
//!
//! A PALD document is a flat map from dotted attribute keys
//! (`detail.hair.style`) to scalar values, organised under the three
//! top-level sections `global`, `medium` and `detail`. Documents are
//! produced by validation against a schema and never mutated afterwards;
//! a later extraction yields a new document.

pub mod cache;
pub mod schema;
pub mod scorer;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use cache::SchemaProvider;
pub use schema::{allowed_keys, load_schema, validate, SchemaTree};
pub use scorer::{ConsistencyReport, ConsistencyScorer, KeyOverlapScorer, Recommendation};

/// The three sections every PALD key lives under.
pub const SECTIONS: [&str; 3] = ["global", "medium", "detail"];

/// Section a dotted key belongs to, if any.
pub fn section_of(key: &str) -> Option<&'static str> {
    let head = key.split('.').next()?;
    SECTIONS.iter().copied().find(|s| *s == head)
}

/// Immutable mapping from dotted attribute key to value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaldDocument(BTreeMap<String, Value>);

impl PaldDocument {
    /// An empty document ("no attributes found").
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// A new document with `overrides` applied on top of this one.
    ///
    /// Only keys already sanctioned elsewhere should be passed in; this
    /// method does no schema filtering of its own.
    pub fn with_overrides(&self, overrides: &PaldDocument) -> PaldDocument {
        let mut merged = self.0.clone();
        for (key, value) in overrides.iter() {
            merged.insert(key.clone(), value.clone());
        }
        PaldDocument(merged)
    }

    /// The document as a JSON object with dotted keys.
    pub fn to_value(&self) -> Value {
        Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Map<String, Value>>(),
        )
    }
}

impl FromIterator<(String, Value)> for PaldDocument {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Flatten nested extractor output into dotted keys.
///
/// Objects recurse; empty objects, arrays and scalars are leaves. Keys that
/// are already dotted pass through unchanged, so flattening a flat map is a
/// no-op. Non-object input yields an empty object.
pub fn flatten(value: &Value) -> Value {
    let mut out = Map::new();
    if let Value::Object(map) = value {
        for (key, child) in map {
            flatten_into(key, child, &mut out);
        }
    }
    Value::Object(out)
}

fn flatten_into(prefix: &str, value: &Value, out: &mut Map<String, Value>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                flatten_into(&format!("{}.{}", prefix, key), child, out);
            }
        }
        other => {
            out.insert(prefix.to_string(), other.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_section_of() {
        assert_eq!(section_of("detail.hair.style"), Some("detail"));
        assert_eq!(section_of("global"), Some("global"));
        assert_eq!(section_of("other.key"), None);
    }

    #[test]
    fn test_flatten_nested() {
        let nested = json!({
            "global": {"gender": "female"},
            "detail": {"hair": {"style": "ponytail", "color": "brown"}},
            "medium.style": "cartoon"
        });
        let flat = flatten(&nested);
        assert_eq!(
            flat,
            json!({
                "global.gender": "female",
                "detail.hair.style": "ponytail",
                "detail.hair.color": "brown",
                "medium.style": "cartoon"
            })
        );
        assert_eq!(flatten(&flat), flat);
    }

    #[test]
    fn test_flatten_non_object() {
        assert_eq!(flatten(&json!("text")), json!({}));
        assert_eq!(flatten(&Value::Null), json!({}));
    }

    #[test]
    fn test_with_overrides_leaves_original() {
        let base: PaldDocument = [
            ("global.gender".to_string(), json!("female")),
            ("detail.hair.style".to_string(), json!("ponytail")),
        ]
        .into_iter()
        .collect();
        let overrides: PaldDocument = [("detail.hair.style".to_string(), json!("bun"))]
            .into_iter()
            .collect();

        let merged = base.with_overrides(&overrides);
        assert_eq!(merged.get("detail.hair.style"), Some(&json!("bun")));
        assert_eq!(merged.get("global.gender"), Some(&json!("female")));
        assert_eq!(base.get("detail.hair.style"), Some(&json!("ponytail")));
    }
}

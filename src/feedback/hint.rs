//! Parsing of free-text feedback into an advisory hint plus explicit
//! attribute overrides.
//!
//! Feedback such as `"make her look older, detail.hair.color: red"` keeps
//! the prose as a hint for the generator and turns `detail.hair.color: red`
//! into an override, provided the schema sanctions that key.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pald::PaldDocument;

static OVERRIDE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b((?:global|medium|detail)(?:\.[A-Za-z0-9_]+)+)\s*[:=]\s*([^,;\n]+)")
        .expect("override pattern is valid")
});

/// Advisory hint derived from one or more feedback rounds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedbackHint {
    /// Feedback prose with override clauses removed.
    pub text: String,
    /// Explicit `key: value` overrides, schema-filtered.
    pub overrides: PaldDocument,
}

impl FeedbackHint {
    /// Parse `feedback`, keeping only overrides for keys in `allowed`.
    pub fn parse(feedback: &str, allowed: &BTreeSet<String>) -> Self {
        let mut overrides = Vec::new();
        for caps in OVERRIDE_RE.captures_iter(feedback) {
            let key = &caps[1];
            let value = caps[2].trim();
            if allowed.contains(key) && !value.is_empty() {
                overrides.push((key.to_string(), Value::String(value.to_string())));
            } else {
                log::debug!("Ignoring feedback override for unknown key '{}'", key);
            }
        }

        let prose = OVERRIDE_RE.replace_all(feedback, "");
        let text = prose
            .split(|c| c == ',' || c == ';' || c == '\n')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(", ");

        Self {
            text,
            overrides: overrides.into_iter().collect(),
        }
    }

    /// Fold a newer round into this hint: overrides accumulate, the newer
    /// round's prose replaces the older one.
    pub fn merged_with(&self, newer: &FeedbackHint) -> FeedbackHint {
        FeedbackHint {
            text: if newer.text.is_empty() {
                self.text.clone()
            } else {
                newer.text.clone()
            },
            overrides: self.overrides.with_overrides(&newer.overrides),
        }
    }

    /// Prose for the generator, if any.
    pub fn advisory(&self) -> Option<String> {
        if self.text.is_empty() {
            None
        } else {
            Some(self.text.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn allowed() -> BTreeSet<String> {
        ["detail.hair.color", "global.age"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_prose_only() {
        let hint = FeedbackHint::parse("Please make the smile warmer", &allowed());
        assert_eq!(hint.text, "Please make the smile warmer");
        assert!(hint.overrides.is_empty());
    }

    #[test]
    fn test_overrides_extracted_and_filtered() {
        let hint = FeedbackHint::parse(
            "looks good, detail.hair.color: red; detail.hair.shine = high, a bit older",
            &allowed(),
        );
        assert_eq!(hint.overrides.get("detail.hair.color"), Some(&json!("red")));
        assert!(!hint.overrides.contains_key("detail.hair.shine"));
        assert_eq!(hint.text, "looks good, a bit older");
    }

    #[test]
    fn test_merge_accumulates_overrides() {
        let first = FeedbackHint::parse("detail.hair.color: red", &allowed());
        let second = FeedbackHint::parse("younger please, global.age = 25", &allowed());
        let merged = first.merged_with(&second);
        assert_eq!(merged.overrides.len(), 2);
        assert_eq!(merged.advisory().as_deref(), Some("younger please"));

        let third = FeedbackHint::parse("detail.hair.color: black", &allowed());
        let merged = merged.merged_with(&third);
        assert_eq!(merged.overrides.get("detail.hair.color"), Some(&json!("black")));
        assert_eq!(merged.advisory().as_deref(), Some("younger please"));
    }
}

//! Consistency scoring between an input PALD document and the document
//! re-derived from a generated image's description.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{section_of, PaldDocument};

/// Explicit advice a scorer may attach to its report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Accept,
    Regenerate,
}

/// Outcome of comparing two PALD documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    /// Agreement in `[0, 1]`.
    pub score: f64,
    /// Keys that differ between the two documents.
    pub diff_keys: Vec<String>,
    /// Input keys that matched.
    pub matched_keys: Vec<String>,
    pub recommendation: Option<Recommendation>,
}

impl ConsistencyReport {
    pub fn recommends_accept(&self) -> bool {
        self.recommendation == Some(Recommendation::Accept)
    }
}

/// Pluggable comparator.
///
/// Implementations must return a score in `[0, 1]` that never decreases
/// when more input keys are matched, and must list the differing keys.
pub trait ConsistencyScorer: Send + Sync + std::fmt::Debug {
    fn score(&self, input: &PaldDocument, described: &PaldDocument) -> ConsistencyReport;
}

/// Section-weighted key overlap.
///
/// Each input key contributes its section weight; the score is the matched
/// weight over the total input weight. Values match when their string
/// forms agree ignoring case and surrounding whitespace.
#[derive(Debug, Clone)]
pub struct KeyOverlapScorer {
    pub global_weight: f64,
    pub medium_weight: f64,
    pub detail_weight: f64,
}

impl Default for KeyOverlapScorer {
    fn default() -> Self {
        Self {
            global_weight: 2.0,
            medium_weight: 1.5,
            detail_weight: 1.0,
        }
    }
}

impl KeyOverlapScorer {
    fn weight(&self, key: &str) -> f64 {
        match section_of(key) {
            Some("global") => self.global_weight,
            Some("medium") => self.medium_weight,
            _ => self.detail_weight,
        }
    }
}

fn normalize(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_lowercase(),
        other => other.to_string().to_lowercase(),
    }
}

impl ConsistencyScorer for KeyOverlapScorer {
    fn score(&self, input: &PaldDocument, described: &PaldDocument) -> ConsistencyReport {
        let mut total = 0.0;
        let mut matched = 0.0;
        let mut matched_keys = Vec::new();
        let mut diff_keys = Vec::new();

        for (key, value) in input.iter() {
            let weight = self.weight(key).max(0.0);
            total += weight;
            match described.get(key) {
                Some(other) if normalize(other) == normalize(value) => {
                    matched += weight;
                    matched_keys.push(key.clone());
                }
                _ => diff_keys.push(key.clone()),
            }
        }
        diff_keys.extend(described.keys().filter(|k| !input.contains_key(k)).cloned());

        let score = if total > 0.0 {
            (matched / total).clamp(0.0, 1.0)
        } else {
            1.0
        };

        ConsistencyReport {
            score,
            diff_keys,
            matched_keys,
            recommendation: None,
        }
    }
}

//! Typed interaction signals.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pald::section_of;
use crate::pseudonym::Pseudonym;

/// Which of the three signal kinds a signal is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    PaldSlot,
    FeedbackClick,
    ConsistencyLabel,
}

impl SignalKind {
    /// Prefix used for aggregation group keys.
    pub fn group_prefix(self) -> &'static str {
        match self {
            SignalKind::PaldSlot => "pald",
            SignalKind::FeedbackClick => "feedback",
            SignalKind::ConsistencyLabel => "consistency",
        }
    }

    /// Inclusive domain of the numeric payload.
    pub fn domain(self) -> (f64, f64) {
        match self {
            SignalKind::PaldSlot | SignalKind::ConsistencyLabel => (0.0, 1.0),
            SignalKind::FeedbackClick => (0.0, 5.0),
        }
    }

    /// Kind an aggregation group key belongs to, from its prefix.
    pub fn from_group_key(key: &str) -> Option<SignalKind> {
        [
            SignalKind::PaldSlot,
            SignalKind::FeedbackClick,
            SignalKind::ConsistencyLabel,
        ]
        .into_iter()
        .find(|kind| {
            key.strip_prefix(kind.group_prefix())
                .and_then(|rest| rest.strip_prefix('_'))
                .map_or(false, |name| !name.is_empty())
        })
    }
}

/// Kind-specific signal payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalPayload {
    PaldSlot {
        slot: String,
        value: String,
        confidence: f64,
    },
    FeedbackClick {
        target: String,
        rating: f64,
    },
    ConsistencyLabel {
        attribute: String,
        score: f64,
    },
}

/// One interaction signal. Always pseudonymous.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbodimentSignal {
    pub pseudonym: Pseudonym,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: SignalPayload,
}

impl EmbodimentSignal {
    pub fn new(pseudonym: Pseudonym, payload: SignalPayload) -> Self {
        Self {
            pseudonym,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn kind(&self) -> SignalKind {
        match self.payload {
            SignalPayload::PaldSlot { .. } => SignalKind::PaldSlot,
            SignalPayload::FeedbackClick { .. } => SignalKind::FeedbackClick,
            SignalPayload::ConsistencyLabel { .. } => SignalKind::ConsistencyLabel,
        }
    }

    /// Name the signal is grouped under (slot, target or attribute).
    pub fn name(&self) -> &str {
        match &self.payload {
            SignalPayload::PaldSlot { slot, .. } => slot,
            SignalPayload::FeedbackClick { target, .. } => target,
            SignalPayload::ConsistencyLabel { attribute, .. } => attribute,
        }
    }

    /// The numeric payload that gets averaged.
    pub fn measure(&self) -> f64 {
        match &self.payload {
            SignalPayload::PaldSlot { confidence, .. } => *confidence,
            SignalPayload::FeedbackClick { rating, .. } => *rating,
            SignalPayload::ConsistencyLabel { score, .. } => *score,
        }
    }

    /// Aggregation group key, e.g. `pald_hair_style`.
    pub fn group_key(&self) -> String {
        group_key(self.kind(), self.name())
    }
}

/// Group key for a kind and a slot/target/attribute name.
///
/// A leading PALD section segment is dropped and remaining dots become
/// underscores: `detail.hair.style` under `PaldSlot` is `pald_hair_style`.
pub fn group_key(kind: SignalKind, name: &str) -> String {
    let trimmed = match section_of(name) {
        Some(section) if name.len() > section.len() => &name[section.len() + 1..],
        _ => name,
    };
    format!("{}_{}", kind.group_prefix(), trimmed.replace('.', "_"))
}

//! Signal collection capability and the in-memory signal buffer.
//!
//! Whether signals are collected at all is decided when the sink is built:
//! [`SignalCollector`] buffers, [`DisabledSignalSink`] drops everything and
//! reports `false`. Callers hold an `Arc<dyn SignalSink>` and never check
//! the feature switch themselves.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::signals::{EmbodimentSignal, SignalKind, SignalPayload};
use crate::pseudonym::Pseudonym;

/// Capability for recording interaction signals.
pub trait SignalSink: Send + Sync + std::fmt::Debug {
    /// Record a signal. Returns `false` when nothing was stored.
    fn record(&self, signal: EmbodimentSignal) -> bool;

    fn is_enabled(&self) -> bool;

    fn collect_pald_signal(
        &self,
        pseudonym: &Pseudonym,
        slot: &str,
        value: &str,
        confidence: f64,
    ) -> bool {
        self.record(EmbodimentSignal::new(
            pseudonym.clone(),
            SignalPayload::PaldSlot {
                slot: slot.to_string(),
                value: value.to_string(),
                confidence,
            },
        ))
    }

    fn collect_feedback_signal(&self, pseudonym: &Pseudonym, target: &str, rating: f64) -> bool {
        self.record(EmbodimentSignal::new(
            pseudonym.clone(),
            SignalPayload::FeedbackClick {
                target: target.to_string(),
                rating,
            },
        ))
    }

    fn collect_consistency_signal(
        &self,
        pseudonym: &Pseudonym,
        attribute: &str,
        score: f64,
    ) -> bool {
        self.record(EmbodimentSignal::new(
            pseudonym.clone(),
            SignalPayload::ConsistencyLabel {
                attribute: attribute.to_string(),
                score,
            },
        ))
    }
}

/// Sink used when federated learning is switched off.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledSignalSink;

impl SignalSink for DisabledSignalSink {
    fn record(&self, _signal: EmbodimentSignal) -> bool {
        false
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

/// Snapshot of the buffer for status endpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectorStatus {
    pub buffered: usize,
    pub by_kind: BTreeMap<SignalKind, usize>,
}

/// Buffering sink. Cloning shares the same buffer.
///
/// Every mutation takes the buffer lock, so there is a single writer at a
/// time; the lock is never held across an await.
#[derive(Debug, Clone, Default)]
pub struct SignalCollector {
    buffer: Arc<Mutex<Vec<EmbodimentSignal>>>,
}

impl SignalCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the buffer holds at least `min_signals` signals.
    pub fn is_ready_for_update(&self, min_signals: usize) -> bool {
        self.len() >= min_signals
    }

    /// Copy of the buffered signals.
    pub fn snapshot(&self) -> Vec<EmbodimentSignal> {
        self.buffer.lock().clone()
    }

    pub fn status(&self) -> CollectorStatus {
        let buffer = self.buffer.lock();
        let mut by_kind = BTreeMap::new();
        for signal in buffer.iter() {
            *by_kind.entry(signal.kind()).or_insert(0) += 1;
        }
        CollectorStatus {
            buffered: buffer.len(),
            by_kind,
        }
    }

    /// Run `consume` over the buffered signals and clear the buffer only if
    /// it succeeds.
    ///
    /// The lock is held for the whole call, so no signal can slip in between
    /// reading and clearing. An empty buffer yields `Ok(None)` without
    /// calling `consume`.
    pub fn drain_with<T, E, F>(&self, consume: F) -> Result<Option<T>, E>
    where
        F: FnOnce(&[EmbodimentSignal]) -> Result<T, E>,
    {
        let mut buffer = self.buffer.lock();
        if buffer.is_empty() {
            return Ok(None);
        }
        let out = consume(buffer.as_slice())?;
        buffer.clear();
        Ok(Some(out))
    }

    pub fn clear(&self) {
        self.buffer.lock().clear();
    }
}

impl SignalSink for SignalCollector {
    fn record(&self, signal: EmbodimentSignal) -> bool {
        if !signal.measure().is_finite() {
            log::warn!(
                "Dropping {:?} signal '{}' with non-finite value",
                signal.kind(),
                signal.name()
            );
            return false;
        }
        self.buffer.lock().push(signal);
        true
    }

    fn is_enabled(&self) -> bool {
        true
    }
}

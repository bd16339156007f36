//! Active-session bookkeeping per participant.
//!
//! At most one non-terminal session exists per pseudonym, and at most one
//! pipeline step for it runs at a time. Stop/accept requests from other
//! tasks are parked on the slot and picked up between steps.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use super::session::ConsistencySession;
use crate::errors::PipelineError;
use crate::pseudonym::Pseudonym;

/// Out-of-band request to end a running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelRequest {
    Stop,
    AcceptCurrent,
}

/// Registry entry for one participant.
#[derive(Debug)]
pub struct SessionSlot {
    session_id: Uuid,
    in_flight: AtomicBool,
    cancel: Mutex<Option<CancelRequest>>,
}

impl SessionSlot {
    fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            in_flight: AtomicBool::new(false),
            cancel: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn request_cancel(&self, request: CancelRequest) {
        let mut pending = self.cancel.lock();
        // A stop outranks an accept that has not been processed yet.
        if *pending != Some(CancelRequest::Stop) {
            *pending = Some(request);
        }
    }

    pub fn pending_cancel(&self) -> Option<CancelRequest> {
        *self.cancel.lock()
    }

    pub fn take_cancel(&self) -> Option<CancelRequest> {
        self.cancel.lock().take()
    }
}

/// Marks a slot busy until dropped.
#[derive(Debug)]
pub struct StepGuard {
    slot: Arc<SessionSlot>,
}

impl StepGuard {
    pub fn slot(&self) -> &Arc<SessionSlot> {
        &self.slot
    }
}

impl Drop for StepGuard {
    fn drop(&mut self) {
        self.slot.in_flight.store(false, Ordering::SeqCst);
    }
}

/// Registry of open sessions, keyed by pseudonym.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    slots: DashMap<Pseudonym, Arc<SessionSlot>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session for `pseudonym`.
    pub fn open(
        &self,
        pseudonym: &Pseudonym,
        session_id: Uuid,
    ) -> Result<Arc<SessionSlot>, PipelineError> {
        match self.slots.entry(pseudonym.clone()) {
            Entry::Occupied(existing) => Err(PipelineError::SessionAlreadyActive {
                pseudonym: pseudonym.to_string(),
                session_id: existing.get().session_id.to_string(),
            }),
            Entry::Vacant(vacant) => {
                let slot = Arc::new(SessionSlot::new(session_id));
                vacant.insert(Arc::clone(&slot));
                Ok(slot)
            }
        }
    }

    /// Release the participant's slot if it still belongs to `session_id`.
    pub fn close(&self, pseudonym: &Pseudonym, session_id: Uuid) -> bool {
        self.slots
            .remove_if(pseudonym, |_, slot| slot.session_id == session_id)
            .is_some()
    }

    pub fn slot(&self, pseudonym: &Pseudonym) -> Option<Arc<SessionSlot>> {
        self.slots.get(pseudonym).map(|s| Arc::clone(s.value()))
    }

    /// Claim the session's slot for one step.
    pub fn enter(&self, session: &ConsistencySession) -> Result<StepGuard, PipelineError> {
        let slot = self
            .slot(&session.pseudonym)
            .filter(|slot| slot.session_id == session.session_id)
            .ok_or_else(|| PipelineError::InvalidState {
                operation: "enter (session not registered)".to_string(),
                state: session.status.to_string(),
            })?;
        if slot
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(PipelineError::ParticipantBusy {
                pseudonym: session.pseudonym.to_string(),
            });
        }
        Ok(StepGuard { slot })
    }

    /// Park a stop/accept request for whatever is running for `pseudonym`.
    pub fn cancel(&self, pseudonym: &Pseudonym, request: CancelRequest) -> bool {
        match self.slot(pseudonym) {
            Some(slot) => {
                slot.request_cancel(request);
                true
            }
            None => false,
        }
    }

    pub fn active_count(&self) -> usize {
        self.slots.len()
    }
}

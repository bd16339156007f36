//! Consistency pipeline: sessions, the per-participant registry and the
//! controller that loops generation until an image is accepted.

pub mod controller;
pub mod registry;
pub mod session;

pub use controller::{ConsistencyController, TurnResult};
pub use registry::{CancelRequest, SessionRegistry, SessionSlot, StepGuard};
pub use session::{AcceptReason, ConsistencySession, SessionStatus, TurnOutcome};

//! # Embodiment
//!
//! Consistency and feedback control for attribute-driven avatar generation,
//! with privacy-preserving interaction signals.
//!
//! A participant's free-text description is extracted into a PALD attribute
//! document ([`pald`]), rendered by an external image generator, described
//! and re-extracted, and scored for consistency until an image is accepted
//! ([`consistency`]). Accepted images can be refined over a bounded number
//! of feedback rounds ([`feedback`]). Interaction signals are buffered,
//! turned into noised local updates and merged across clients by an
//! aggregation server ([`federated`], [`server`]).

pub mod config;
pub mod consistency;
pub mod errors;
pub mod federated;
pub mod feedback;
pub mod pald;
pub mod persistence;
pub mod pseudonym;
pub mod server;
pub mod services;

pub use config::EmbodimentConfig;
pub use consistency::{
    CancelRequest, ConsistencyController, ConsistencySession, SessionRegistry, SessionStatus,
    TurnOutcome, TurnResult,
};
pub use errors::{
    ConfigError, PipelineError, SchemaError, StoreError, TransportError, UpdateError,
};
pub use federated::{
    AggregationServer, EmbodimentSignal, FederatedClient, GlobalModelUpdate, ModelUpdate,
    SignalCollector, SignalSink, UpdateBuilder,
};
pub use feedback::{FeedbackLoop, FeedbackResponse};
pub use pald::{PaldDocument, SchemaProvider};
pub use persistence::{InMemorySessionStore, SessionStore, SqliteSessionStore};
pub use pseudonym::Pseudonym;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Error types for the embodiment crate.
//!
//! Collaborator failures never surface through these types: the pipeline
//! and feedback controllers turn them into recorded session errors. The
//! enums below cover the conditions a caller can actually act on.

use thiserror::Error;

/// Errors raised while loading the PALD attribute schema.
///
/// These are always logged and swallowed by `load_schema`, which falls
/// back to an empty schema tree.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// The schema file could not be read.
    #[error("Failed to read schema file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The schema file is not valid JSON.
    #[error("Failed to parse schema file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// The schema root is valid JSON but not an object.
    #[error("Schema root in '{path}' is not a JSON object")]
    NotAnObject { path: String },
}

/// Errors from the consistency pipeline and feedback loop.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A non-terminal session already exists for this participant.
    #[error("Participant '{pseudonym}' already has an active session ({session_id})")]
    SessionAlreadyActive {
        pseudonym: String,
        session_id: String,
    },

    /// Another step for this participant is still running.
    #[error("Participant '{pseudonym}' already has a step in flight")]
    ParticipantBusy { pseudonym: String },

    /// The requested operation is not valid in the session's current state.
    #[error("Operation '{operation}' is not allowed in state {state}")]
    InvalidState { operation: String, state: String },

    /// Feedback text was empty after trimming.
    #[error("Feedback text must not be empty")]
    EmptyFeedback,
}

/// Errors while encoding or decoding a model update payload.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// JSON (de)serialization failed.
    #[error("Update payload serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// zstd compression or decompression failed.
    #[error("Update payload compression error: {0}")]
    Compression(#[from] std::io::Error),

    /// The payload decoded but its content is unusable.
    #[error("Malformed update payload: {message}")]
    Malformed { message: String },
}

/// Errors while shipping an update to the aggregation server.
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP request failed.
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// No server URL was configured for the HTTP transport.
    #[error("No aggregation server URL configured")]
    NotConfigured,
}

/// Errors while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The configuration YAML is malformed.
    #[error("Invalid configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors from session snapshot storage.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite error.
    #[error("Session store database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Snapshot (de)serialization error.
    #[error("Session snapshot serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Lock or I/O failure around the store.
    #[error("Session store error: {message}")]
    Other { message: String },
}

//! HTTP surface of the aggregation server.
//!
//! Lets federated clients in other processes submit updates through
//! [`crate::federated::HttpTransport`] and lets operators trigger and
//! inspect aggregation rounds.
//!
//! # Endpoints
//!
//! - `GET  /health`       — Liveness probe
//! - `POST /updates`      — Submit a client update
//! - `POST /aggregate`    — Merge the current round
//! - `GET  /global-model` — Latest merged model
//! - `GET  /status`       — Round and buffer counters

pub mod routes;

pub use routes::{app_router, AppState};

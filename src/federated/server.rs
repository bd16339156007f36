//! Aggregation server stub: FedAvg-style merge of local updates.
//!
//! Updates are buffered per client id. Once at least
//! `min_clients_for_aggregation` distinct clients have reported, a round can
//! be merged: every value key is averaged across all well-formed updates,
//! weighted by each update's signal count. Malformed updates are skipped
//! individually. After a merge the buffer is emptied for the next round.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::update::ModelUpdate;
use crate::config::FederatedConfig;

/// Acknowledgement for a received update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiveResult {
    pub accepted: bool,
    /// Updates buffered for the current round, across all clients.
    pub total_updates: usize,
    pub can_aggregate: bool,
}

/// Result of one aggregation round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalModelUpdate {
    pub model_version: String,
    pub aggregation_round: u64,
    pub values: BTreeMap<String, f64>,
    /// Clients that contributed at least one well-formed update.
    pub participant_count: usize,
    pub total_signals: usize,
    pub created_at: DateTime<Utc>,
}

/// Counters for status endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub aggregation_round: u64,
    pub distinct_clients: usize,
    pub buffered_updates: usize,
    pub min_clients_for_aggregation: usize,
    pub has_global_model: bool,
}

#[derive(Debug, Default)]
struct RoundState {
    client_updates: BTreeMap<String, Vec<ModelUpdate>>,
    aggregation_round: u64,
    global_model: Option<GlobalModelUpdate>,
}

impl RoundState {
    fn total_updates(&self) -> usize {
        self.client_updates.values().map(Vec::len).sum()
    }
}

/// In-process aggregation server. All mutation goes through one mutex.
#[derive(Debug)]
pub struct AggregationServer {
    base_version: String,
    min_clients: usize,
    state: Mutex<RoundState>,
}

impl AggregationServer {
    pub fn new(base_version: impl Into<String>, min_clients: usize) -> Self {
        Self {
            base_version: base_version.into(),
            min_clients: min_clients.max(1),
            state: Mutex::new(RoundState::default()),
        }
    }

    pub fn from_config(config: &FederatedConfig) -> Self {
        Self::new(
            config.model_version.clone(),
            config.min_clients_for_aggregation,
        )
    }

    pub fn min_clients(&self) -> usize {
        self.min_clients
    }

    /// Buffer an update for `client_id`.
    pub fn receive_update(&self, client_id: &str, update: ModelUpdate) -> ReceiveResult {
        let mut state = self.state.lock();
        if client_id.trim().is_empty() {
            log::warn!("Rejecting update {} without client id", update.update_id);
            return ReceiveResult {
                accepted: false,
                total_updates: state.total_updates(),
                can_aggregate: state.client_updates.len() >= self.min_clients,
            };
        }

        log::debug!(
            "Received update {} from client {} ({} signals)",
            update.update_id,
            client_id,
            update.privacy_budget.signal_count
        );
        state
            .client_updates
            .entry(client_id.to_string())
            .or_default()
            .push(update);

        ReceiveResult {
            accepted: true,
            total_updates: state.total_updates(),
            can_aggregate: state.client_updates.len() >= self.min_clients,
        }
    }

    /// Whether the current round has reached quorum.
    pub fn can_aggregate(&self) -> bool {
        self.state.lock().client_updates.len() >= self.min_clients
    }

    /// Merge the current round.
    ///
    /// Returns `None` below quorum, or when no buffered update could be
    /// decoded. In the latter case the unusable updates are discarded and
    /// the round number is left unchanged.
    pub fn perform_aggregation(&self) -> Option<GlobalModelUpdate> {
        let mut state = self.state.lock();
        let distinct = state.client_updates.len();
        if distinct < self.min_clients {
            log::debug!(
                "Aggregation skipped: {} of {} required clients",
                distinct,
                self.min_clients
            );
            return None;
        }

        let mut sums: BTreeMap<String, (f64, f64)> = BTreeMap::new();
        let mut participants = 0usize;
        let mut total_signals = 0usize;

        for (client_id, updates) in &state.client_updates {
            let mut contributed = false;
            for update in updates {
                let payload = match update.decode_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        log::warn!(
                            "Skipping update {} from client {}: {}",
                            update.update_id,
                            client_id,
                            e
                        );
                        continue;
                    }
                };
                let weight = payload.privacy_budget.signal_count;
                if weight == 0 {
                    log::warn!(
                        "Skipping update {} from client {}: zero signal count",
                        update.update_id,
                        client_id
                    );
                    continue;
                }
                let Some(next_total) = total_signals.checked_add(weight) else {
                    log::warn!(
                        "Skipping update {} from client {}: signal total overflows",
                        update.update_id,
                        client_id
                    );
                    continue;
                };
                for (key, value) in &payload.values {
                    let entry = sums.entry(key.clone()).or_insert((0.0, 0.0));
                    entry.0 += value * weight as f64;
                    entry.1 += weight as f64;
                }
                total_signals = next_total;
                contributed = true;
            }
            if contributed {
                participants += 1;
            }
        }

        state.client_updates.clear();

        if participants == 0 {
            log::warn!("Aggregation round produced no usable updates");
            return None;
        }

        state.aggregation_round += 1;
        let round = state.aggregation_round;
        let values = sums
            .into_iter()
            .map(|(key, (weighted, weight))| (key, weighted / weight))
            .collect();

        let global = GlobalModelUpdate {
            model_version: format!("{}-r{}", self.base_version, round),
            aggregation_round: round,
            values,
            participant_count: participants,
            total_signals,
            created_at: Utc::now(),
        };
        log::info!(
            "Aggregation round {} merged {} clients, {} signals",
            round,
            participants,
            total_signals
        );
        state.global_model = Some(global.clone());
        Some(global)
    }

    /// Most recent merged model, if any round has completed.
    pub fn get_global_model(&self) -> Option<GlobalModelUpdate> {
        self.state.lock().global_model.clone()
    }

    pub fn status(&self) -> ServerStatus {
        let state = self.state.lock();
        ServerStatus {
            aggregation_round: state.aggregation_round,
            distinct_clients: state.client_updates.len(),
            buffered_updates: state.total_updates(),
            min_clients_for_aggregation: self.min_clients,
            has_global_model: state.global_model.is_some(),
        }
    }
}

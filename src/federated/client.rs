//! Federated client: turns the local signal buffer into updates and ships
//! them to an aggregation server.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::collector::SignalCollector;
use super::server::{AggregationServer, ReceiveResult};
use super::update::{ModelUpdate, UpdateBuilder};
use crate::config::FederatedConfig;
use crate::errors::TransportError;

/// Outcome status of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitStatus {
    Accepted,
    Rejected,
    Error,
}

/// Response returned to callers of [`FederatedClient::submit_update`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub status: SubmitStatus,
    pub message: String,
}

impl SubmitResponse {
    fn from_receipt(receipt: &ReceiveResult) -> Self {
        if receipt.accepted {
            Self {
                status: SubmitStatus::Accepted,
                message: format!(
                    "Update accepted ({} buffered, aggregation {})",
                    receipt.total_updates,
                    if receipt.can_aggregate { "ready" } else { "pending" }
                ),
            }
        } else {
            Self {
                status: SubmitStatus::Rejected,
                message: "Update rejected by aggregation server".to_string(),
            }
        }
    }
}

/// Body of `POST /updates`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub client_id: String,
    pub update: ModelUpdate,
}

/// Delivers updates to an aggregation server.
#[async_trait]
pub trait UpdateTransport: Send + Sync {
    async fn send(
        &self,
        client_id: &str,
        update: &ModelUpdate,
    ) -> Result<ReceiveResult, TransportError>;
}

/// Delivers straight into an in-process [`AggregationServer`].
#[derive(Debug, Clone)]
pub struct InProcessTransport {
    server: Arc<AggregationServer>,
}

impl InProcessTransport {
    pub fn new(server: Arc<AggregationServer>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl UpdateTransport for InProcessTransport {
    async fn send(
        &self,
        client_id: &str,
        update: &ModelUpdate,
    ) -> Result<ReceiveResult, TransportError> {
        Ok(self.server.receive_update(client_id, update.clone()))
    }
}

/// POSTs updates as JSON to `{base_url}/updates`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &FederatedConfig) -> Result<Self, TransportError> {
        config
            .server_url
            .as_deref()
            .map(Self::new)
            .ok_or(TransportError::NotConfigured)
    }
}

#[async_trait]
impl UpdateTransport for HttpTransport {
    async fn send(
        &self,
        client_id: &str,
        update: &ModelUpdate,
    ) -> Result<ReceiveResult, TransportError> {
        let body = SubmitRequest {
            client_id: client_id.to_string(),
            update: update.clone(),
        };
        let receipt = self
            .client
            .post(format!("{}/updates", self.base_url))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json::<ReceiveResult>()
            .await?;
        Ok(receipt)
    }
}

/// Client side of the signal subsystem for one process.
pub struct FederatedClient {
    client_id: String,
    collector: SignalCollector,
    builder: UpdateBuilder,
    transport: Arc<dyn UpdateTransport>,
    min_signals: usize,
}

impl std::fmt::Debug for FederatedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FederatedClient")
            .field("client_id", &self.client_id)
            .field("buffered", &self.collector.len())
            .field("min_signals", &self.min_signals)
            .finish()
    }
}

impl FederatedClient {
    pub fn new(
        client_id: impl Into<String>,
        collector: SignalCollector,
        builder: UpdateBuilder,
        transport: Arc<dyn UpdateTransport>,
        min_signals: usize,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            collector,
            builder,
            transport,
            min_signals,
        }
    }

    pub fn from_config(
        client_id: impl Into<String>,
        collector: SignalCollector,
        transport: Arc<dyn UpdateTransport>,
        config: &FederatedConfig,
    ) -> Self {
        Self::new(
            client_id,
            collector,
            UpdateBuilder::from_config(config),
            transport,
            config.min_signals_for_update,
        )
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn collector(&self) -> &SignalCollector {
        &self.collector
    }

    pub fn is_ready_for_update(&self) -> bool {
        self.collector.is_ready_for_update(self.min_signals)
    }

    /// Build an update from the buffer; `None` when the buffer is empty or
    /// encoding failed (in which case the signals stay buffered).
    pub fn create_local_update(&self) -> Option<ModelUpdate> {
        match self.builder.create_local_update(&self.collector) {
            Ok(update) => update,
            Err(e) => {
                log::error!("Failed to build local update, keeping signals: {}", e);
                None
            }
        }
    }

    /// Ship `update` to the server. Transport failures are reported in the
    /// response rather than returned as errors.
    pub async fn submit_update(&self, update: &ModelUpdate) -> SubmitResponse {
        match self.transport.send(&self.client_id, update).await {
            Ok(receipt) => SubmitResponse::from_receipt(&receipt),
            Err(e) => {
                log::warn!("Submitting update {} failed: {}", update.update_id, e);
                SubmitResponse {
                    status: SubmitStatus::Error,
                    message: e.to_string(),
                }
            }
        }
    }

    /// Build and submit in one go if the buffer has reached its threshold.
    pub async fn flush_if_ready(&self) -> Option<SubmitResponse> {
        if !self.is_ready_for_update() {
            return None;
        }
        let update = self.create_local_update()?;
        Some(self.submit_update(&update).await)
    }
}

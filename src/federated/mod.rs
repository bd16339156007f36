//! Privacy-preserving signal aggregation.
//!
//! Interaction signals are buffered locally ([`collector`]), condensed into
//! noised local updates ([`update`]), shipped by a [`client`] and merged
//! across pseudonymous clients by the aggregation [`server`].

pub mod client;
pub mod collector;
pub mod noise;
pub mod server;
pub mod signals;
pub mod update;

use std::sync::Arc;

use crate::config::FederatedConfig;

pub use client::{
    FederatedClient, HttpTransport, InProcessTransport, SubmitResponse, SubmitStatus,
    UpdateTransport,
};
pub use collector::{CollectorStatus, DisabledSignalSink, SignalCollector, SignalSink};
pub use noise::{ConstantNoise, GaussianNoise, NoiseSource};
pub use server::{AggregationServer, GlobalModelUpdate, ReceiveResult, ServerStatus};
pub use signals::{EmbodimentSignal, SignalKind, SignalPayload};
pub use update::{ModelUpdate, PrivacyBudget, UpdateBuilder, UpdatePayload};

/// Pick the signal sink for this process from the feature switch.
///
/// With collection enabled the returned sink writes into `collector`;
/// otherwise every collect call is a no-op returning `false`.
pub fn signal_sink(config: &FederatedConfig, collector: &SignalCollector) -> Arc<dyn SignalSink> {
    if config.enabled {
        Arc::new(collector.clone())
    } else {
        Arc::new(DisabledSignalSink)
    }
}

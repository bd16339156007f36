//! Local model updates: noised group means, compressed for transport.
//!
//! Signals are grouped by kind and name, each group's mean gets Gaussian
//! noise and is clipped back into the kind's domain. The resulting map and
//! a descriptive privacy record are serialized to JSON and zstd-compressed.
//!
//! The recorded epsilon/delta are descriptive only. Nothing here tracks or
//! decrements a running budget across successive updates.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::collector::SignalCollector;
use super::noise::{GaussianNoise, NoiseSource};
use super::signals::{EmbodimentSignal, SignalKind};
use crate::config::FederatedConfig;
use crate::errors::UpdateError;

/// Upper bound on the signal count a single update may claim.
pub const MAX_SIGNALS_PER_UPDATE: usize = 1_000_000;

/// Privacy parameters attached to an update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivacyBudget {
    pub epsilon: f64,
    pub delta: f64,
    pub signal_count: usize,
}

/// Decoded content of an update payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatePayload {
    pub model_version: String,
    /// Group key to noised, clipped mean.
    pub values: BTreeMap<String, f64>,
    pub privacy_budget: PrivacyBudget,
}

impl UpdatePayload {
    pub fn encode(&self, level: i32) -> Result<Vec<u8>, UpdateError> {
        let json = serde_json::to_vec(self)?;
        Ok(zstd::encode_all(json.as_slice(), level)?)
    }

    /// Decompress and parse a payload, rejecting content no honest
    /// builder produces: unknown group keys, values outside their kind's
    /// domain, and signal counts above [`MAX_SIGNALS_PER_UPDATE`].
    pub fn decode(bytes: &[u8]) -> Result<Self, UpdateError> {
        let json = zstd::decode_all(bytes)?;
        let payload: UpdatePayload = serde_json::from_slice(&json)?;
        payload.check()?;
        Ok(payload)
    }

    fn check(&self) -> Result<(), UpdateError> {
        let count = self.privacy_budget.signal_count;
        if count > MAX_SIGNALS_PER_UPDATE {
            return Err(UpdateError::Malformed {
                message: format!("signal count {} exceeds {}", count, MAX_SIGNALS_PER_UPDATE),
            });
        }
        for (key, value) in &self.values {
            let kind = SignalKind::from_group_key(key).ok_or_else(|| UpdateError::Malformed {
                message: format!("unknown group key '{}'", key),
            })?;
            let (lo, hi) = kind.domain();
            if !(value.is_finite() && (lo..=hi).contains(value)) {
                return Err(UpdateError::Malformed {
                    message: format!("value {} for '{}' outside [{}, {}]", value, key, lo, hi),
                });
            }
        }
        Ok(())
    }
}

/// One participant's noised, compressed update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelUpdate {
    pub update_id: Uuid,
    pub model_version: String,
    /// zstd-compressed JSON [`UpdatePayload`]; base64 on the wire.
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    pub privacy_budget: PrivacyBudget,
    pub created_at: DateTime<Utc>,
}

impl ModelUpdate {
    /// Wrap an already-noised value map.
    pub fn from_values(
        model_version: &str,
        values: BTreeMap<String, f64>,
        privacy_budget: PrivacyBudget,
        compression_level: i32,
    ) -> Result<Self, UpdateError> {
        let payload = UpdatePayload {
            model_version: model_version.to_string(),
            values,
            privacy_budget: privacy_budget.clone(),
        };
        Ok(Self {
            update_id: Uuid::new_v4(),
            model_version: model_version.to_string(),
            payload: payload.encode(compression_level)?,
            privacy_budget,
            created_at: Utc::now(),
        })
    }

    pub fn decode_payload(&self) -> Result<UpdatePayload, UpdateError> {
        UpdatePayload::decode(&self.payload)
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

/// Builds [`ModelUpdate`]s from buffered signals.
#[derive(Debug, Clone)]
pub struct UpdateBuilder {
    pub model_version: String,
    pub noise_multiplier: f64,
    pub epsilon: f64,
    pub delta: f64,
    pub compression_level: i32,
    noise: Arc<dyn NoiseSource>,
}

impl UpdateBuilder {
    pub fn from_config(config: &FederatedConfig) -> Self {
        Self {
            model_version: config.model_version.clone(),
            noise_multiplier: config.noise_multiplier,
            epsilon: config.epsilon,
            delta: config.delta,
            compression_level: config.compression_level,
            noise: Arc::new(GaussianNoise),
        }
    }

    pub fn with_noise(mut self, noise: Arc<dyn NoiseSource>) -> Self {
        self.noise = noise;
        self
    }

    /// Noised, clipped group means for `signals`.
    ///
    /// The deviation for a group is `noise_multiplier * range / n`, the
    /// sensitivity of a mean over `n` values bounded to a domain of width
    /// `range`.
    pub fn noised_means(&self, signals: &[EmbodimentSignal]) -> BTreeMap<String, f64> {
        let mut groups: BTreeMap<String, (SignalKind, Vec<f64>)> = BTreeMap::new();
        for signal in signals {
            groups
                .entry(signal.group_key())
                .or_insert_with(|| (signal.kind(), Vec::new()))
                .1
                .push(signal.measure());
        }

        groups
            .into_iter()
            .map(|(key, (kind, measures))| {
                let (lo, hi) = kind.domain();
                let n = measures.len() as f64;
                let mean = measures.iter().sum::<f64>() / n;
                let std_dev = self.noise_multiplier.abs() * (hi - lo) / n;
                let noised = mean + self.noise.sample(std_dev);
                let clipped = if noised.is_finite() {
                    noised.clamp(lo, hi)
                } else {
                    mean.clamp(lo, hi)
                };
                (key, clipped)
            })
            .collect()
    }

    /// Build an update from `signals` without touching any buffer.
    pub fn build(&self, signals: &[EmbodimentSignal]) -> Result<ModelUpdate, UpdateError> {
        let values = self.noised_means(signals);
        let budget = PrivacyBudget {
            epsilon: self.epsilon,
            delta: self.delta,
            signal_count: signals.len(),
        };
        ModelUpdate::from_values(&self.model_version, values, budget, self.compression_level)
    }

    /// Build an update from everything buffered in `collector`.
    ///
    /// Returns `Ok(None)` for an empty buffer. The buffer is cleared only
    /// after the update has been fully encoded.
    pub fn create_local_update(
        &self,
        collector: &SignalCollector,
    ) -> Result<Option<ModelUpdate>, UpdateError> {
        collector.drain_with(|signals| self.build(signals))
    }
}

//! Runtime configuration for the embodiment pipeline and the federated
//! signal subsystem.
//!
//! Configuration is read from YAML and then overridden from `EMBODIMENT_*`
//! environment variables, e.g. `EMBODIMENT_FEDERATED_ENABLED=true`.

use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "EMBODIMENT_";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbodimentConfig {
    /// Consistency pipeline settings.
    pub pipeline: PipelineConfig,
    /// Feedback loop settings.
    pub feedback: FeedbackConfig,
    /// Signal collection, update building and aggregation settings.
    pub federated: FederatedConfig,
    /// Attribute schema source.
    pub schema: SchemaConfig,
}

/// Settings for the extract/generate/describe/score loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Score at or above which a generated image is accepted.
    pub consistency_threshold: f64,
    /// Hard ceiling on generate/score cycles per turn.
    pub pald_consistency_max_iterations: u32,
    /// Whether a non-empty extraction triggers image generation.
    pub auto_generate_images: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            consistency_threshold: 0.8,
            pald_consistency_max_iterations: 3,
            auto_generate_images: true,
        }
    }
}

impl PipelineConfig {
    /// Iteration cap, never below one.
    pub fn max_iterations(&self) -> u32 {
        self.pald_consistency_max_iterations.max(1)
    }
}

/// Settings for post-acceptance feedback rounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    pub max_feedback_rounds: u32,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            max_feedback_rounds: 3,
        }
    }
}

/// Settings for the privacy-preserving signal subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FederatedConfig {
    /// Feature switch for signal collection.
    pub enabled: bool,
    /// Buffer length at which a local update is worth building.
    pub min_signals_for_update: usize,
    /// Scale of the Gaussian noise added to each group mean.
    pub noise_multiplier: f64,
    /// Descriptive privacy parameters recorded in every update.
    pub epsilon: f64,
    pub delta: f64,
    /// Model version stamped on local and global updates.
    pub model_version: String,
    /// Distinct clients needed before the server merges a round.
    pub min_clients_for_aggregation: usize,
    /// zstd level for update payloads.
    pub compression_level: i32,
    /// Base URL of the aggregation server, for the HTTP transport.
    pub server_url: Option<String>,
}

impl Default for FederatedConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_signals_for_update: 10,
            noise_multiplier: 0.1,
            epsilon: 1.0,
            delta: 1e-5,
            model_version: "embodiment-v1".to_string(),
            min_clients_for_aggregation: 2,
            compression_level: 3,
            server_url: None,
        }
    }
}

/// Where the attribute schema lives and how long it stays cached.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    pub path: PathBuf,
    pub cache_ttl_secs: u64,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("config/pald_schema.json"),
            cache_ttl_secs: 300,
        }
    }
}

impl EmbodimentConfig {
    /// Parse configuration from YAML text. Missing fields take defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load configuration from a YAML file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::from_yaml_str(&text)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Override fields from `EMBODIMENT_*` variables in the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    /// Override fields using an arbitrary lookup, so tests need not touch
    /// the process environment.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        override_parsed(&get, "PIPELINE_CONSISTENCY_THRESHOLD", &mut self.pipeline.consistency_threshold);
        override_parsed(
            &get,
            "PIPELINE_PALD_CONSISTENCY_MAX_ITERATIONS",
            &mut self.pipeline.pald_consistency_max_iterations,
        );
        override_parsed(&get, "PIPELINE_AUTO_GENERATE_IMAGES", &mut self.pipeline.auto_generate_images);
        override_parsed(&get, "FEEDBACK_MAX_FEEDBACK_ROUNDS", &mut self.feedback.max_feedback_rounds);
        override_parsed(&get, "FEDERATED_ENABLED", &mut self.federated.enabled);
        override_parsed(
            &get,
            "FEDERATED_MIN_SIGNALS_FOR_UPDATE",
            &mut self.federated.min_signals_for_update,
        );
        override_parsed(&get, "FEDERATED_NOISE_MULTIPLIER", &mut self.federated.noise_multiplier);
        override_parsed(&get, "FEDERATED_EPSILON", &mut self.federated.epsilon);
        override_parsed(&get, "FEDERATED_DELTA", &mut self.federated.delta);
        override_parsed(
            &get,
            "FEDERATED_MIN_CLIENTS_FOR_AGGREGATION",
            &mut self.federated.min_clients_for_aggregation,
        );
        override_parsed(&get, "FEDERATED_COMPRESSION_LEVEL", &mut self.federated.compression_level);
        if let Some(version) = get("FEDERATED_MODEL_VERSION") {
            self.federated.model_version = version;
        }
        if let Some(url) = get("FEDERATED_SERVER_URL") {
            self.federated.server_url = Some(url);
        }
        if let Some(path) = get("SCHEMA_PATH") {
            self.schema.path = PathBuf::from(path);
        }
        override_parsed(&get, "SCHEMA_CACHE_TTL_SECS", &mut self.schema.cache_ttl_secs);
    }
}

fn override_parsed<T, G>(get: &G, name: &str, target: &mut T)
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    if let Some(raw) = get(name) {
        match raw.trim().parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => log::warn!(
                "Ignoring unparseable value '{}' for {}{}",
                raw,
                ENV_PREFIX,
                name
            ),
        }
    }
}

//! TTL cache around the schema file.
//!
//! The schema is loaded once, kept for `cache_ttl_secs`, and reloaded on
//! expiry or after an explicit [`SchemaProvider::invalidate`].

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use serde_json::Value;

use super::schema::{allowed_keys, load_schema, validate_with_keys, SchemaTree};
use super::PaldDocument;
use crate::config::SchemaConfig;

/// A loaded schema together with its precomputed key set.
#[derive(Debug)]
pub struct LoadedSchema {
    pub tree: SchemaTree,
    pub keys: BTreeSet<String>,
}

impl LoadedSchema {
    pub fn new(tree: SchemaTree) -> Self {
        let keys = allowed_keys(&tree);
        Self { tree, keys }
    }

    pub fn validate(&self, data: &Value) -> PaldDocument {
        validate_with_keys(data, &self.keys)
    }
}

/// Cached access to the attribute schema.
#[derive(Clone)]
pub struct SchemaProvider {
    path: PathBuf,
    cache: Cache<PathBuf, Arc<LoadedSchema>>,
    fixed: Option<Arc<LoadedSchema>>,
}

impl std::fmt::Debug for SchemaProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaProvider")
            .field("path", &self.path)
            .field("fixed", &self.fixed.is_some())
            .field("cached", &self.cache.contains_key(&self.path))
            .finish()
    }
}

impl SchemaProvider {
    pub fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        let cache = Cache::builder().max_capacity(4).time_to_live(ttl).build();
        Self {
            path: path.into(),
            cache,
            fixed: None,
        }
    }

    pub fn from_config(config: &SchemaConfig) -> Self {
        Self::new(
            config.path.clone(),
            Duration::from_secs(config.cache_ttl_secs),
        )
    }

    /// A provider that always serves `tree` and never touches the disk.
    pub fn fixed(tree: SchemaTree) -> Self {
        let mut provider = Self::new("<inline>", Duration::from_secs(1));
        provider.fixed = Some(Arc::new(LoadedSchema::new(tree)));
        provider
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current schema, loading it if absent or expired.
    pub fn get(&self) -> Arc<LoadedSchema> {
        if let Some(fixed) = &self.fixed {
            return Arc::clone(fixed);
        }
        self.cache.get_with(self.path.clone(), || {
            log::debug!("Loading PALD schema from {}", self.path.display());
            Arc::new(LoadedSchema::new(load_schema(&self.path)))
        })
    }

    /// Validate `data` against the current schema.
    pub fn validate(&self, data: &Value) -> PaldDocument {
        self.get().validate(data)
    }

    /// Drop the cached schema; the next access reloads it.
    pub fn invalidate(&self) {
        self.cache.invalidate(&self.path);
    }
}

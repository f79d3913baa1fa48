//! Auditor options.
//!
//! The broker hands every auditor a flat map of string options. Keys are dotted paths into
//! [`AuditorConfig`] (`cache.max_entries`), except for two prefixes that are passed through
//! to the collaborators untouched:
//!
//! - `admin.<key>` goes to the [`ResourceListerConnector`](crate::lister::ResourceListerConnector)
//! - `catalog.<key>` goes to the [`CatalogConnector`](crate::catalog::CatalogConnector)
//!
//! Values of string keys are taken verbatim. All other values are parsed like environment
//! variables (`"10000"` is a number, `"false"` a bool). Unknown keys are rejected.

use std::{collections::HashMap, time::Duration};

use figment::{Figment, providers::Serialized, value::Value};
use serde::{Deserialize, Serialize};

use crate::{cache::ActivityCacheSettings, catalog::qualify, error::ConfigurationError};

pub const ADMIN_PREFIX: &str = "admin.";
pub const CATALOG_PREFIX: &str = "catalog.";

/// Keys whose values are names. `2024` or `true` are valid namespaces, not numbers or bools.
const STRING_KEYS: [&str; 3] = ["cluster_name", "cluster_namespace", "entity_type"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuditorConfig {
    pub cluster_name: String,
    /// Namespace used in qualified names. Defaults to `cluster_name`.
    pub cluster_namespace: Option<String>,
    /// Catalog type name of the mirrored resources.
    pub entity_type: String,
    pub cache: CacheConfig,
    pub reconcile: ReconcileConfig,
    pub queue: QueueConfig,
    pub shutdown: ShutdownConfig,
}

impl Default for AuditorConfig {
    fn default() -> Self {
        Self {
            cluster_name: "primary".to_string(),
            cluster_namespace: None,
            entity_type: "kafka_topic".to_string(),
            cache: CacheConfig::default(),
            reconcile: ReconcileConfig::default(),
            queue: QueueConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub write_ttl_ms: u64,
    pub access_ttl_ms: u64,
    pub max_entries: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            write_ttl_ms: 10_000,
            access_ttl_ms: 10_000,
            max_entries: 100_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconcileConfig {
    pub enabled: bool,
    pub interval_ms: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Work items the background worker may have pending before new ones are dropped.
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShutdownConfig {
    pub grace_period_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 5_000,
        }
    }
}

impl AuditorConfig {
    #[must_use]
    pub fn cluster_namespace(&self) -> &str {
        self.cluster_namespace
            .as_deref()
            .unwrap_or(&self.cluster_name)
    }

    #[must_use]
    pub fn qualified_name(&self, resource_name: &str) -> String {
        qualify(resource_name, self.cluster_namespace())
    }

    #[must_use]
    pub fn cache_settings(&self) -> ActivityCacheSettings {
        ActivityCacheSettings {
            write_ttl: Duration::from_millis(self.cache.write_ttl_ms),
            access_ttl: Duration::from_millis(self.cache.access_ttl_ms),
            max_entries: self.cache.max_entries,
        }
    }

    /// `None` if periodic reconciliation is disabled.
    #[must_use]
    pub fn reconcile_interval(&self) -> Option<Duration> {
        self.reconcile
            .enabled
            .then(|| Duration::from_millis(self.reconcile.interval_ms))
    }

    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown.grace_period_ms)
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        let namespace = self.cluster_namespace();
        if namespace.is_empty() {
            return Err(ConfigurationError::invalid(
                "cluster_namespace",
                "must not be empty",
            ));
        }
        if namespace.contains('@') {
            return Err(ConfigurationError::invalid(
                "cluster_namespace",
                format!("`{namespace}` must not contain `@`"),
            ));
        }
        if self.entity_type.is_empty() {
            return Err(ConfigurationError::invalid(
                "entity_type",
                "must not be empty",
            ));
        }

        let positive = [
            ("cache.write_ttl_ms", self.cache.write_ttl_ms),
            ("cache.access_ttl_ms", self.cache.access_ttl_ms),
            ("cache.max_entries", self.cache.max_entries),
            ("reconcile.interval_ms", self.reconcile.interval_ms),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigurationError::invalid(key, "must be greater than 0"));
            }
        }
        if self.queue.capacity == 0 {
            return Err(ConfigurationError::invalid(
                "queue.capacity",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Parsed auditor options: the typed configuration plus the collaborator pass-through maps.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuditorOptions {
    pub config: AuditorConfig,
    /// `admin.*` options, prefix stripped.
    pub admin: HashMap<String, String>,
    /// `catalog.*` options, prefix stripped.
    pub catalog: HashMap<String, String>,
}

impl AuditorOptions {
    /// Validates `options` without performing any I/O.
    ///
    /// # Errors
    /// Returns an error if a key is unknown, a value has the wrong type or a value fails
    /// validation.
    pub fn parse(options: &HashMap<String, String>) -> Result<Self, ConfigurationError> {
        let mut admin = HashMap::new();
        let mut catalog = HashMap::new();
        let mut figment = Figment::from(Serialized::defaults(AuditorConfig::default()));

        for (key, value) in options {
            if let Some(stripped) = key.strip_prefix(ADMIN_PREFIX) {
                admin.insert(stripped.to_string(), value.clone());
            } else if let Some(stripped) = key.strip_prefix(CATALOG_PREFIX) {
                catalog.insert(stripped.to_string(), value.clone());
            } else if STRING_KEYS.contains(&key.as_str()) {
                figment = figment.merge(Serialized::default(key, value));
            } else {
                let Ok(value) = value.parse::<Value>();
                figment = figment.merge(Serialized::default(key, value));
            }
        }

        let config: AuditorConfig = figment.extract()?;
        config.validate()?;

        Ok(Self {
            config,
            admin,
            catalog,
        })
    }
}

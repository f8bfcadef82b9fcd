//! Configuration System
//!
//! Provides configuration loading from:
//! - a JSON settings file (default `config/settings.json`)
//! - environment variables mirroring the settings keys in upper-case
//!
//! A non-empty environment value wins over the file. The settings file path
//! itself can be moved with `DELTASEARCH_CONFIG`.
//!
//! ## Example
//!
//! ```json
//! {
//!   "database_url": "http://database:8890/sparql",
//!   "search_url": "http://elasticsearch:9200",
//!   "update_wait_interval_minutes": 1,
//!   "types": [
//!     {
//!       "name": "session",
//!       "on_path": "sessions",
//!       "rdf_types": ["http://example.org/Session"],
//!       "properties": { "title": "http://purl.org/dc/terms/title" }
//!     }
//!   ]
//! }
//! ```

use crate::auth::AuthGroup;
use crate::schema::{RawTypeDefinition, Schema, SchemaError};
use figment::{
    providers::{Env, Format, Json},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Settings file / environment extraction failed
    #[error("Configuration error: {0}")]
    Figment(#[from] Box<figment::Error>),

    /// Configured types failed validation
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Settings keys recognized as environment overrides (upper-cased).
const ENV_KEYS: &[&str] = &[
    "database_url",
    "search_url",
    "extractor_url",
    "host",
    "port",
    "batch_size",
    "max_batches",
    "automatic_index_updates",
    "persist_indexes",
    "eager_indexing_groups",
    "ignored_allowed_groups",
    "update_wait_interval_minutes",
    "number_of_threads",
    "delta_batch_size",
    "connection_pool_size",
    "attachments_path_base",
    "cache_dir",
    "queue_file",
    "log_level",
    "enable_raw_dsl_endpoint",
];

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// SPARQL endpoint of the triple store (behind the authorizing proxy)
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Search engine base URL
    #[serde(default = "default_search_url")]
    pub search_url: String,

    /// Content extraction service base URL (attachments disabled when unset)
    #[serde(default)]
    pub extractor_url: Option<String>,

    /// HTTP bind host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP bind port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Page size for bulk index building
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Cap on pages per bulk build (0 = unlimited)
    #[serde(default)]
    pub max_batches: usize,

    /// When false, deltas invalidate affected indexes instead of rebuilding
    /// individual documents
    #[serde(default = "default_true")]
    pub automatic_index_updates: bool,

    /// Write the index registry to the triple store so indexes survive restart
    #[serde(default = "default_true")]
    pub persist_indexes: bool,

    /// Engine-specific settings template applied at index creation
    #[serde(default)]
    pub default_settings: Option<serde_json::Value>,

    /// Group combinations to pre-build at startup
    #[serde(default)]
    pub eager_indexing_groups: Vec<Vec<AuthGroup>>,

    /// Group patterns never considered for index partitioning
    #[serde(default)]
    pub ignored_allowed_groups: Vec<AuthGroup>,

    /// Debounce interval for the update queue, in minutes
    #[serde(default = "default_wait_minutes")]
    pub update_wait_interval_minutes: u64,

    /// Size of the update worker pool
    #[serde(default = "default_threads")]
    pub number_of_threads: usize,

    /// Slice size for batched VALUES discovery queries
    #[serde(default = "default_delta_batch_size")]
    pub delta_batch_size: usize,

    /// Fixed size of the triple-store connection pool
    #[serde(default = "default_pool_size")]
    pub connection_pool_size: usize,

    /// Filesystem root for attachment resolution
    #[serde(default = "default_attachments_path_base")]
    pub attachments_path_base: PathBuf,

    /// Content-extraction cache directory
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Durable update-queue snapshot file
    #[serde(default = "default_queue_file")]
    pub queue_file: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Expose the raw query-DSL pass-through endpoint
    #[serde(default)]
    pub enable_raw_dsl_endpoint: bool,

    /// Configured document types
    #[serde(default)]
    pub types: Vec<RawTypeDefinition>,
}

// Default value functions
fn default_database_url() -> String {
    "http://database:8890/sparql".to_string()
}
fn default_search_url() -> String {
    "http://elasticsearch:9200".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_batch_size() -> usize {
    128
}
fn default_wait_minutes() -> u64 {
    1
}
fn default_threads() -> usize {
    2
}
fn default_delta_batch_size() -> usize {
    100
}
fn default_pool_size() -> usize {
    4
}
fn default_attachments_path_base() -> PathBuf {
    PathBuf::from("/share/")
}
fn default_cache_dir() -> PathBuf {
    PathBuf::from("/cache")
}
fn default_queue_file() -> PathBuf {
    PathBuf::from("/config/update-queue.json")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}

/// Environment provider restricted to recognized keys with non-empty values.
fn env_overrides() -> Env {
    Env::raw().only(ENV_KEYS).filter(|key| {
        std::env::var(key.as_str().to_ascii_uppercase())
            .map(|v| !v.is_empty())
            .unwrap_or(false)
    })
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Merges in order:
    /// 1. the JSON settings file (`DELTASEARCH_CONFIG` or `config/settings.json`)
    /// 2. environment variables mirroring the keys in upper-case
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("DELTASEARCH_CONFIG")
            .unwrap_or_else(|_| "config/settings.json".to_string());
        Self::from_file(&path)
    }

    /// Load configuration from a specific settings file.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Figment::new()
            .merge(Json::file(path))
            .merge(env_overrides())
            .extract()
            .map_err(|e| ConfigError::Figment(Box::new(e)))
    }

    /// Parse and validate the configured types.
    pub fn schema(&self) -> Result<Schema, SchemaError> {
        Schema::from_raw(&self.types)
    }

    /// Debounce interval for the update queue.
    pub fn wait_interval(&self) -> Duration {
        Duration::from_secs(self.update_wait_interval_minutes * 60)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_url: default_database_url(),
            search_url: default_search_url(),
            extractor_url: None,
            host: default_host(),
            port: default_port(),
            batch_size: default_batch_size(),
            max_batches: 0,
            automatic_index_updates: true,
            persist_indexes: true,
            default_settings: None,
            eager_indexing_groups: Vec::new(),
            ignored_allowed_groups: Vec::new(),
            update_wait_interval_minutes: default_wait_minutes(),
            number_of_threads: default_threads(),
            delta_batch_size: default_delta_batch_size(),
            connection_pool_size: default_pool_size(),
            attachments_path_base: default_attachments_path_base(),
            cache_dir: default_cache_dir(),
            queue_file: default_queue_file(),
            log_level: default_log_level(),
            enable_raw_dsl_endpoint: false,
            types: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.delta_batch_size, 100);
        assert_eq!(config.number_of_threads, 2);
        assert_eq!(config.connection_pool_size, 4);
        assert_eq!(config.update_wait_interval_minutes, 1);
        assert!(config.automatic_index_updates);
        assert!(config.persist_indexes);
    }

    #[test]
    fn test_wait_interval_in_seconds() {
        let mut config = Config::default();
        config.update_wait_interval_minutes = 5;
        assert_eq!(config.wait_interval(), Duration::from_secs(300));
    }

    #[test]
    fn test_config_from_json_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{
                "database_url": "http://localhost:8890/sparql",
                "delta_batch_size": 25,
                "types": [
                    {
                        "name": "session",
                        "on_path": "sessions",
                        "rdf_types": ["http://example.org/Session"],
                        "properties": { "title": "http://example.org/title" }
                    }
                ]
            }"#,
        )
        .unwrap();

        let config = Config::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.database_url, "http://localhost:8890/sparql");
        assert_eq!(config.delta_batch_size, 25);
        // Unspecified keys keep their defaults
        assert_eq!(config.batch_size, 128);

        let schema = config.schema().unwrap();
        assert!(schema.type_named("session").is_some());
    }

    #[test]
    fn test_invalid_types_surface_schema_error() {
        let mut config = Config::default();
        config.types = vec![serde_json::from_value(serde_json::json!({
            "name": "broken",
            "on_path": "broken",
        }))
        .unwrap()];
        assert!(config.schema().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"database_url\""));
        assert!(json.contains("\"delta_batch_size\""));
    }
}

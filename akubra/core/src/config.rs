//! YAML Configuration
//!
//! Loads and validates the proxy configuration. Option names follow the
//! YAML file verbatim (`Listen`, `Backends`, `Clusters`, `Client`,
//! `ConnLimit`, `ConnectionTimeout`, `ConnectionDialTimeout`,
//! `AdditionalRequestHeaders`, `AdditionalResponseHeaders`,
//! `MaintainedBackend`, `SyncLogMethods`).
//!
//! # Example Configuration
//!
//! ```yaml
//! Listen: "0.0.0.0:8080"
//! ConnLimit: 100
//! ConnectionTimeout: 3s
//! ConnectionDialTimeout: 1s
//! Clusters:
//!   cluster1:
//!     Type: replicator
//!     Weight: 1
//!     Backends:
//!       - http://store-a.local:9000
//!       - http://store-b.local:9000
//! Client:
//!   Name: client1
//!   Clusters: [cluster1]
//!   ShardsCount: 100
//! SyncLogMethods: [PUT, DELETE]
//! ```
//!
//! A bare `Backends` list without a `Clusters` block is shorthand for one
//! `default` cluster of weight 1; a missing `Client` block is synthesised
//! from the configured cluster names. All validation happens at load time
//! and is fatal.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::Method;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

/// Cluster type bound to the default response-selection policy.
pub const CLUSTER_TYPE_REPLICATOR: &str = "replicator";

const DEFAULT_CLUSTER_NAME: &str = "default";
const DEFAULT_SHARDS_COUNT: u32 = 100;

// =============================================================================
// Error Types
// =============================================================================

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file.
    #[error("Failed to read config file at {path}: {source}")]
    Read {
        /// The path that was attempted.
        path: PathBuf,
        /// The underlying IO error.
        source: std::io::Error,
    },

    /// Failed to parse YAML.
    #[error("Failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

// =============================================================================
// Configuration Structures
// =============================================================================

/// One cluster block: a weighted, typed backend set.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    /// Response-selection policy name, `replicator` by default.
    #[serde(rename = "Type", default = "default_cluster_type")]
    pub kind: String,

    /// Shard weight relative to the other clusters of a client.
    #[serde(rename = "Weight", default = "default_weight")]
    pub weight: u32,

    /// Backend URLs of this cluster.
    #[serde(rename = "Backends", default)]
    pub backends: Vec<Url>,

    /// Free-form policy options, passed through to the cluster type.
    #[serde(rename = "Options", default)]
    pub options: BTreeMap<String, String>,
}

fn default_cluster_type() -> String {
    CLUSTER_TYPE_REPLICATOR.to_string()
}

fn default_weight() -> u32 {
    1
}

/// The client block: which clusters a ring serves and how many shards.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Client name, the prefix of every shard identifier.
    #[serde(rename = "Name", default = "default_client_name")]
    pub name: String,

    /// Ordered cluster list; order defines the regression chain.
    #[serde(rename = "Clusters", default)]
    pub clusters: Vec<String>,

    /// Number of shards placed on the consistent-hash ring.
    #[serde(rename = "ShardsCount", default = "default_shards_count")]
    pub shards_count: u32,
}

fn default_client_name() -> String {
    DEFAULT_CLUSTER_NAME.to_string()
}

fn default_shards_count() -> u32 {
    DEFAULT_SHARDS_COUNT
}

/// Top-level proxy configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "PascalCase", deny_unknown_fields)]
pub struct Config {
    /// Bind address, `host:port`.
    pub listen: String,

    /// Default backend list, used when no `Clusters` block is given.
    pub backends: Vec<Url>,

    /// Cluster blocks by name.
    pub clusters: BTreeMap<String, ClusterConfig>,

    /// The client served by this process.
    pub client: Option<ClientConfig>,

    /// Ceiling on concurrent outbound requests across all backends;
    /// zero disables the ceiling.
    pub conn_limit: i64,

    /// Per-read inactivity deadline on backend response bodies.
    #[serde(deserialize_with = "de_duration")]
    pub connection_timeout: Duration,

    /// Backend dial deadline.
    #[serde(deserialize_with = "de_duration")]
    pub connection_dial_timeout: Duration,

    /// Headers injected into every outbound request.
    pub additional_request_headers: BTreeMap<String, String>,

    /// Headers injected into every response to the client.
    pub additional_response_headers: BTreeMap<String, String>,

    /// One backend excluded from all routing.
    pub maintained_backend: Option<Url>,

    /// HTTP methods whose divergence is recorded in the sync log.
    pub sync_log_methods: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            backends: Vec::new(),
            clusters: BTreeMap::new(),
            client: None,
            conn_limit: 100,
            connection_timeout: Duration::from_secs(3),
            connection_dial_timeout: Duration::from_secs(3),
            additional_request_headers: BTreeMap::new(),
            additional_response_headers: BTreeMap::new(),
            maintained_backend: None,
            sync_log_methods: vec!["PUT".to_string(), "DELETE".to_string()],
        }
    }
}

impl Config {
    /// Parse a YAML document, then normalise and validate it.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_yaml::from_str(yaml)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Fill in the shorthand forms.
    ///
    /// A bare `Backends` list becomes a single `default` cluster; a missing
    /// `Client` block serves every configured cluster in name order.
    fn normalize(&mut self) {
        if self.clusters.is_empty() && !self.backends.is_empty() {
            self.clusters.insert(
                DEFAULT_CLUSTER_NAME.to_string(),
                ClusterConfig {
                    kind: default_cluster_type(),
                    weight: 1,
                    backends: self.backends.clone(),
                    options: BTreeMap::new(),
                },
            );
        }
        if self.client.is_none() && !self.clusters.is_empty() {
            self.client = Some(ClientConfig {
                name: default_client_name(),
                clusters: self.clusters.keys().cloned().collect(),
                shards_count: DEFAULT_SHARDS_COUNT,
            });
        }
    }

    /// Check every startup invariant; any violation is fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation("Listen must not be empty".into()));
        }
        if self.clusters.is_empty() {
            return Err(ConfigError::Validation(
                "no Clusters configured and no Backends to derive one from".into(),
            ));
        }
        for (name, cluster) in &self.clusters {
            if cluster.weight < 1 {
                return Err(ConfigError::Validation(format!(
                    "cluster {name:?} has weight {}, minimum is 1",
                    cluster.weight
                )));
            }
            if cluster.backends.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "cluster {name:?} has no backends"
                )));
            }
            if cluster.kind != CLUSTER_TYPE_REPLICATOR {
                return Err(ConfigError::Validation(format!(
                    "cluster {name:?} has unknown type {:?}",
                    cluster.kind
                )));
            }
        }

        let client = self
            .client
            .as_ref()
            .ok_or_else(|| ConfigError::Validation("no Client section".into()))?;
        if client.clusters.is_empty() {
            return Err(ConfigError::Validation(
                "Client.Clusters must not be empty".into(),
            ));
        }
        if client.shards_count < 1 {
            return Err(ConfigError::Validation(
                "Client.ShardsCount must be at least 1".into(),
            ));
        }
        let mut seen = HashSet::new();
        for name in &client.clusters {
            if !self.clusters.contains_key(name) {
                return Err(ConfigError::Validation(format!(
                    "client references unknown cluster {name:?}"
                )));
            }
            if !seen.insert(name) {
                return Err(ConfigError::Validation(format!(
                    "cluster {name:?} listed twice for client {:?}",
                    client.name
                )));
            }
        }

        self.sync_methods()?;
        self.request_header_additions()?;
        self.response_header_additions()?;
        Ok(())
    }

    /// The parsed `SyncLogMethods` set.
    pub fn sync_methods(&self) -> Result<HashSet<Method>, ConfigError> {
        self.sync_log_methods
            .iter()
            .map(|m| {
                Method::from_bytes(m.as_bytes()).map_err(|_| {
                    ConfigError::Validation(format!("invalid method {m:?} in SyncLogMethods"))
                })
            })
            .collect()
    }

    /// `AdditionalRequestHeaders` as a typed header map.
    pub fn request_header_additions(&self) -> Result<HeaderMap, ConfigError> {
        parse_headers(&self.additional_request_headers)
    }

    /// `AdditionalResponseHeaders` as a typed header map.
    pub fn response_header_additions(&self) -> Result<HeaderMap, ConfigError> {
        parse_headers(&self.additional_response_headers)
    }
}

fn parse_headers(raw: &BTreeMap<String, String>) -> Result<HeaderMap, ConfigError> {
    let mut headers = HeaderMap::with_capacity(raw.len());
    for (name, value) in raw {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ConfigError::Validation(format!("invalid header name {name:?}")))?;
        let value = HeaderValue::from_str(value).map_err(|_| {
            ConfigError::Validation(format!("invalid value for header {name:?}"))
        })?;
        headers.insert(name, value);
    }
    Ok(headers)
}

/// Load, normalise and validate the configuration at `path`.
pub fn load_config_from_path(path: &Path) -> Result<Config, ConfigError> {
    let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Config::from_yaml(&yaml)
}

// =============================================================================
// Duration strings
// =============================================================================

/// Parse a human duration: an integer followed by `ms`, `s`, `m` or `h`.
pub fn parse_duration(text: &str) -> Result<Duration, ConfigError> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| ConfigError::Validation(format!("duration {text:?} is missing a unit")))?;
    let (digits, unit) = text.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| ConfigError::Validation(format!("invalid duration {text:?}")))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(ConfigError::Validation(format!(
            "unknown duration unit {unit:?} in {text:?}"
        ))),
    }
}

fn de_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    parse_duration(&text).map_err(serde::de::Error::custom)
}

// =============================================================================
// Tests
// =============================================================================

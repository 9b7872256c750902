//! Node configuration (§4.12, ambient). Read once at startup from a TOML
//! file via `serde` + `toml`; there is no hot-reload, it is a plain
//! immutable struct built once rather than a live-reloaded document.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use submerge_base::{DatabaseId, NodeTag};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriptionDefaults {
    pub max_docs_per_batch: usize,
    #[serde(with = "humantime_serde")]
    pub time_to_wait_before_connection_retry: Duration,
    #[serde(default)]
    pub ignore_subscriber_errors: bool,
}

impl SubscriptionDefaults {
    pub fn to_options(&self) -> submerge_sub::SubscriptionOptions {
        let mut options = submerge_sub::SubscriptionOptions::default();
        options.max_docs_per_batch = self.max_docs_per_batch;
        options.time_to_wait_before_connection_retry = self.time_to_wait_before_connection_retry;
        options.ignore_subscriber_errors = self.ignore_subscriber_errors;
        options
    }
}

impl Default for SubscriptionDefaults {
    fn default() -> Self {
        SubscriptionDefaults {
            max_docs_per_batch: 128,
            time_to_wait_before_connection_retry: Duration::from_secs(5),
            ignore_subscriber_errors: false,
        }
    }
}

/// This node's identity and the tunables every subsystem needs at startup
/// (§4.12). `bucket_count` documents the value the cluster was provisioned
/// with; routing itself is the fixed `submerge_store::BUCKET_COUNT`
/// constant (a cross-language-stable hash modulus can't safely vary per
/// node), so this field is read back and checked against that constant
/// rather than fed into the hash.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_tag: String,
    pub database_id: String,
    pub listen_address: String,
    pub bucket_count: u32,
    #[serde(with = "humantime_serde")]
    pub min_heartbeat_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub max_inactive_time: Duration,
    #[serde(with = "humantime_serde")]
    pub max_timeout_cap: Duration,
    #[serde(default)]
    pub subscriptions: SubscriptionDefaults,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            node_tag: "A".to_string(),
            database_id: "db-A".to_string(),
            listen_address: "127.0.0.1:0".to_string(),
            bucket_count: submerge_store::BUCKET_COUNT,
            min_heartbeat_interval: Duration::from_secs(1),
            max_inactive_time: Duration::from_secs(60),
            max_timeout_cap: Duration::from_secs(60),
            subscriptions: SubscriptionDefaults::default(),
        }
    }
}

impl NodeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })
    }

    pub fn node_tag(&self) -> NodeTag {
        NodeTag::from(self.node_tag.as_str())
    }

    pub fn database_id(&self) -> DatabaseId {
        DatabaseId::from(self.database_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = NodeConfig::default();
        let text = toml::to_string(&config).unwrap();
        let back: NodeConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.node_tag, config.node_tag);
        assert_eq!(back.max_inactive_time, config.max_inactive_time);
    }

    #[test]
    fn subscription_defaults_carry_ignore_subscriber_errors_into_options() {
        let mut defaults = SubscriptionDefaults::default();
        assert!(!defaults.to_options().ignore_subscriber_errors);
        defaults.ignore_subscriber_errors = true;
        assert!(defaults.to_options().ignore_subscriber_errors);
    }

    #[test]
    fn load_rejects_a_missing_file() {
        let err = NodeConfig::load("/nonexistent/submerge.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}

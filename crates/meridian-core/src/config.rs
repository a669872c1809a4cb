//! Node configuration
//!
//! Configuration is layered: compiled-in defaults, then a TOML file, then
//! `MERIDIAN_<SECTION>_<FIELD>` environment variables, then validation.

use crate::errors::MeridianError;
use crate::identifiers::NodeId;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "MERIDIAN_";

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("Failed to read config file: {0}")]
    Io(String),
    /// The file is not valid TOML for this schema
    #[error("Invalid config: {0}")]
    Parse(String),
    /// An override named a key that does not exist
    #[error("Unknown config key '{0}'")]
    UnknownKey(String),
    /// An override value could not be parsed
    #[error("Field '{field}' has invalid value '{value}'")]
    InvalidValue {
        /// Dotted field name
        field: String,
        /// Offending value
        value: String,
    },
    /// A value failed validation
    #[error("Field '{field}' {message}")]
    Validation {
        /// Dotted field name
        field: String,
        /// What is wrong with it
        message: String,
    },
}

impl From<ConfigError> for MeridianError {
    fn from(err: ConfigError) -> Self {
        MeridianError::invalid(err.to_string())
    }
}

/// Identity of this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Cluster-unique node id; also the timestamp tiebreak
    pub node_id: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
        }
    }
}

impl NodeConfig {
    /// Node id as a typed identifier
    pub fn node_id(&self) -> NodeId {
        NodeId::new(self.node_id.clone())
    }
}

/// Distributed map settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    /// Deadline for a consistent-map commit to reach a majority
    pub consensus_timeout_ms: u64,
    /// Period between anti-entropy rounds
    pub anti_entropy_interval_ms: u64,
    /// Peers contacted per anti-entropy round
    pub anti_entropy_fanout: usize,
    /// Capacity of event broadcast channels
    pub event_channel_capacity: usize,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            consensus_timeout_ms: 5_000,
            anti_entropy_interval_ms: 5_000,
            anti_entropy_fanout: 1,
            event_channel_capacity: 1_024,
        }
    }
}

/// Southbound installation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
    /// Per-attempt deadline for a device to acknowledge an objective
    pub install_timeout_ms: u64,
    /// Resubmissions after the first attempt before the objective fails
    pub max_retries: usize,
    /// First backoff delay
    pub min_backoff_ms: u64,
    /// Backoff ceiling
    pub max_backoff_ms: u64,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            install_timeout_ms: 10_000,
            max_retries: 3,
            min_backoff_ms: 50,
            max_backoff_ms: 2_000,
        }
    }
}

/// Codec pool settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerializationConfig {
    /// Initial capacity of pooled encode buffers
    pub default_buffer_size: usize,
    /// Largest frame the codec will produce
    pub max_buffer_size: usize,
    /// Buffers created up front
    pub pool_size: usize,
}

impl Default for SerializationConfig {
    fn default() -> Self {
        Self {
            default_buffer_size: crate::serialization::DEFAULT_BUFFER_SIZE,
            max_buffer_size: crate::serialization::MAX_BUFFER_SIZE,
            pool_size: 1,
        }
    }
}

/// Complete node configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeridianConfig {
    /// Node identity
    pub node: NodeConfig,
    /// Distributed maps
    pub maps: MapConfig,
    /// Installer
    pub install: InstallConfig,
    /// Serialization
    pub serialization: SerializationConfig,
}

impl MeridianConfig {
    /// Parse from TOML text; missing sections and fields take defaults
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// Load from a file, apply environment overrides and validate
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.merge_with_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `MERIDIAN_<SECTION>_<FIELD>` overrides from the process environment
    pub fn merge_with_env(&mut self) -> Result<(), ConfigError> {
        self.merge_with_vars(std::env::vars())
    }

    /// Apply overrides from an explicit variable list
    pub fn merge_with_vars(
        &mut self,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Result<(), ConfigError> {
        for (name, value) in vars {
            let Some(rest) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let rest = rest.to_ascii_lowercase();
            let Some((section, field)) = rest.split_once('_') else {
                return Err(ConfigError::UnknownKey(rest));
            };
            self.set_from_string(&format!("{section}.{field}"), &value)?;
        }
        Ok(())
    }

    /// Set a single dotted key, e.g. `install.max_retries`
    pub fn set_from_string(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
            value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                field: key.to_string(),
                value: value.to_string(),
            })
        }

        match key {
            "node.node_id" => self.node.node_id = value.to_string(),
            "maps.consensus_timeout_ms" => self.maps.consensus_timeout_ms = parse(key, value)?,
            "maps.anti_entropy_interval_ms" => {
                self.maps.anti_entropy_interval_ms = parse(key, value)?;
            }
            "maps.anti_entropy_fanout" => self.maps.anti_entropy_fanout = parse(key, value)?,
            "maps.event_channel_capacity" => {
                self.maps.event_channel_capacity = parse(key, value)?;
            }
            "install.install_timeout_ms" => self.install.install_timeout_ms = parse(key, value)?,
            "install.max_retries" => self.install.max_retries = parse(key, value)?,
            "install.min_backoff_ms" => self.install.min_backoff_ms = parse(key, value)?,
            "install.max_backoff_ms" => self.install.max_backoff_ms = parse(key, value)?,
            "serialization.default_buffer_size" => {
                self.serialization.default_buffer_size = parse(key, value)?;
            }
            "serialization.max_buffer_size" => {
                self.serialization.max_buffer_size = parse(key, value)?;
            }
            "serialization.pool_size" => self.serialization.pool_size = parse(key, value)?,
            other => return Err(ConfigError::UnknownKey(other.to_string())),
        }
        Ok(())
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn fail(field: &str, message: &str) -> Result<(), ConfigError> {
            Err(ConfigError::Validation {
                field: field.to_string(),
                message: message.to_string(),
            })
        }

        if self.node.node_id.trim().is_empty() {
            return fail("node.node_id", "is required but missing");
        }
        if self.maps.consensus_timeout_ms == 0 {
            return fail("maps.consensus_timeout_ms", "must be at least 1");
        }
        if self.maps.anti_entropy_interval_ms == 0 {
            return fail("maps.anti_entropy_interval_ms", "must be at least 1");
        }
        if self.maps.event_channel_capacity == 0 {
            return fail("maps.event_channel_capacity", "must be at least 1");
        }
        if self.install.install_timeout_ms == 0 {
            return fail("install.install_timeout_ms", "must be at least 1");
        }
        if self.install.min_backoff_ms > self.install.max_backoff_ms {
            return fail("install.min_backoff_ms", "must not exceed install.max_backoff_ms");
        }
        if self.serialization.default_buffer_size == 0 {
            return fail("serialization.default_buffer_size", "must be at least 1");
        }
        if self.serialization.default_buffer_size > self.serialization.max_buffer_size {
            return fail(
                "serialization.default_buffer_size",
                "must not exceed serialization.max_buffer_size",
            );
        }
        if self.serialization.max_buffer_size > crate::serialization::MAX_BUFFER_SIZE {
            return fail("serialization.max_buffer_size", "exceeds the codec hard limit");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(MeridianConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = MeridianConfig::from_toml_str(
            r#"
            [node]
            node_id = "10.0.0.7"

            [install]
            max_retries = 7
            "#,
        )
        .unwrap();
        assert_eq!(config.node.node_id, "10.0.0.7");
        assert_eq!(config.install.max_retries, 7);
        assert_eq!(config.install.install_timeout_ms, 10_000);
        assert_eq!(config.maps, MapConfig::default());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = MeridianConfig::default();
        config
            .merge_with_vars(vec![
                ("MERIDIAN_MAPS_CONSENSUS_TIMEOUT_MS".to_string(), "250".to_string()),
                ("MERIDIAN_NODE_NODE_ID".to_string(), "n9".to_string()),
                ("UNRELATED".to_string(), "x".to_string()),
            ])
            .unwrap();
        assert_eq!(config.maps.consensus_timeout_ms, 250);
        assert_eq!(config.node.node_id, "n9");
    }

    #[test]
    fn test_env_override_rejects_bad_value() {
        let mut config = MeridianConfig::default();
        let err = config
            .merge_with_vars(vec![(
                "MERIDIAN_INSTALL_MAX_RETRIES".to_string(),
                "many".to_string(),
            )])
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_validation_names_field() {
        let mut config = MeridianConfig::default();
        config.install.min_backoff_ms = 10_000;
        match config.validate() {
            Err(ConfigError::Validation { field, .. }) => {
                assert_eq!(field, "install.min_backoff_ms");
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }
}

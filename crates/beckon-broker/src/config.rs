//! Broker configuration, loaded once at startup.

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use beckon_proto::ListenerSpec;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Everything the broker needs to come up: where agents register, where
/// they dial back, and the public listeners with their ACLs.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Address agents connect to for registration and bind frames.
    pub notify_address: String,
    /// Address agents dial back to with a stream id.
    pub back_address: String,
    /// Public listeners.
    pub listeners: Vec<ListenerSpec>,
}

impl BrokerConfig {
    /// Read and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks beyond what deserialization enforces. Listener
    /// addresses double as agent-table keys, so they must be unique.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listeners.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one listener is required".to_string(),
            ));
        }
        if self.notify_address == self.back_address {
            return Err(ConfigError::Invalid(
                "notify_address and back_address must differ".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for spec in &self.listeners {
            if !seen.insert(spec.listen_address.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate listener address: {}",
                    spec.listen_address
                )));
            }
            if spec.listen_address == self.notify_address
                || spec.listen_address == self.back_address
            {
                return Err(ConfigError::Invalid(format!(
                    "listener address {} collides with a broker address",
                    spec.listen_address
                )));
            }
            if spec.acl.is_empty() {
                tracing::warn!(
                    listener = %spec.listen_address,
                    "Listener has an empty ACL, no agent can ever register for it"
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_json() -> &'static str {
        r#"{
            "notify_address": "0.0.0.0:7000",
            "back_address": "0.0.0.0:7001",
            "listeners": [
                {"listen_address": "0.0.0.0:8080", "protocol": "http",
                 "acl": [{"access_id": "svc1", "register_token": "tok1"}]},
                {"listen_address": "0.0.0.0:9000", "protocol": "tcp",
                 "acl": [{"access_id": "svc2", "register_token": "tok2"}]}
            ]
        }"#
    }

    #[test]
    fn test_load_sample_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(sample_json().as_bytes()).unwrap();

        let config = BrokerConfig::load(file.path()).unwrap();

        assert_eq!(config.notify_address, "0.0.0.0:7000");
        assert_eq!(config.back_address, "0.0.0.0:7001");
        assert_eq!(config.listeners.len(), 2);
        assert_eq!(config.listeners[0].listener_key(), "0.0.0.0:8080");
    }

    #[test]
    fn test_load_missing_file() {
        let err = BrokerConfig::load("/nonexistent/beckon.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_load_bad_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();

        let err = BrokerConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_no_listeners_rejected() {
        let config: BrokerConfig = serde_json::from_str(
            r#"{"notify_address": "0.0.0.0:7000", "back_address": "0.0.0.0:7001",
                "listeners": []}"#,
        )
        .unwrap();

        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_duplicate_listener_address_rejected() {
        let config: BrokerConfig = serde_json::from_str(
            r#"{"notify_address": "0.0.0.0:7000", "back_address": "0.0.0.0:7001",
                "listeners": [
                    {"listen_address": "0.0.0.0:8080", "protocol": "tcp"},
                    {"listen_address": "0.0.0.0:8080", "protocol": "http"}
                ]}"#,
        )
        .unwrap();

        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_listener_colliding_with_notify_rejected() {
        let config: BrokerConfig = serde_json::from_str(
            r#"{"notify_address": "0.0.0.0:7000", "back_address": "0.0.0.0:7001",
                "listeners": [{"listen_address": "0.0.0.0:7000", "protocol": "tcp"}]}"#,
        )
        .unwrap();

        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_same_notify_and_back_rejected() {
        let config: BrokerConfig = serde_json::from_str(
            r#"{"notify_address": "0.0.0.0:7000", "back_address": "0.0.0.0:7000",
                "listeners": [{"listen_address": "0.0.0.0:8080", "protocol": "tcp"}]}"#,
        )
        .unwrap();

        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_empty_acl_is_legal() {
        let config: BrokerConfig = serde_json::from_str(
            r#"{"notify_address": "0.0.0.0:7000", "back_address": "0.0.0.0:7001",
                "listeners": [{"listen_address": "0.0.0.0:8080", "protocol": "tcp"}]}"#,
        )
        .unwrap();

        assert!(config.validate().is_ok());
    }
}

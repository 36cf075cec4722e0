//! Server configuration.
//!
//! Loaded from a camelCase JSON file. Every field has a default, so a missing
//! file or an empty object yields a working localhost server.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{Result, ServerError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Socket address to listen on.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Answer id-less requests that carry no `jsonrpc` member, like Bitcoin Core.
    #[serde(default)]
    pub rpc_quirks: bool,

    /// Per-session cap on concurrently executing WebSocket commands.
    #[serde(default = "default_max_concurrent_reqs")]
    pub max_concurrent_reqs: usize,

    #[serde(default = "default_max_websockets")]
    pub max_websockets: usize,

    /// Deadline for receiving a complete HTTP request or upgrade.
    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,

    /// Capacity of each session's outbound write queue.
    #[serde(default = "default_websocket_send_buffer")]
    pub websocket_send_buffer: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_pass: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_limit_user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_limit_pass: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

fn default_listen() -> String {
    "127.0.0.1:8009".to_string()
}
fn default_max_concurrent_reqs() -> usize {
    20
}
fn default_max_websockets() -> usize {
    25
}
fn default_auth_timeout_secs() -> u64 {
    10
}
fn default_websocket_send_buffer() -> usize {
    50
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            rpc_quirks: false,
            max_concurrent_reqs: default_max_concurrent_reqs(),
            max_websockets: default_max_websockets(),
            auth_timeout_secs: default_auth_timeout_secs(),
            websocket_send_buffer: default_websocket_send_buffer(),
            rpc_user: None,
            rpc_pass: None,
            rpc_limit_user: None,
            rpc_limit_pass: None,
            log_dir: None,
        }
    }
}

const KNOWN_FIELDS: &[&str] = &[
    "listen",
    "rpcQuirks",
    "maxConcurrentReqs",
    "maxWebsockets",
    "authTimeoutSecs",
    "websocketSendBuffer",
    "rpcUser",
    "rpcPass",
    "rpcLimitUser",
    "rpcLimitPass",
    "logDir",
];

impl ServerConfig {
    /// Load config from a JSON file, falling back to defaults if it is absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("config.json");
        warn_unknown_fields(&content, name);
        let config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// `<config dir>/jrpc/config.json`, if the platform has a config dir.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "jrpc").map(|dirs| dirs.config_dir().join("config.json"))
    }

    #[must_use]
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    /// # Errors
    ///
    /// Returns an error for settings the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_reqs == 0 {
            return Err(ServerError::Config(
                "maxConcurrentReqs must be at least 1".to_string(),
            ));
        }
        if self.websocket_send_buffer == 0 {
            return Err(ServerError::Config(
                "websocketSendBuffer must be at least 1".to_string(),
            ));
        }
        if self.rpc_user.is_some() != self.rpc_pass.is_some() {
            return Err(ServerError::Config(
                "rpcUser and rpcPass must be set together".to_string(),
            ));
        }
        if self.rpc_limit_user.is_some() != self.rpc_limit_pass.is_some() {
            return Err(ServerError::Config(
                "rpcLimitUser and rpcLimitPass must be set together".to_string(),
            ));
        }
        Ok(())
    }
}

/// Warn about top-level keys the server does not understand.
fn warn_unknown_fields(content: &str, config_name: &str) {
    for key in unknown_fields(content) {
        warn!("Unknown config field in {config_name}: {key}");
    }
}

fn unknown_fields(content: &str) -> Vec<String> {
    let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(content) else {
        return Vec::new();
    };
    let known: HashSet<&str> = KNOWN_FIELDS.iter().copied().collect();
    obj.keys()
        .filter(|key| !known.contains(key.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.listen, "127.0.0.1:8009");
        assert!(!config.rpc_quirks);
        assert_eq!(config.max_concurrent_reqs, 20);
        assert_eq!(config.max_websockets, 25);
        assert_eq!(config.auth_timeout(), Duration::from_secs(10));
        assert_eq!(config.websocket_send_buffer, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_object_is_default() {
        let config: ServerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn test_camel_case_fields() {
        let config: ServerConfig = serde_json::from_str(
            r#"{"rpcQuirks": true, "maxConcurrentReqs": 2, "rpcUser": "u", "rpcPass": "p"}"#,
        )
        .unwrap();
        assert!(config.rpc_quirks);
        assert_eq!(config.max_concurrent_reqs, 2);
        assert_eq!(config.rpc_user.as_deref(), Some("u"));
        assert_eq!(config.listen, "127.0.0.1:8009");
    }

    #[test]
    fn test_serialize_skips_unset_credentials() {
        let json = serde_json::to_value(ServerConfig::default()).unwrap();
        assert!(json.get("rpcUser").is_none());
        assert_eq!(json["websocketSendBuffer"], 50);
    }

    #[test]
    fn test_unknown_fields() {
        let unknown = unknown_fields(r#"{"listen": "x", "rpcquirks": true, "extra": 1}"#);
        assert_eq!(unknown.len(), 2);
        assert!(unknown.contains(&"rpcquirks".to_string()));
        assert!(unknown.contains(&"extra".to_string()));
        assert!(unknown_fields("not json").is_empty());
    }

    #[test]
    fn test_load_missing_file_returns_default() {
        let path = std::env::temp_dir().join("jrpc-config-does-not-exist.json");
        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn test_load_file() {
        let path = std::env::temp_dir().join(format!("jrpc-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"listen": "0.0.0.0:1234", "maxWebsockets": 3}"#).unwrap();
        let config = ServerConfig::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(config.listen, "0.0.0.0:1234");
        assert_eq!(config.max_websockets, 3);
    }

    #[test]
    fn test_load_malformed_file_fails() {
        let path =
            std::env::temp_dir().join(format!("jrpc-config-bad-{}.json", std::process::id()));
        std::fs::write(&path, "{ nope").unwrap();
        let result = ServerConfig::load(&path);
        std::fs::remove_file(&path).ok();
        assert!(matches!(result, Err(ServerError::Json(_))));
    }

    #[test]
    fn test_validate_rejects_half_credentials() {
        let config = ServerConfig {
            rpc_user: Some("u".to_string()),
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ServerError::Config(_))));

        let config = ServerConfig {
            max_concurrent_reqs: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}

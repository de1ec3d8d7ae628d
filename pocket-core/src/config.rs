//! Configuration types for the Pocket runtime

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{PocketError, Result};

/// Root directory for pocket state (`~/.pocket` unless overridden).
pub fn pocket_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".pocket")
}

/// Main configuration for the Pocket runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PocketConfig {
    /// Port the internal callback server binds on
    pub internal_server_port: u16,

    /// Whether to run the local HTTPS callback proxy
    pub enable_local_callback_proxy: bool,

    /// Hostname OAuth providers redirect back to
    pub public_hostname: String,

    /// Protocol of the public redirect URI
    pub public_server_protocol: String,

    /// Port of the public redirect URI
    pub public_server_port: u16,

    /// Path prefix the proxy strips before forwarding. Must not start with a slash.
    pub callback_url_rewrite_prefix: String,

    /// Directory the tool package cache lives under
    pub toolpkg_path: PathBuf,

    /// Session storage backend
    pub session: SessionConfig,

    /// Hard budget for a single tool invocation
    #[serde(with = "humantime_serde")]
    pub tool_call_timeout: Duration,

    /// Budget for auth futures, refreshes, and the pending-session watchdog
    #[serde(with = "humantime_serde")]
    pub auth_timeout: Duration,

    /// Window before token expiry in which sessions report needing a refresh
    #[serde(with = "humantime_serde")]
    pub refresh_window: Duration,

    /// Statically configured tool variables, lowest-priority source
    #[serde(default)]
    pub tool_vars: HashMap<String, String>,

    /// Per-provider OAuth2 client credentials, keyed by provider name
    #[serde(default)]
    pub auth: HashMap<String, ClientCredentials>,
}

impl Default for PocketConfig {
    fn default() -> Self {
        Self {
            internal_server_port: 8000,
            enable_local_callback_proxy: true,
            public_hostname: "localhost".to_string(),
            public_server_protocol: "https".to_string(),
            public_server_port: 8001,
            callback_url_rewrite_prefix: "proxy".to_string(),
            toolpkg_path: pocket_root().join("toolpkg"),
            session: SessionConfig::default(),
            tool_call_timeout: Duration::from_secs(180),
            auth_timeout: Duration::from_secs(300),
            refresh_window: Duration::from_secs(300),
            tool_vars: HashMap::new(),
            auth: HashMap::new(),
        }
    }
}

impl PocketConfig {
    /// Load configuration from `pocket.toml` merged with `POCKET_`-prefixed
    /// environment variables. Missing file falls back to defaults.
    pub fn load() -> Result<Self> {
        use figment::{
            providers::{Env, Format, Serialized, Toml},
            Figment,
        };

        let mut figment = Figment::from(Serialized::defaults(PocketConfig::default()))
            .merge(Toml::file("pocket.toml"))
            .merge(Env::prefixed("POCKET_"));

        if let Ok(path) = std::env::var("POCKET_CONFIG_PATH") {
            figment = figment.merge(Toml::file(path));
        }

        figment.extract().map_err(|e| {
            PocketError::Configuration(format!("Failed to load configuration: {}", e))
        })
    }

    /// Base URL of the internal callback server
    pub fn internal_base_url(&self) -> String {
        format!("http://localhost:{}", self.internal_server_port)
    }

    /// Base URL OAuth providers redirect to
    pub fn public_base_url(&self) -> String {
        match (self.public_server_protocol.as_str(), self.public_server_port) {
            ("https", 443) | ("http", 80) => {
                format!("{}://{}", self.public_server_protocol, self.public_hostname)
            }
            _ => format!(
                "{}://{}:{}",
                self.public_server_protocol, self.public_hostname, self.public_server_port
            ),
        }
    }

    /// Redirect URI for a callback route, routed through the proxy prefix
    pub fn callback_url(&self, path: &str) -> String {
        format!(
            "{}/{}/{}",
            self.public_base_url(),
            self.callback_url_rewrite_prefix,
            path.trim_start_matches('/')
        )
    }
}

/// OAuth2 client credentials for one provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

/// Session storage backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SessionConfig {
    /// Guarded in-process map; for tests and single-process deployments
    Memory,

    /// Redis-backed storage, safe for multi-process sharing
    Redis {
        /// Connection URL, e.g. `redis://127.0.0.1:6379/0`
        url: String,
    },
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig::Memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_urls() {
        let config = PocketConfig::default();
        assert_eq!(config.internal_base_url(), "http://localhost:8000");
        assert_eq!(config.public_base_url(), "https://localhost:8001");
        assert_eq!(
            config.callback_url("auth/github/oauth2/callback"),
            "https://localhost:8001/proxy/auth/github/oauth2/callback"
        );
    }

    #[test]
    fn public_base_url_elides_default_ports() {
        let config = PocketConfig {
            public_server_port: 443,
            ..Default::default()
        };
        assert_eq!(config.public_base_url(), "https://localhost");
    }

    #[test]
    fn session_config_roundtrip() {
        let redis = SessionConfig::Redis {
            url: "redis://127.0.0.1:6379/0".to_string(),
        };
        let json = serde_json::to_string(&redis).expect("serialize");
        let parsed: SessionConfig = serde_json::from_str(&json).expect("deserialize");
        match parsed {
            SessionConfig::Redis { url } => assert_eq!(url, "redis://127.0.0.1:6379/0"),
            SessionConfig::Memory => panic!("wrong backend"),
        }
    }
}

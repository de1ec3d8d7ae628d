//! Authentication context owned by an active session

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::provider::AuthProvider;

/// Credentials plus bookkeeping produced by a completed authentication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthContext {
    /// Provider the credentials belong to
    pub provider: AuthProvider,

    /// User's access token
    pub access_token: String,

    /// Refresh token, when the provider issued one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Expiration instant; `None` means the token does not expire
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    /// Human-readable description of this context
    pub description: String,

    /// Provider-specific payload (raw token response and the like)
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub detail: serde_json::Value,
}

impl AuthContext {
    pub fn new(provider: AuthProvider, access_token: impl Into<String>) -> Self {
        Self {
            provider,
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
            description: format!("{} authentication context", provider),
            detail: serde_json::Value::Null,
        }
    }

    pub fn with_refresh_token(mut self, token: impl Into<String>) -> Self {
        self.refresh_token = Some(token.into());
        self
    }

    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }

    /// Credential environment variables injected into a tool invocation,
    /// e.g. `GITHUB_TOKEN`.
    pub fn to_env(&self) -> HashMap<String, String> {
        let mut envs = HashMap::new();
        envs.insert(self.env_key(None), self.access_token.clone());
        envs
    }

    /// Like [`to_env`](Self::to_env) but suffixed with the profile name, so
    /// several profiles can coexist in one child environment.
    pub fn to_profiled_env(&self, profile: &str) -> HashMap<String, String> {
        let mut envs = HashMap::new();
        envs.insert(self.env_key(Some(profile)), self.access_token.clone());
        envs
    }

    fn env_key(&self, profile: Option<&str>) -> String {
        match profile {
            Some(p) => format!("{}_{}_TOKEN", self.provider.name().to_uppercase(), p.to_uppercase()),
            None => format!("{}_TOKEN", self.provider.name().to_uppercase()),
        }
    }
}

//! Generic OAuth2 authorization-code handler
//!
//! One configurable handler shape covers every OAuth2 provider: authorize
//! URL, token URL, client credentials, and scope conventions differ, the
//! protocol does not.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

use super::context::AuthContext;
use super::handler::{AuthHandler, AuthenticateRequest};
use super::provider::AuthProvider;
use crate::config::{ClientCredentials, PocketConfig};
use crate::error::{PocketError, Result};
use crate::futures::{FutureMetadata, FutureStore};

/// Token endpoint response in the shape RFC 6749 prescribes
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
}

/// Configuration for one provider's OAuth2 endpoints
#[derive(Debug, Clone)]
pub struct OAuth2Config {
    pub provider: AuthProvider,
    pub auth_url: String,
    pub token_url: String,
    pub credentials: ClientCredentials,
    pub recommended_scopes: BTreeSet<String>,
    /// Separator between scopes in the authorize URL; providers disagree
    pub scope_delimiter: char,
}

impl OAuth2Config {
    pub fn new(
        provider: AuthProvider,
        auth_url: impl Into<String>,
        token_url: impl Into<String>,
        credentials: ClientCredentials,
    ) -> Self {
        Self {
            provider,
            auth_url: auth_url.into(),
            token_url: token_url.into(),
            credentials,
            recommended_scopes: BTreeSet::new(),
            scope_delimiter: ' ',
        }
    }

    pub fn with_recommended_scopes(
        mut self,
        scopes: impl IntoIterator<Item = String>,
    ) -> Self {
        self.recommended_scopes = scopes.into_iter().collect();
        self
    }

    pub fn with_scope_delimiter(mut self, delimiter: char) -> Self {
        self.scope_delimiter = delimiter;
        self
    }
}

/// OAuth2 authorization-code handler for a single provider
pub struct OAuth2Handler {
    name: String,
    config: OAuth2Config,
    pocket: Arc<PocketConfig>,
    http: reqwest::Client,
}

impl OAuth2Handler {
    pub fn new(config: OAuth2Config, pocket: Arc<PocketConfig>) -> Self {
        Self {
            name: format!("{}-oauth2", config.provider),
            config,
            pocket,
            http: reqwest::Client::new(),
        }
    }

    fn redirect_uri(&self) -> String {
        self.pocket.callback_url(&format!(
            "auth/{}/oauth2/callback",
            self.config.provider
        ))
    }

    fn authorize_url(&self, req: &AuthenticateRequest, redirect_uri: &str, state: &str) -> String {
        let scope = req
            .scopes
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(&self.config.scope_delimiter.to_string());
        format!(
            "{}?client_id={}&redirect_uri={}&scope={}&state={}",
            self.config.auth_url,
            urlencoding::encode(&req.credentials.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(&scope),
            urlencoding::encode(state),
        )
    }

    fn context_from(&self, resp: TokenResponse, prior_refresh: Option<String>) -> AuthContext {
        let expires_at = resp
            .expires_in
            .map(|secs| Utc::now() + ChronoDuration::seconds(secs));
        let detail = serde_json::json!({
            "scope": resp.scope,
            "token_type": resp.token_type,
        });
        let mut context = AuthContext::new(self.config.provider, resp.access_token)
            .with_detail(detail);
        if let Some(expires_at) = expires_at {
            context = context.with_expires_at(expires_at);
        }
        // Providers often omit the refresh token on renewal; keep the old one.
        if let Some(refresh) = resp.refresh_token.or(prior_refresh) {
            context = context.with_refresh_token(refresh);
        }
        context
    }
}

#[async_trait]
impl AuthHandler for OAuth2Handler {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider(&self) -> AuthProvider {
        self.config.provider
    }

    fn provider_default(&self) -> bool {
        true
    }

    fn scoped(&self) -> bool {
        true
    }

    fn recommended_scopes(&self) -> BTreeSet<String> {
        self.config.recommended_scopes.clone()
    }

    fn make_request(&self, scopes: Vec<String>) -> AuthenticateRequest {
        AuthenticateRequest::new(scopes).with_credentials(self.config.credentials.clone())
    }

    fn prepare(
        &self,
        req: &AuthenticateRequest,
        thread_id: &str,
        profile: &str,
        future_uid: &str,
    ) -> Result<String> {
        let redirect_uri = self.redirect_uri();
        let auth_url = self.authorize_url(req, &redirect_uri, future_uid);

        FutureStore::global().create(
            future_uid,
            FutureMetadata {
                redirect_uri: Some(redirect_uri),
                thread_id: thread_id.to_string(),
                profile: profile.to_string(),
            },
        );

        debug!(handler = %self.name, %future_uid, "prepared oauth2 authorize url");
        Ok(auth_url)
    }

    async fn authenticate(
        &self,
        req: &AuthenticateRequest,
        future_uid: &str,
    ) -> Result<AuthContext> {
        let meta = FutureStore::global()
            .metadata(future_uid)
            .ok_or_else(|| PocketError::Future(format!("future not found: {}", future_uid)))?;
        let receiver = FutureStore::global().take_receiver(future_uid)?;
        let code = receiver
            .await
            .map_err(|_| PocketError::Future("authorization future dropped".to_string()))?;

        let redirect_uri = meta.redirect_uri.unwrap_or_default();
        let resp = self
            .http
            .post(&self.config.token_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code.as_str()),
                ("client_id", req.credentials.client_id.as_str()),
                ("client_secret", req.credentials.client_secret.as_str()),
                ("redirect_uri", redirect_uri.as_str()),
            ])
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(PocketError::Other(format!(
                "failed to exchange authorization code, status: {}",
                resp.status()
            )));
        }

        let token: TokenResponse = resp.json().await?;
        Ok(self.context_from(token, None))
    }

    async fn refresh(
        &self,
        req: &AuthenticateRequest,
        context: &AuthContext,
    ) -> Result<AuthContext> {
        let refresh_token = context.refresh_token.clone().ok_or_else(|| {
            PocketError::RefreshFailure("no refresh token in stored context".to_string())
        })?;

        let resp = self
            .http
            .post(&self.config.token_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("client_id", req.credentials.client_id.as_str()),
                ("client_secret", req.credentials.client_secret.as_str()),
            ])
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(PocketError::RefreshFailure(format!(
                "token endpoint returned status {}",
                resp.status()
            )));
        }

        let token: TokenResponse = resp.json().await?;
        Ok(self.context_from(token, Some(refresh_token)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> OAuth2Handler {
        let credentials = ClientCredentials {
            client_id: "cid".to_string(),
            client_secret: "secret".to_string(),
        };
        let config = OAuth2Config::new(
            AuthProvider::Github,
            "https://github.com/login/oauth/authorize",
            "https://github.com/login/oauth/access_token",
            credentials,
        )
        .with_recommended_scopes(["repo".to_string()])
        .with_scope_delimiter(',');
        OAuth2Handler::new(config, Arc::new(PocketConfig::default()))
    }

    #[test]
    fn authorize_url_carries_state_and_scopes() {
        let handler = handler();
        let req = handler.make_request(vec!["repo".to_string(), "user".to_string()]);
        let url = handler.authorize_url(&req, "https://localhost:8001/cb", "uid-1");
        assert!(url.starts_with("https://github.com/login/oauth/authorize?"));
        assert!(url.contains("state=uid-1"));
        assert!(url.contains("client_id=cid"));
        assert!(url.contains(&urlencoding::encode("repo,user").into_owned()));
    }

    #[test]
    fn prepare_registers_future_with_redirect() {
        let handler = handler();
        let req = handler.make_request(vec!["repo".to_string()]);
        handler
            .prepare(&req, "default", "default", "oauth2-prep-uid")
            .expect("prepare");
        let meta = FutureStore::global()
            .metadata("oauth2-prep-uid")
            .expect("future registered");
        assert!(meta
            .redirect_uri
            .unwrap()
            .ends_with("/proxy/auth/github/oauth2/callback"));
        FutureStore::global().delete("oauth2-prep-uid");
    }

    #[test]
    fn token_response_parsing() {
        let json = r#"{"access_token":"tok","refresh_token":"ref","expires_in":3600,"scope":"repo","token_type":"bearer"}"#;
        let resp: TokenResponse = serde_json::from_str(json).expect("parse");
        let context = handler().context_from(resp, None);
        assert_eq!(context.access_token, "tok");
        assert_eq!(context.refresh_token.as_deref(), Some("ref"));
        assert!(context.expires_at.is_some());
    }
}

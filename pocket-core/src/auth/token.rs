//! Static token handler for providers without an OAuth2 flow
//!
//! The user pastes a long-lived token into a form served by the callback
//! server; the submitted value resolves the flow's future directly.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

use super::context::AuthContext;
use super::handler::{AuthHandler, AuthenticateRequest};
use super::provider::AuthProvider;
use crate::config::PocketConfig;
use crate::error::{PocketError, Result};
use crate::futures::{FutureMetadata, FutureStore};

/// Handler that collects a user-supplied token instead of running OAuth2
pub struct StaticTokenHandler {
    name: String,
    provider: AuthProvider,
    provider_default: bool,
    pocket: Arc<PocketConfig>,
}

impl StaticTokenHandler {
    pub fn new(provider: AuthProvider, pocket: Arc<PocketConfig>) -> Self {
        Self {
            name: format!("{}-token", provider),
            provider,
            provider_default: false,
            pocket,
        }
    }

    /// Mark this handler as the one used when a tool names only the provider
    pub fn as_provider_default(mut self) -> Self {
        self.provider_default = true;
        self
    }
}

#[async_trait]
impl AuthHandler for StaticTokenHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider(&self) -> AuthProvider {
        self.provider
    }

    fn provider_default(&self) -> bool {
        self.provider_default
    }

    fn scoped(&self) -> bool {
        false
    }

    fn recommended_scopes(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }

    fn make_request(&self, _scopes: Vec<String>) -> AuthenticateRequest {
        AuthenticateRequest::default()
    }

    fn prepare(
        &self,
        _req: &AuthenticateRequest,
        thread_id: &str,
        profile: &str,
        future_uid: &str,
    ) -> Result<String> {
        FutureStore::global().create(
            future_uid,
            FutureMetadata {
                redirect_uri: None,
                thread_id: thread_id.to_string(),
                profile: profile.to_string(),
            },
        );

        let form_url = format!(
            "{}?state={}",
            self.pocket.callback_url("auth/token"),
            urlencoding::encode(future_uid)
        );
        debug!(handler = %self.name, %future_uid, "prepared token form url");
        Ok(form_url)
    }

    async fn authenticate(
        &self,
        _req: &AuthenticateRequest,
        future_uid: &str,
    ) -> Result<AuthContext> {
        let receiver = FutureStore::global().take_receiver(future_uid)?;
        let token = receiver
            .await
            .map_err(|_| PocketError::Future("token future dropped".to_string()))?;
        // Static tokens carry no expiry; sessions made here never refresh.
        Ok(AuthContext::new(self.provider, token))
    }

    async fn refresh(
        &self,
        _req: &AuthenticateRequest,
        _context: &AuthContext,
    ) -> Result<AuthContext> {
        Err(PocketError::RefreshFailure(
            "static token sessions cannot be refreshed".to_string(),
        ))
    }
}

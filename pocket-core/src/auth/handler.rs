//! Auth handler contract and the provider-to-handler registry
//!
//! One handler implements one authentication protocol for one provider.
//! Handlers are stateless strategy objects; everything per-flow travels in
//! the request, the future UID, and the stored session.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use super::context::AuthContext;
use super::provider::AuthProvider;
use crate::config::ClientCredentials;
use crate::error::{PocketError, Result};

/// Requested scopes plus client credentials for one authentication flow
#[derive(Debug, Clone, Default)]
pub struct AuthenticateRequest {
    /// Scopes the caller asks for; ordered for deterministic URL building
    pub scopes: BTreeSet<String>,

    /// Client credentials, unused by token-style handlers
    pub credentials: ClientCredentials,
}

impl AuthenticateRequest {
    pub fn new(scopes: impl IntoIterator<Item = String>) -> Self {
        Self {
            scopes: scopes.into_iter().collect(),
            credentials: ClientCredentials::default(),
        }
    }

    pub fn with_credentials(mut self, credentials: ClientCredentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Copy of this request carrying a widened scope set
    pub fn with_scopes(&self, scopes: BTreeSet<String>) -> Self {
        Self {
            scopes,
            credentials: self.credentials.clone(),
        }
    }
}

/// Strategy implementing one authentication protocol for one provider
#[async_trait]
pub trait AuthHandler: Send + Sync {
    /// Unique handler name, e.g. `github-oauth2`
    fn name(&self) -> &str;

    fn provider(&self) -> AuthProvider;

    /// Whether this handler is used when a tool names only the provider
    fn provider_default(&self) -> bool {
        false
    }

    /// Whether scope-subset checks apply to sessions made by this handler
    fn scoped(&self) -> bool;

    fn recommended_scopes(&self) -> BTreeSet<String>;

    /// Build the request this handler expects for the given scopes
    fn make_request(&self, scopes: Vec<String>) -> AuthenticateRequest;

    /// Register the flow's future and return the authorize URL for the user.
    fn prepare(
        &self,
        req: &AuthenticateRequest,
        thread_id: &str,
        profile: &str,
        future_uid: &str,
    ) -> Result<String>;

    /// Await the resolved future and exchange its value for credentials.
    /// Assumes `prepare` registered `future_uid` earlier.
    async fn authenticate(&self, req: &AuthenticateRequest, future_uid: &str)
        -> Result<AuthContext>;

    /// Re-authenticate an expired session from its stored context.
    async fn refresh(
        &self,
        req: &AuthenticateRequest,
        context: &AuthContext,
    ) -> Result<AuthContext>;
}

/// Registry mapping handler names and providers to handler instances
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn AuthHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn AuthHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    /// Look up by explicit name first, falling back to the provider's
    /// default handler.
    pub fn find(
        &self,
        name: Option<&str>,
        provider: Option<AuthProvider>,
    ) -> Result<Arc<dyn AuthHandler>> {
        if let Some(name) = name {
            return self
                .handlers
                .get(name)
                .cloned()
                .ok_or_else(|| PocketError::HandlerNotFound(name.to_string()));
        }
        if let Some(provider) = provider {
            for handler in self.handlers.values() {
                if handler.provider() == provider && handler.provider_default() {
                    return Ok(handler.clone());
                }
            }
            return Err(PocketError::HandlerNotFound(format!(
                "no default handler for provider {}",
                provider
            )));
        }
        Err(PocketError::HandlerNotFound(
            "neither handler name nor provider given".to_string(),
        ))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

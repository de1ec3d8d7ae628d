//! Auth session model and storage backends
//!
//! A session records one (provider, thread, profile) authentication. It is
//! either pending (waiting for the user, holding a future UID) or active
//! (holding credentials), never both.
//!
//! Storage implementations do not lock per key; the auth layer serializes
//! access to a given session key within one process.

mod memory;
mod redis;

pub use memory::InMemorySessionStorage;
pub use redis::RedisSessionStorage;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{AuthContext, AuthProvider};
use crate::config::SessionConfig;
use crate::error::Result;

/// Storage key for one (provider, thread, profile) triple.
/// The provider segment is uppercase, matching the credential env key style.
pub fn session_key(provider: AuthProvider, thread_id: &str, profile: &str) -> String {
    format!(
        "{}__{}__{}",
        provider.name().to_uppercase(),
        thread_id,
        profile
    )
}

/// One authentication session, pending or active
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub provider: AuthProvider,

    /// Name of the handler that owns this session
    pub handler_name: String,

    /// Conversation thread this session belongs to. Stored explicitly;
    /// thread ids may contain the key separator, so keys cannot be parsed
    /// back reliably.
    pub thread_id: String,

    pub profile: String,

    /// Whether the handler applies scope-subset checks
    pub scoped: bool,

    /// Scopes granted (active) or requested so far (pending)
    pub scopes: BTreeSet<String>,

    /// Credentials; present exactly when the session is active
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<AuthContext>,

    /// UID of the unresolved future; present exactly when pending
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolve_uid: Option<String>,
}

impl Session {
    /// New pending session waiting on `resolve_uid`
    pub fn pending(
        provider: AuthProvider,
        handler_name: impl Into<String>,
        scoped: bool,
        scopes: BTreeSet<String>,
        thread_id: impl Into<String>,
        profile: impl Into<String>,
        resolve_uid: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            handler_name: handler_name.into(),
            thread_id: thread_id.into(),
            profile: profile.into(),
            scoped,
            scopes,
            context: None,
            resolve_uid: Some(resolve_uid.into()),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.resolve_uid.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.context.is_some()
    }

    /// Convert a pending session into an active one
    pub fn activate(&mut self, context: AuthContext) {
        self.context = Some(context);
        self.resolve_uid = None;
    }

    /// Whether the token expires within `window` from now. Sessions without
    /// an expiry never report near-expiry.
    pub fn near_expiry(&self, window: Duration) -> bool {
        let Some(context) = &self.context else {
            return false;
        };
        let Some(expires_at) = context.expires_at else {
            return false;
        };
        let remaining = expires_at - Utc::now();
        remaining.num_seconds() < window.as_secs() as i64
    }

    /// Whether this active session satisfies a request made through
    /// `handler_name` for `scopes`. Non-scoped handlers match on name alone.
    pub fn allows(&self, handler_name: &str, scopes: &BTreeSet<String>) -> bool {
        if self.handler_name != handler_name {
            return false;
        }
        if !self.scoped {
            return true;
        }
        scopes.is_subset(&self.scopes)
    }
}

/// Backend-agnostic session persistence
#[async_trait]
pub trait SessionStorage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Session>>;

    async fn set(&self, key: &str, session: Session) -> Result<()>;

    /// Remove `key`; returns whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// All sessions whose key starts with `prefix` (empty prefix lists all)
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Session)>>;
}

/// Build the storage backend named by the configuration
pub fn build_storage(config: &SessionConfig) -> Result<Arc<dyn SessionStorage>> {
    match config {
        SessionConfig::Memory => Ok(Arc::new(InMemorySessionStorage::new())),
        SessionConfig::Redis { url } => Ok(Arc::new(RedisSessionStorage::new(url)?)),
    }
}

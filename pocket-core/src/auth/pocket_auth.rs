//! Authentication state machine over handlers, sessions, and futures
//!
//! [`PocketAuth`] decides, for one (provider, thread, profile) triple, what
//! has to happen before a tool can run: nothing, a token refresh, or a full
//! user round-trip through the callback server.
//!
//! Callers must serialize operations on the same session key; storage
//! backends do not lock per key.

use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::context::AuthContext;
use super::handler::{AuthHandler, HandlerRegistry};
use super::provider::AuthProvider;
use crate::config::PocketConfig;
use crate::error::{PocketError, Result};
use crate::futures::FutureStore;
use crate::session::{session_key, Session, SessionStorage};

/// What the auth layer has to do before a tool invocation can proceed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// No session exists; the user must be sent an authorize URL
    NoSession,

    /// A pending session exists and its future is still unresolved
    PendingResolve,

    /// The pending session's future has been resolved; token exchange can run
    Resolved,

    /// An active session exists but does not cover the requested scopes
    DoAuth,

    /// The active session's token expires soon and must be refreshed
    DoRefresh,

    /// The active session covers the request as-is
    SkipAuth,
}

impl std::fmt::Display for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuthState::NoSession => "no_session",
            AuthState::PendingResolve => "pending_resolve",
            AuthState::Resolved => "resolved",
            AuthState::DoAuth => "do_auth",
            AuthState::DoRefresh => "do_refresh",
            AuthState::SkipAuth => "skip_auth",
        };
        f.write_str(s)
    }
}

/// Snapshot of one stored session, for status listings
#[derive(Debug, Clone)]
pub struct SessionState {
    pub provider: AuthProvider,
    pub scopes: BTreeSet<String>,
    pub state: AuthState,
}

/// Identifies one authentication requirement as a tool declares it
#[derive(Debug, Clone, Default)]
pub struct AuthRequest {
    /// Explicit handler name; wins over `provider` when both are set
    pub handler_name: Option<String>,
    pub provider: Option<AuthProvider>,
    pub scopes: Vec<String>,
}

pub struct PocketAuth {
    config: Arc<PocketConfig>,
    registry: Arc<HandlerRegistry>,
    storage: Arc<dyn SessionStorage>,
}

impl PocketAuth {
    pub fn new(
        config: Arc<PocketConfig>,
        registry: Arc<HandlerRegistry>,
        storage: Arc<dyn SessionStorage>,
    ) -> Self {
        Self {
            config,
            registry,
            storage,
        }
    }

    fn handler(&self, request: &AuthRequest) -> Result<Arc<dyn AuthHandler>> {
        self.registry
            .find(request.handler_name.as_deref(), request.provider)
    }

    /// Requested scopes widened by the handler's recommended set
    fn requested_scopes(
        &self,
        handler: &Arc<dyn AuthHandler>,
        request: &AuthRequest,
    ) -> BTreeSet<String> {
        let mut scopes: BTreeSet<String> = request.scopes.iter().cloned().collect();
        if handler.scoped() {
            scopes.extend(handler.recommended_scopes());
        }
        scopes
    }

    /// Classify what the next step is for this request
    pub async fn check(
        &self,
        request: &AuthRequest,
        thread_id: &str,
        profile: &str,
    ) -> Result<AuthState> {
        let handler = self.handler(request)?;
        let key = session_key(handler.provider(), thread_id, profile);
        let Some(session) = self.storage.get(&key).await? else {
            return Ok(AuthState::NoSession);
        };

        if let Some(uid) = &session.resolve_uid {
            return match FutureStore::global().is_done(uid) {
                Some(true) => Ok(AuthState::Resolved),
                Some(false) => Ok(AuthState::PendingResolve),
                // The future vanished (process restart); the pending session
                // is stale and the flow has to start over.
                None => {
                    self.storage.delete(&key).await?;
                    Ok(AuthState::NoSession)
                }
            };
        }

        let scopes = self.requested_scopes(&handler, request);
        if !session.allows(handler.name(), &scopes) {
            return Ok(AuthState::DoAuth);
        }
        if session.near_expiry(self.config.refresh_window) {
            return Ok(AuthState::DoRefresh);
        }
        Ok(AuthState::SkipAuth)
    }

    /// Start or restate a user-facing flow. Returns the URL the user has to
    /// visit, or `None` when no user action is needed.
    ///
    /// Calling this again while a flow is pending reuses the original future
    /// UID and widens the pending scope set, so the returned URL always
    /// covers everything requested so far.
    pub async fn prepare(
        &self,
        request: &AuthRequest,
        thread_id: &str,
        profile: &str,
    ) -> Result<Option<String>> {
        let handler = self.handler(request)?;
        let key = session_key(handler.provider(), thread_id, profile);
        let state = self.check(request, thread_id, profile).await?;

        match state {
            AuthState::SkipAuth | AuthState::DoRefresh | AuthState::Resolved => Ok(None),
            AuthState::PendingResolve => {
                let mut session = self
                    .storage
                    .get(&key)
                    .await?
                    .ok_or_else(|| PocketError::SessionNotFound(key.clone()))?;
                let uid = session
                    .resolve_uid
                    .clone()
                    .ok_or_else(|| PocketError::AuthState("pending session lost its uid".into()))?;

                session.scopes.extend(self.requested_scopes(&handler, request));
                let req = handler.make_request(session.scopes.iter().cloned().collect());
                let url = handler.prepare(&req, thread_id, profile, &uid)?;
                self.storage.set(&key, session).await?;
                debug!(%key, %uid, "restated pending auth flow");
                Ok(Some(url))
            }
            AuthState::NoSession | AuthState::DoAuth => {
                let mut scopes = self.requested_scopes(&handler, request);
                // Re-auth over an insufficient active session keeps its grants.
                if let Some(existing) = self.storage.get(&key).await? {
                    scopes.extend(existing.scopes);
                }

                let uid = Uuid::new_v4().to_string();
                let req = handler.make_request(scopes.iter().cloned().collect());
                let url = handler.prepare(&req, thread_id, profile, &uid)?;

                let session = Session::pending(
                    handler.provider(),
                    handler.name(),
                    handler.scoped(),
                    scopes,
                    thread_id,
                    profile,
                    &uid,
                );
                self.storage.set(&key, session).await?;
                self.spawn_watchdog(key.clone(), uid.clone());

                info!(%key, %uid, handler = handler.name(), "prepared auth flow");
                Ok(Some(url))
            }
        }
    }

    /// Drive the request to an active session and return its credentials.
    /// `prepare` must have run first when a user round-trip is required.
    pub async fn authenticate(
        &self,
        request: &AuthRequest,
        thread_id: &str,
        profile: &str,
    ) -> Result<AuthContext> {
        let handler = self.handler(request)?;
        let key = session_key(handler.provider(), thread_id, profile);
        let state = self.check(request, thread_id, profile).await?;

        match state {
            AuthState::SkipAuth => {
                let session = self
                    .storage
                    .get(&key)
                    .await?
                    .ok_or_else(|| PocketError::SessionNotFound(key.clone()))?;
                session
                    .context
                    .ok_or_else(|| PocketError::AuthState("active session missing context".into()))
            }
            AuthState::DoRefresh => self.refresh(&handler, request, &key).await,
            AuthState::PendingResolve | AuthState::Resolved => {
                let mut session = self
                    .storage
                    .get(&key)
                    .await?
                    .ok_or_else(|| PocketError::SessionNotFound(key.clone()))?;
                let uid = session
                    .resolve_uid
                    .clone()
                    .ok_or_else(|| PocketError::AuthState("pending session lost its uid".into()))?;

                let req = handler.make_request(session.scopes.iter().cloned().collect());
                let exchanged =
                    timeout(self.config.auth_timeout, handler.authenticate(&req, &uid)).await;

                let context = match exchanged {
                    Ok(Ok(context)) => context,
                    Ok(Err(err)) => {
                        self.storage.delete(&key).await?;
                        FutureStore::global().delete(&uid);
                        return Err(err);
                    }
                    Err(_) => {
                        warn!(%key, %uid, "authentication wait timed out");
                        self.storage.delete(&key).await?;
                        FutureStore::global().delete(&uid);
                        return Err(PocketError::AuthTimeout);
                    }
                };

                session.activate(context.clone());
                self.storage.set(&key, session).await?;
                FutureStore::global().delete(&uid);
                info!(%key, "authentication completed");
                Ok(context)
            }
            AuthState::NoSession | AuthState::DoAuth => Err(PocketError::AuthState(format!(
                "state is {}, call prepare first",
                state
            ))),
        }
    }

    async fn refresh(
        &self,
        handler: &Arc<dyn AuthHandler>,
        request: &AuthRequest,
        key: &str,
    ) -> Result<AuthContext> {
        let mut session = self
            .storage
            .get(key)
            .await?
            .ok_or_else(|| PocketError::SessionNotFound(key.to_string()))?;
        let context = session
            .context
            .clone()
            .ok_or_else(|| PocketError::AuthState("refresh on a pending session".into()))?;

        let req = handler.make_request(session.scopes.iter().cloned().collect());
        let refreshed = timeout(self.config.auth_timeout, handler.refresh(&req, &context)).await;

        match refreshed {
            Ok(Ok(context)) => {
                session.activate(context.clone());
                self.storage.set(key, session).await?;
                info!(%key, "session refreshed");
                Ok(context)
            }
            Ok(Err(err)) => {
                warn!(%key, %err, "refresh failed, removing session");
                self.storage.delete(key).await?;
                Err(PocketError::RefreshFailure(err.to_string()))
            }
            Err(_) => {
                self.storage.delete(key).await?;
                Err(PocketError::RefreshFailure("refresh timed out".to_string()))
            }
        }
    }

    /// Stored credentials for a (provider, thread, profile), if the session
    /// is active
    pub async fn current_context(
        &self,
        provider: AuthProvider,
        thread_id: &str,
        profile: &str,
    ) -> Result<Option<AuthContext>> {
        let key = session_key(provider, thread_id, profile);
        Ok(self.storage.get(&key).await?.and_then(|s| s.context))
    }

    /// All stored sessions for `thread_id`, optionally narrowed to one
    /// provider
    pub async fn session_states(
        &self,
        thread_id: &str,
        provider: Option<AuthProvider>,
    ) -> Result<Vec<SessionState>> {
        let prefix = provider
            .map(|p| format!("{}__", p.name().to_uppercase()))
            .unwrap_or_default();
        let sessions = self.storage.list(&prefix).await?;
        let mut states = Vec::new();
        for (_, session) in sessions {
            if session.thread_id != thread_id {
                continue;
            }
            let state = if let Some(uid) = &session.resolve_uid {
                match FutureStore::global().is_done(uid) {
                    Some(true) => AuthState::Resolved,
                    _ => AuthState::PendingResolve,
                }
            } else if session.near_expiry(self.config.refresh_window) {
                AuthState::DoRefresh
            } else {
                AuthState::SkipAuth
            };
            states.push(SessionState {
                provider: session.provider,
                scopes: session.scopes.clone(),
                state,
            });
        }
        Ok(states)
    }

    /// Remove one session and its pending future, if any
    pub async fn delete_session(
        &self,
        provider: AuthProvider,
        thread_id: &str,
        profile: &str,
    ) -> Result<bool> {
        let key = session_key(provider, thread_id, profile);
        if let Some(session) = self.storage.get(&key).await? {
            if let Some(uid) = &session.resolve_uid {
                FutureStore::global().delete(uid);
            }
        }
        self.storage.delete(&key).await
    }

    /// Background task that garbage-collects a pending session whose user
    /// never came back.
    fn spawn_watchdog(&self, key: String, uid: String) {
        let storage = self.storage.clone();
        let deadline = self.config.auth_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            if FutureStore::global().is_done(&uid) == Some(false) {
                warn!(%key, %uid, "pending auth expired, removing session");
                FutureStore::global().delete(&uid);
                let _ = storage.delete(&key).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::handler::AuthenticateRequest;
    use crate::session::InMemorySessionStorage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockHandler {
        exchanges: AtomicUsize,
    }

    impl MockHandler {
        fn new() -> Self {
            Self {
                exchanges: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl AuthHandler for MockHandler {
        fn name(&self) -> &str {
            "github-mock"
        }

        fn provider(&self) -> AuthProvider {
            AuthProvider::Github
        }

        fn provider_default(&self) -> bool {
            true
        }

        fn scoped(&self) -> bool {
            true
        }

        fn recommended_scopes(&self) -> BTreeSet<String> {
            ["repo".to_string()].into_iter().collect()
        }

        fn make_request(&self, scopes: Vec<String>) -> AuthenticateRequest {
            AuthenticateRequest::new(scopes)
        }

        fn prepare(
            &self,
            req: &AuthenticateRequest,
            thread_id: &str,
            profile: &str,
            future_uid: &str,
        ) -> Result<String> {
            FutureStore::global().create(
                future_uid,
                crate::futures::FutureMetadata {
                    redirect_uri: None,
                    thread_id: thread_id.to_string(),
                    profile: profile.to_string(),
                },
            );
            let scopes: Vec<_> = req.scopes.iter().cloned().collect();
            Ok(format!(
                "mock://authorize?scope={}&state={}",
                scopes.join(","),
                future_uid
            ))
        }

        async fn authenticate(
            &self,
            _req: &AuthenticateRequest,
            future_uid: &str,
        ) -> Result<AuthContext> {
            let rx = FutureStore::global().take_receiver(future_uid)?;
            let code = rx
                .await
                .map_err(|_| PocketError::Future("dropped".to_string()))?;
            self.exchanges.fetch_add(1, Ordering::SeqCst);
            Ok(AuthContext::new(AuthProvider::Github, format!("tok-{}", code)))
        }

        async fn refresh(
            &self,
            _req: &AuthenticateRequest,
            _context: &AuthContext,
        ) -> Result<AuthContext> {
            Ok(AuthContext::new(AuthProvider::Github, "refreshed"))
        }
    }

    fn auth_with_handler() -> (PocketAuth, Arc<MockHandler>) {
        let handler = Arc::new(MockHandler::new());
        let mut registry = HandlerRegistry::new();
        registry.register(handler.clone());
        let auth = PocketAuth::new(
            Arc::new(PocketConfig::default()),
            Arc::new(registry),
            Arc::new(InMemorySessionStorage::new()),
        );
        (auth, handler)
    }

    fn auth() -> PocketAuth {
        auth_with_handler().0
    }

    fn request(scopes: &[&str]) -> AuthRequest {
        AuthRequest {
            handler_name: None,
            provider: Some(AuthProvider::Github),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn full_flow_reaches_skip_auth() {
        let (auth, handler) = auth_with_handler();
        let req = request(&["repo"]);
        let thread = "flow-thread";

        assert_eq!(
            auth.check(&req, thread, "default").await.unwrap(),
            AuthState::NoSession
        );

        let url = auth
            .prepare(&req, thread, "default")
            .await
            .unwrap()
            .expect("url");
        let uid = url.rsplit("state=").next().unwrap().to_string();
        assert_eq!(
            auth.check(&req, thread, "default").await.unwrap(),
            AuthState::PendingResolve
        );

        FutureStore::global().resolve(&uid, "code-1".to_string()).unwrap();
        assert_eq!(
            auth.check(&req, thread, "default").await.unwrap(),
            AuthState::Resolved
        );

        let context = auth.authenticate(&req, thread, "default").await.unwrap();
        assert_eq!(context.access_token, "tok-code-1");
        assert_eq!(
            auth.check(&req, thread, "default").await.unwrap(),
            AuthState::SkipAuth
        );
        // The consumed future is gone.
        assert!(!FutureStore::global().contains(&uid));

        // A second authenticate rides the stored session: no new exchange.
        let again = auth.authenticate(&req, thread, "default").await.unwrap();
        assert_eq!(again.access_token, "tok-code-1");
        assert_eq!(handler.exchanges.load(Ordering::SeqCst), 1);

        let context = auth
            .current_context(AuthProvider::Github, thread, "default")
            .await
            .unwrap()
            .expect("active context");
        assert_eq!(context.access_token, "tok-code-1");

        let states = auth.session_states(thread, None).await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].state, AuthState::SkipAuth);
        assert!(states[0].scopes.contains("repo"));
    }

    #[tokio::test]
    async fn repeated_prepare_reuses_uid_and_widens_scopes() {
        let auth = auth();
        let thread = "widen-thread";

        let url1 = auth
            .prepare(&request(&["repo"]), thread, "default")
            .await
            .unwrap()
            .expect("url");
        let uid1 = url1.rsplit("state=").next().unwrap().to_string();

        let url2 = auth
            .prepare(&request(&["user"]), thread, "default")
            .await
            .unwrap()
            .expect("url");
        let uid2 = url2.rsplit("state=").next().unwrap().to_string();

        assert_eq!(uid1, uid2);
        assert!(url2.contains("repo"));
        assert!(url2.contains("user"));
    }

    #[tokio::test]
    async fn authenticate_without_prepare_is_an_error() {
        let auth = auth();
        let err = auth
            .authenticate(&request(&["repo"]), "cold-thread", "default")
            .await
            .unwrap_err();
        assert!(matches!(err, PocketError::AuthState(_)));
    }

    #[tokio::test]
    async fn insufficient_scopes_require_new_auth() {
        let auth = auth();
        let thread = "scope-thread";
        let narrow = request(&["repo"]);

        let url = auth.prepare(&narrow, thread, "default").await.unwrap().unwrap();
        let uid = url.rsplit("state=").next().unwrap().to_string();
        FutureStore::global().resolve(&uid, "c".to_string()).unwrap();
        auth.authenticate(&narrow, thread, "default").await.unwrap();

        let wide = request(&["repo", "admin"]);
        assert_eq!(
            auth.check(&wide, thread, "default").await.unwrap(),
            AuthState::DoAuth
        );
        // The narrower request still rides the existing session.
        assert_eq!(
            auth.check(&narrow, thread, "default").await.unwrap(),
            AuthState::SkipAuth
        );
    }

    #[tokio::test]
    async fn session_states_does_not_match_thread_prefixes() {
        let auth = auth();
        let req = request(&["repo"]);

        // Thread ids sharing a prefix (one containing the key separator)
        // must stay distinct in listings.
        auth.prepare(&req, "team", "default").await.unwrap();
        auth.prepare(&req, "team__alpha", "default").await.unwrap();

        let states = auth.session_states("team", None).await.unwrap();
        assert_eq!(states.len(), 1);
        let states = auth.session_states("team__alpha", None).await.unwrap();
        assert_eq!(states.len(), 1);
    }

    #[tokio::test]
    async fn refresh_window_is_independent_of_auth_timeout() {
        use std::time::Duration;

        let storage = Arc::new(InMemorySessionStorage::new());
        let mut config = PocketConfig::default();
        config.auth_timeout = Duration::from_secs(1);
        config.refresh_window = Duration::from_secs(300);

        let mut session = Session::pending(
            AuthProvider::Github,
            "github-mock",
            true,
            ["repo".to_string()].into_iter().collect(),
            "exp-thread",
            "default",
            "exp-uid",
        );
        session.activate(
            AuthContext::new(AuthProvider::Github, "tok")
                .with_expires_at(chrono::Utc::now() + chrono::Duration::seconds(60)),
        );
        storage
            .set(
                &session_key(AuthProvider::Github, "exp-thread", "default"),
                session,
            )
            .await
            .unwrap();

        let registry = {
            let mut r = HandlerRegistry::new();
            r.register(Arc::new(MockHandler::new()));
            Arc::new(r)
        };

        // 60s of validity left falls inside the 300s refresh window even
        // though the interaction timeout is 1s.
        let auth = PocketAuth::new(Arc::new(config.clone()), registry.clone(), storage.clone());
        assert_eq!(
            auth.check(&request(&["repo"]), "exp-thread", "default")
                .await
                .unwrap(),
            AuthState::DoRefresh
        );

        // Shrinking the window alone flips the state back to skip.
        config.refresh_window = Duration::ZERO;
        let auth = PocketAuth::new(Arc::new(config), registry, storage);
        assert_eq!(
            auth.check(&request(&["repo"]), "exp-thread", "default")
                .await
                .unwrap(),
            AuthState::SkipAuth
        );
    }

    #[tokio::test]
    async fn delete_session_removes_pending_future() {
        let auth = auth();
        let thread = "delete-thread";
        let req = request(&["repo"]);

        let url = auth.prepare(&req, thread, "default").await.unwrap().unwrap();
        let uid = url.rsplit("state=").next().unwrap().to_string();

        assert!(auth
            .delete_session(AuthProvider::Github, thread, "default")
            .await
            .unwrap());
        assert!(!FutureStore::global().contains(&uid));
        assert_eq!(
            auth.check(&req, thread, "default").await.unwrap(),
            AuthState::NoSession
        );
    }
}

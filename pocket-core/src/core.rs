//! Orchestration: package sync, tool registration, auth, and invocation

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::auth::{default_handler_registry, AuthRequest, AuthState, HandlerRegistry, PocketAuth};
use crate::config::{pocket_root, PocketConfig};
use crate::error::{PocketError, Result};
use crate::repository::{GitClient, Lockfile};
use crate::runtime::ToolRuntime;
use crate::server::ServerHandle;
use crate::session::build_storage;
use crate::tool::{Tool, ToolRequest};

/// Returned in place of output when a tool invocation exceeds its budget
pub const TIMEOUT_SENTINEL: &str = "timeout tool call";

/// Fully wired tool-calling core: synced packages, registered tools, auth,
/// and the callback server handle that keeps redirects working.
pub struct PocketCore {
    config: Arc<PocketConfig>,
    auth: PocketAuth,
    tools: HashMap<String, Tool>,
    runtime: ToolRuntime,
    _server: ServerHandle,
}

pub struct PocketCoreBuilder {
    config: Option<Arc<PocketConfig>>,
    registry: Option<HandlerRegistry>,
    requests: Vec<ToolRequest>,
    lockfile_path: Option<PathBuf>,
    interactive: bool,
}

impl PocketCoreBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            registry: None,
            requests: Vec::new(),
            lockfile_path: None,
            interactive: false,
        }
    }

    pub fn with_config(mut self, config: PocketConfig) -> Self {
        self.config = Some(Arc::new(config));
        self
    }

    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_tool(mut self, request: ToolRequest) -> Self {
        self.requests.push(request);
        self
    }

    pub fn with_tools(mut self, requests: impl IntoIterator<Item = ToolRequest>) -> Self {
        self.requests.extend(requests);
        self
    }

    pub fn with_lockfile_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.lockfile_path = Some(path.into());
        self
    }

    /// Ask on stdin for tool variables that have no other value
    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self
    }

    pub async fn build(self) -> Result<PocketCore> {
        let config = match self.config {
            Some(config) => config,
            None => Arc::new(PocketConfig::load()?),
        };
        let registry = Arc::new(
            self.registry
                .unwrap_or_else(|| default_handler_registry(&config)),
        );
        let storage = build_storage(&config.session)?;
        let auth = PocketAuth::new(config.clone(), registry, storage);

        let lockfile_path = self
            .lockfile_path
            .unwrap_or_else(|| pocket_root().join("pocket.lock"));
        let mut lockfile = Lockfile::load(&lockfile_path).await?;
        for request in &self.requests {
            lockfile.add(request.lock.clone());
        }

        let git = GitClient::new();
        lockfile.sync_all(&git, &config.toolpkg_path, false).await?;
        lockfile.save().await?;

        let mut tools = HashMap::new();
        for request in &self.requests {
            // The lockfile carries the resolved SHA; the request may not.
            let lock = lockfile
                .get(&request.lock.key())
                .cloned()
                .unwrap_or_else(|| request.lock.clone());
            let mut dir = lock.toolpkg_path(&config.toolpkg_path);
            if !request.subpath.is_empty() {
                dir = dir.join(&request.subpath);
            }

            let tool = Tool::load(&dir, request, &config.tool_vars, self.interactive).await?;
            if tools.contains_key(&tool.name) {
                return Err(PocketError::Manifest(format!(
                    "duplicate tool name: {}",
                    tool.name
                )));
            }
            info!(tool = %tool.name, dir = %dir.display(), "registered tool");
            tools.insert(tool.name.clone(), tool);
        }

        let server_config = config.clone();
        let server = tokio::task::spawn_blocking(move || ServerHandle::acquire(server_config))
            .await
            .map_err(|e| PocketError::ServerInit(e.to_string()))??;

        Ok(PocketCore {
            config,
            auth,
            tools,
            runtime: ToolRuntime::new(),
            _server: server,
        })
    }
}

impl Default for PocketCoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PocketCore {
    pub fn builder() -> PocketCoreBuilder {
        PocketCoreBuilder::new()
    }

    pub fn config(&self) -> &Arc<PocketConfig> {
        &self.config
    }

    pub fn auth(&self) -> &PocketAuth {
        &self.auth
    }

    pub fn tools(&self) -> impl Iterator<Item = &Tool> {
        self.tools.values()
    }

    pub fn tool(&self, name: &str) -> Result<&Tool> {
        self.tools
            .get(name)
            .ok_or_else(|| PocketError::ToolNotFound(name.to_string()))
    }

    fn auth_request(tool: &Tool) -> Option<AuthRequest> {
        tool.auth.as_ref().map(|auth| AuthRequest {
            handler_name: auth.handler_name.clone(),
            provider: auth.provider,
            scopes: auth.scopes.clone(),
        })
    }

    /// Current auth state for one tool
    pub async fn check_tool_auth(
        &self,
        name: &str,
        thread_id: &str,
        profile: &str,
    ) -> Result<AuthState> {
        let tool = self.tool(name)?;
        match Self::auth_request(tool) {
            Some(request) => self.auth.check(&request, thread_id, profile).await,
            None => Ok(AuthState::SkipAuth),
        }
    }

    /// Start the auth flow for one tool; `None` when no user action is needed
    pub async fn prepare_tool_auth(
        &self,
        name: &str,
        thread_id: &str,
        profile: &str,
    ) -> Result<Option<String>> {
        let tool = self.tool(name)?;
        match Self::auth_request(tool) {
            Some(request) => self.auth.prepare(&request, thread_id, profile).await,
            None => Ok(None),
        }
    }

    /// Start one auth flow covering a caller-chosen batch of tools.
    ///
    /// The named tools must agree on handler and provider; their scopes are
    /// unioned into a single request. Returns the URL the user has to
    /// visit, or `None` when none of the tools needs user action.
    pub async fn prepare_auth(
        &self,
        tool_names: &[&str],
        thread_id: &str,
        profile: &str,
    ) -> Result<Option<String>> {
        let mut merged: Option<AuthRequest> = None;
        for name in tool_names {
            let tool = self.tool(name)?;
            let Some(request) = Self::auth_request(tool) else {
                continue;
            };
            match &mut merged {
                Some(existing) => {
                    if existing.handler_name != request.handler_name
                        || existing.provider != request.provider
                    {
                        return Err(PocketError::Configuration(format!(
                            "tool `{}` disagrees with the batch on the auth handler",
                            name
                        )));
                    }
                    existing.scopes.extend(request.scopes);
                }
                None => merged = Some(request),
            }
        }
        match merged {
            Some(request) => self.auth.prepare(&request, thread_id, profile).await,
            None => Ok(None),
        }
    }

    /// Credential environment for one tool; empty when it declares no auth
    pub async fn authenticate_tool(
        &self,
        name: &str,
        thread_id: &str,
        profile: &str,
    ) -> Result<HashMap<String, String>> {
        let tool = self.tool(name)?;
        match Self::auth_request(tool) {
            Some(request) => {
                let context = self.auth.authenticate(&request, thread_id, profile).await?;
                Ok(context.to_env())
            }
            None => Ok(HashMap::new()),
        }
    }

    /// Registered tool names grouped by the auth provider they require
    pub fn tools_by_provider(&self) -> HashMap<Option<crate::auth::AuthProvider>, Vec<String>> {
        let mut groups: HashMap<Option<crate::auth::AuthProvider>, Vec<String>> = HashMap::new();
        for tool in self.tools.values() {
            let provider = tool.auth.as_ref().and_then(|a| a.provider);
            groups.entry(provider).or_default().push(tool.name.clone());
        }
        for names in groups.values_mut() {
            names.sort();
        }
        groups
    }

    /// Execute a tool. Credentials are resolved first when the tool declares
    /// auth; the invocation itself runs under the configured budget.
    ///
    /// A timed-out invocation and a failed postprocessor both produce a
    /// descriptive string rather than an error, so the calling model sees
    /// what went wrong and can react.
    pub async fn tool_call(
        &self,
        name: &str,
        body: &str,
        thread_id: &str,
        profile: &str,
    ) -> Result<String> {
        let tool = self.tool(name)?;
        let envs = self.authenticate_tool(name, thread_id, profile).await?;

        let invoked = timeout(
            self.config.tool_call_timeout,
            self.runtime.invoke(tool, body, &envs),
        )
        .await;
        let mut output = match invoked {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                warn!(tool = %name, "tool invocation timed out");
                return Ok(TIMEOUT_SENTINEL.to_string());
            }
        };

        for postprocessor in &tool.postprocessors {
            match postprocessor.apply(output) {
                Ok(next) => output = next,
                Err(e) => {
                    let failure = PocketError::Postprocess {
                        name: postprocessor.name.clone(),
                        reason: e.to_string(),
                    };
                    warn!(tool = %name, %failure, "postprocessor failed");
                    return Ok(failure.to_string());
                }
            }
        }
        Ok(output)
    }

    /// Distinct auth requirements across all registered tools, keyed by
    /// handler name or provider. Tools naming the same provider must agree
    /// on the handler.
    fn grouped_auth_requests(&self) -> Result<Vec<(String, AuthRequest)>> {
        let mut groups: HashMap<String, AuthRequest> = HashMap::new();
        for tool in self.tools.values() {
            let Some(request) = Self::auth_request(tool) else {
                continue;
            };
            let group_key = match (&request.handler_name, request.provider) {
                (Some(name), _) => name.clone(),
                (None, Some(provider)) => provider.name().to_string(),
                (None, None) => continue,
            };
            match groups.get_mut(&group_key) {
                Some(existing) => {
                    if existing.handler_name != request.handler_name
                        || existing.provider != request.provider
                    {
                        return Err(PocketError::Configuration(format!(
                            "tools disagree on the auth handler for `{}`",
                            group_key
                        )));
                    }
                    existing.scopes.extend(request.scopes);
                }
                None => {
                    groups.insert(group_key, request);
                }
            }
        }
        let mut requests: Vec<(String, AuthRequest)> = groups.into_iter().collect();
        requests.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(requests)
    }

    /// Prepare every outstanding auth flow for `thread_id`, returning the
    /// URLs the user must visit keyed by handler/provider group.
    pub async fn initialize_tool_auth(
        &self,
        thread_id: &str,
        profile: &str,
    ) -> Result<HashMap<String, String>> {
        let mut urls = HashMap::new();
        for (group, request) in self.grouped_auth_requests()? {
            if let Some(url) = self.auth.prepare(&request, thread_id, profile).await? {
                urls.insert(group, url);
            }
        }
        Ok(urls)
    }

    /// Wait until every prepared flow for `thread_id` has completed
    pub async fn wait_tool_auth(&self, thread_id: &str, profile: &str) -> Result<()> {
        for (_, request) in self.grouped_auth_requests()? {
            let state = self.auth.check(&request, thread_id, profile).await?;
            if matches!(state, AuthState::PendingResolve | AuthState::Resolved) {
                self.auth.authenticate(&request, thread_id, profile).await?;
            }
        }
        Ok(())
    }
}

/// Convenience facade over [`PocketCore`] with a default thread and profile
pub struct Pocket {
    core: PocketCore,
}

pub const DEFAULT_THREAD: &str = "default";
pub const DEFAULT_PROFILE: &str = "default";

impl Pocket {
    /// Build a pocket with configuration from `pocket.toml`/environment and
    /// the shipped auth handlers.
    pub async fn new(requests: impl IntoIterator<Item = ToolRequest>) -> Result<Self> {
        let core = PocketCore::builder().with_tools(requests).build().await?;
        Ok(Self { core })
    }

    pub fn from_core(core: PocketCore) -> Self {
        Self { core }
    }

    pub fn core(&self) -> &PocketCore {
        &self.core
    }

    pub fn tools(&self) -> impl Iterator<Item = &Tool> {
        self.core.tools()
    }

    /// Invoke a tool on the default thread and profile
    pub async fn invoke(&self, name: &str, body: &str) -> Result<String> {
        self.core
            .tool_call(name, body, DEFAULT_THREAD, DEFAULT_PROFILE)
            .await
    }

    /// Invoke a tool for an explicit conversation thread and profile.
    ///
    /// When the tool still needs the user to authenticate, this does not
    /// block: it prepares the flow and returns the authorize-URL message
    /// with `paused = true`, so the caller can surface the URL and retry
    /// after [`wait_tool_auth`](Self::wait_tool_auth).
    pub async fn invoke_with_state(
        &self,
        name: &str,
        body: &str,
        thread_id: &str,
        profile: &str,
    ) -> Result<(String, bool)> {
        let state = self.core.check_tool_auth(name, thread_id, profile).await?;
        if matches!(
            state,
            AuthState::NoSession | AuthState::DoAuth | AuthState::PendingResolve
        ) {
            let url = self
                .core
                .prepare_tool_auth(name, thread_id, profile)
                .await?
                .unwrap_or_default();
            return Ok((
                format!("User needs to authenticate using the following URL: {}", url),
                true,
            ));
        }
        let output = self.core.tool_call(name, body, thread_id, profile).await?;
        Ok((output, false))
    }

    pub async fn initialize_tool_auth(&self) -> Result<std::collections::HashMap<String, String>> {
        self.core
            .initialize_tool_auth(DEFAULT_THREAD, DEFAULT_PROFILE)
            .await
    }

    pub async fn wait_tool_auth(&self) -> Result<()> {
        self.core.wait_tool_auth(DEFAULT_THREAD, DEFAULT_PROFILE).await
    }
}

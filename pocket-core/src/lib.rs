//! # Pocket - Tool Calling Core for LLM Agents
//!
//! Pocket turns tool packages (local directories or git repositories) into
//! invocable tools for an agent, handling everything around the call:
//! - Package sync pinned through a lockfile
//! - Per-tool authentication with OAuth2 or static tokens
//! - Session storage (in-memory or Redis) keyed by provider, thread, profile
//! - A shared callback server with a local HTTPS proxy for OAuth redirects
//! - Sandboxed execution in subprocesses or throwaway containers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pocket_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let pocket = Pocket::new([
//!         ToolRequest::new(Lock::git("https://github.com/org/tools", "main"))
//!             .with_subpath("slack/send-message"),
//!     ])
//!     .await?;
//!
//!     // Returns authorize URLs for any tool that still needs auth.
//!     let urls = pocket.initialize_tool_auth().await?;
//!     for (provider, url) in &urls {
//!         println!("{}: visit {}", provider, url);
//!     }
//!     pocket.wait_tool_auth().await?;
//!
//!     let output = pocket
//!         .invoke("send_message", r##"{"channel":"#general","text":"hi"}"##)
//!         .await?;
//!     println!("{}", output);
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod config;
pub mod core;
pub mod error;
pub mod futures;
pub mod repository;
pub mod runtime;
pub mod server;
pub mod session;
pub mod tool;

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::auth::{
        default_handler_registry, AuthContext, AuthHandler, AuthProvider, AuthRequest, AuthState,
        AuthenticateRequest, HandlerRegistry, OAuth2Config, OAuth2Handler, PocketAuth,
        SessionState, StaticTokenHandler,
    };
    pub use crate::config::{ClientCredentials, PocketConfig, SessionConfig};
    pub use crate::core::{Pocket, PocketCore, PocketCoreBuilder, TIMEOUT_SENTINEL};
    pub use crate::error::{PocketError, Result};
    pub use crate::futures::{FutureMetadata, FutureStore};
    pub use crate::repository::{GitClient, Lock, Lockfile};
    pub use crate::runtime::{ContainerRuntime, RuntimeSpec, ToolRuntime};
    pub use crate::server::ServerHandle;
    pub use crate::session::{
        build_storage, session_key, InMemorySessionStorage, RedisSessionStorage, Session,
        SessionStorage,
    };
    pub use crate::tool::{Postprocessor, Tool, ToolAuth, ToolManifest, ToolRequest};
}

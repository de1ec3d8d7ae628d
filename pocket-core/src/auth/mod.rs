//! Authentication: providers, handlers, and the session state machine

mod context;
mod handler;
mod oauth2;
mod pocket_auth;
mod provider;
mod token;

pub use context::AuthContext;
pub use handler::{AuthHandler, AuthenticateRequest, HandlerRegistry};
pub use oauth2::{OAuth2Config, OAuth2Handler};
pub use pocket_auth::{AuthRequest, AuthState, PocketAuth, SessionState};
pub use provider::AuthProvider;
pub use token::StaticTokenHandler;

use std::sync::Arc;

use crate::config::PocketConfig;

/// OAuth2 endpoints for the providers pocket knows out of the box
const OAUTH2_ENDPOINTS: &[(AuthProvider, &str, &str, char)] = &[
    (
        AuthProvider::Github,
        "https://github.com/login/oauth/authorize",
        "https://github.com/login/oauth/access_token",
        ',',
    ),
    (
        AuthProvider::Google,
        "https://accounts.google.com/o/oauth2/v2/auth",
        "https://oauth2.googleapis.com/token",
        ' ',
    ),
    (
        AuthProvider::Slack,
        "https://slack.com/oauth/v2/authorize",
        "https://slack.com/api/oauth.v2.access",
        ',',
    ),
    (
        AuthProvider::Linear,
        "https://linear.app/oauth/authorize",
        "https://api.linear.app/oauth/token",
        ',',
    ),
    (
        AuthProvider::Notion,
        "https://api.notion.com/v1/oauth/authorize",
        "https://api.notion.com/v1/oauth/token",
        ' ',
    ),
    (
        AuthProvider::Calendly,
        "https://auth.calendly.com/oauth/authorize",
        "https://auth.calendly.com/oauth/token",
        ' ',
    ),
    (
        AuthProvider::Reddit,
        "https://www.reddit.com/api/v1/authorize",
        "https://www.reddit.com/api/v1/access_token",
        ' ',
    ),
    (
        AuthProvider::X,
        "https://twitter.com/i/oauth2/authorize",
        "https://api.twitter.com/2/oauth2/token",
        ' ',
    ),
];

/// Registry with the shipped handlers.
///
/// Providers with client credentials in the configuration get an OAuth2
/// handler as their default plus a static-token fallback; everything else
/// gets the static-token handler as its default.
pub fn default_handler_registry(config: &Arc<PocketConfig>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();

    for (provider, auth_url, token_url, delimiter) in OAUTH2_ENDPOINTS {
        if let Some(credentials) = config.auth.get(provider.name()) {
            let oauth2 = OAuth2Config::new(*provider, *auth_url, *token_url, credentials.clone())
                .with_scope_delimiter(*delimiter);
            registry.register(Arc::new(OAuth2Handler::new(oauth2, config.clone())));
            registry.register(Arc::new(StaticTokenHandler::new(*provider, config.clone())));
        } else {
            registry.register(Arc::new(
                StaticTokenHandler::new(*provider, config.clone()).as_provider_default(),
            ));
        }
    }

    for provider in [
        AuthProvider::Gumloop,
        AuthProvider::Serpapi,
        AuthProvider::ApiToken,
    ] {
        registry.register(Arc::new(
            StaticTokenHandler::new(provider, config.clone()).as_provider_default(),
        ));
    }

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientCredentials;

    #[test]
    fn credentials_pick_the_oauth2_default() {
        let mut config = PocketConfig::default();
        config.auth.insert(
            "github".to_string(),
            ClientCredentials {
                client_id: "id".to_string(),
                client_secret: "secret".to_string(),
            },
        );
        let registry = default_handler_registry(&Arc::new(config));

        let handler = registry.find(None, Some(AuthProvider::Github)).expect("find");
        assert_eq!(handler.name(), "github-oauth2");
        // Token handler is still reachable by name.
        assert!(registry.find(Some("github-token"), None).is_ok());
    }

    #[test]
    fn providers_without_credentials_default_to_token() {
        let registry = default_handler_registry(&Arc::new(PocketConfig::default()));
        let handler = registry.find(None, Some(AuthProvider::Notion)).expect("find");
        assert_eq!(handler.name(), "notion-token");
        let handler = registry.find(None, Some(AuthProvider::ApiToken)).expect("find");
        assert_eq!(handler.name(), "apitoken-token");
    }
}

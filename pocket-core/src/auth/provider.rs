//! Closed enumeration of identity providers

use serde::{Deserialize, Serialize};

use crate::error::{PocketError, Result};

/// External identity/service provider a tool can require credentials for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthProvider {
    Slack,
    Linear,
    Github,
    Google,
    Calendly,
    Notion,
    Reddit,
    Gumloop,
    Serpapi,
    X,
    ApiToken,
}

impl AuthProvider {
    /// Stable lowercase name used in session keys and callback routes
    pub fn name(&self) -> &'static str {
        match self {
            AuthProvider::Slack => "slack",
            AuthProvider::Linear => "linear",
            AuthProvider::Github => "github",
            AuthProvider::Google => "google",
            AuthProvider::Calendly => "calendly",
            AuthProvider::Notion => "notion",
            AuthProvider::Reddit => "reddit",
            AuthProvider::Gumloop => "gumloop",
            AuthProvider::Serpapi => "serpapi",
            AuthProvider::X => "x",
            AuthProvider::ApiToken => "apitoken",
        }
    }

    /// Parse a provider from its name, case-insensitively
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "slack" => Ok(AuthProvider::Slack),
            "linear" => Ok(AuthProvider::Linear),
            "github" => Ok(AuthProvider::Github),
            "google" => Ok(AuthProvider::Google),
            "calendly" => Ok(AuthProvider::Calendly),
            "notion" => Ok(AuthProvider::Notion),
            "reddit" => Ok(AuthProvider::Reddit),
            "gumloop" => Ok(AuthProvider::Gumloop),
            "serpapi" => Ok(AuthProvider::Serpapi),
            "x" => Ok(AuthProvider::X),
            "apitoken" => Ok(AuthProvider::ApiToken),
            _ => Err(PocketError::UnknownProvider(name.to_string())),
        }
    }
}

impl std::fmt::Display for AuthProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_roundtrip() {
        for provider in [
            AuthProvider::Slack,
            AuthProvider::Github,
            AuthProvider::ApiToken,
        ] {
            assert_eq!(AuthProvider::from_name(provider.name()).unwrap(), provider);
        }
    }

    #[test]
    fn from_name_is_case_insensitive() {
        assert_eq!(
            AuthProvider::from_name("GITHUB").unwrap(),
            AuthProvider::Github
        );
    }

    #[test]
    fn unknown_provider_errors() {
        assert!(AuthProvider::from_name("myspace").is_err());
    }
}

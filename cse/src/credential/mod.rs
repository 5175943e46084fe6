//! Bearer-token acquisition for Key Vault.
//!
//! Callers receive a [`TokenCredential`] rather than reaching for
//! ambient process state, so tests can substitute
//! [`StaticTokenCredential`].

pub mod cli;
pub mod default;
pub mod environment;
pub mod managed_identity;

use std::fmt;

use chrono::{DateTime, Duration, Utc};

pub use default::DefaultCredential;

/// Scope for the public-cloud Key Vault data plane.
pub const KEY_VAULT_SCOPE: &str = "https://vault.azure.net/.default";

#[derive(Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_on: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_on: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_on,
        }
    }

    /// True if the token expires within `margin` of `now`.
    pub fn expires_within(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        self.expires_on - margin <= now
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"***")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

pub trait TokenCredential: Send + Sync {
    fn get_token(&self, scopes: &[&str]) -> anyhow::Result<AccessToken>;
}

/// Hands out a fixed token. For pre-acquired tokens and tests.
pub struct StaticTokenCredential {
    token: AccessToken,
}

impl StaticTokenCredential {
    pub fn new(token: AccessToken) -> Self {
        Self { token }
    }
}

impl TokenCredential for StaticTokenCredential {
    fn get_token(&self, _scopes: &[&str]) -> anyhow::Result<AccessToken> {
        Ok(self.token.clone())
    }
}

/// `https://vault.azure.net/.default` -> `https://vault.azure.net`, for
/// endpoints that still speak v1 "resource" instead of v2 scopes.
pub(crate) fn scope_to_resource(scope: &str) -> &str {
    scope.strip_suffix("/.default").unwrap_or(scope)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_strips_default_suffix() {
        assert_eq!(scope_to_resource(KEY_VAULT_SCOPE), "https://vault.azure.net");
        assert_eq!(scope_to_resource("api://custom"), "api://custom");
    }

    #[test]
    fn expiry_margin() {
        let now = Utc::now();
        let token = AccessToken::new("t", now + Duration::minutes(3));
        assert!(token.expires_within(Duration::minutes(5), now));
        assert!(!token.expires_within(Duration::minutes(1), now));
    }

    #[test]
    fn debug_hides_token() {
        let token = AccessToken::new("secret-value", Utc::now());
        assert!(!format!("{token:?}").contains("secret-value"));
    }
}

use std::collections::HashMap;

use chrono::{Duration, Utc};
use parking_lot::Mutex;

use super::{
    AccessToken, TokenCredential, cli::AzureCliCredential, environment::EnvironmentCredential,
    managed_identity::ManagedIdentityCredential,
};

/// Refresh this long before a cached token expires.
const REFRESH_MARGIN_MINUTES: i64 = 5;

/// Tries a chain of credentials in order and keeps the first token
/// that works. Fails with every source's reason if none does.
pub struct DefaultCredential {
    sources: Vec<(&'static str, Box<dyn TokenCredential>)>,
    /// scopes -> last token, so repeated Key Vault calls in one run
    /// don't walk the chain again.
    cache: Mutex<HashMap<String, AccessToken>>,
}

impl DefaultCredential {
    /// Environment service principal, then managed identity, then the
    /// Azure CLI.
    pub fn new() -> Self {
        let mut sources = Vec::new();
        match EnvironmentCredential::from_env() {
            Ok(env) => sources.push(named("EnvironmentCredential", env)),
            Err(e) => log::debug!("skipping EnvironmentCredential: {e}"),
        }
        sources.push(named(
            "ManagedIdentityCredential",
            ManagedIdentityCredential::from_env(),
        ));
        sources.push(named("AzureCliCredential", AzureCliCredential));
        Self::with_sources(sources)
    }

    pub fn with_sources(sources: Vec<(&'static str, Box<dyn TokenCredential>)>) -> Self {
        Self {
            sources,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

/// Pair a credential with the name used in diagnostics.
pub fn named(
    name: &'static str,
    credential: impl TokenCredential + 'static,
) -> (&'static str, Box<dyn TokenCredential>) {
    let boxed: Box<dyn TokenCredential> = Box::new(credential);
    (name, boxed)
}

impl Default for DefaultCredential {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenCredential for DefaultCredential {
    fn get_token(&self, scopes: &[&str]) -> anyhow::Result<AccessToken> {
        let key = scopes.join(" ");
        let mut cache = self.cache.lock();
        if let Some(token) = cache.get(&key) {
            if !token.expires_within(Duration::minutes(REFRESH_MARGIN_MINUTES), Utc::now()) {
                return Ok(token.clone());
            }
        }

        let mut failures = Vec::new();
        for (name, source) in &self.sources {
            match source.get_token(scopes) {
                Ok(token) => {
                    log::debug!("acquired token for '{key}' from {name}");
                    cache.insert(key, token.clone());
                    return Ok(token);
                }
                Err(e) => {
                    log::debug!("{name} failed: {e:#}");
                    failures.push(format!("{name}: {e:#}"));
                }
            }
        }
        anyhow::bail!(
            "no credential in the chain produced a token:\n  {}",
            failures.join("\n  ")
        )
    }
}

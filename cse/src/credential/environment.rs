use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use serde::Deserialize;
use zeroize::Zeroizing;

use super::{AccessToken, TokenCredential};
use crate::http;

pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

/// Service principal client-secret flow configured from
/// `AZURE_TENANT_ID`, `AZURE_CLIENT_ID` and `AZURE_CLIENT_SECRET`.
pub struct EnvironmentCredential {
    authority_host: String,
    tenant_id: String,
    client_id: String,
    client_secret: Zeroizing<String>,
    agent: ureq::Agent,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

impl EnvironmentCredential {
    pub fn new(
        authority_host: impl Into<String>,
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            authority_host: authority_host.into(),
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret: Zeroizing::new(client_secret.into()),
            agent: http::agent(StdDuration::from_secs(30)),
        }
    }

    /// Build from the process environment, naming every missing
    /// variable on failure.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());
        let tenant_id = get("AZURE_TENANT_ID");
        let client_id = get("AZURE_CLIENT_ID");
        let client_secret = get("AZURE_CLIENT_SECRET");
        match (tenant_id, client_id, client_secret) {
            (Some(tenant), Some(client), Some(secret)) => {
                let authority = get("AZURE_AUTHORITY_HOST")
                    .unwrap_or_else(|| DEFAULT_AUTHORITY_HOST.to_owned());
                Ok(Self::new(authority, tenant, client, secret))
            }
            (tenant, client, secret) => {
                let missing: Vec<&str> = [
                    ("AZURE_TENANT_ID", tenant.is_none()),
                    ("AZURE_CLIENT_ID", client.is_none()),
                    ("AZURE_CLIENT_SECRET", secret.is_none()),
                ]
                .into_iter()
                .filter_map(|(name, missing)| missing.then_some(name))
                .collect();
                anyhow::bail!("environment not configured: missing {}", missing.join(", "))
            }
        }
    }

    fn token_url(&self) -> String {
        format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority_host.trim_end_matches('/'),
            self.tenant_id
        )
    }
}

impl TokenCredential for EnvironmentCredential {
    fn get_token(&self, scopes: &[&str]) -> anyhow::Result<AccessToken> {
        let scope = scopes.join(" ");
        let response: TokenResponse = self
            .agent
            .post(&self.token_url())
            .send_form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", scope.as_str()),
            ])
            .map_err(http::into_error)?
            .into_json()?;
        Ok(AccessToken::new(
            response.access_token,
            Utc::now() + Duration::seconds(response.expires_in),
        ))
    }
}

use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer};

use super::{AccessToken, TokenCredential, scope_to_resource};
use crate::http;

const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";
const APP_SERVICE_API_VERSION: &str = "2019-08-01";

/// Token from the host's managed identity: App Service / Functions
/// when `IDENTITY_ENDPOINT` and `IDENTITY_HEADER` are set, the
/// instance metadata service otherwise.
pub struct ManagedIdentityCredential {
    source: Source,
    /// User-assigned identity; system-assigned when `None`.
    client_id: Option<String>,
    agent: ureq::Agent,
}

enum Source {
    AppService { endpoint: String, header: String },
    Imds,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(deserialize_with = "number_or_string")]
    expires_on: i64,
}

/// IMDS sends `expires_on` as a string of epoch seconds, App Service
/// as a number.
fn number_or_string<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }
    match Raw::deserialize(d)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

impl ManagedIdentityCredential {
    pub fn from_env() -> Self {
        let source = match (
            std::env::var("IDENTITY_ENDPOINT"),
            std::env::var("IDENTITY_HEADER"),
        ) {
            (Ok(endpoint), Ok(header)) => Source::AppService { endpoint, header },
            _ => Source::Imds,
        };
        Self {
            source,
            client_id: std::env::var("AZURE_CLIENT_ID").ok().filter(|v| !v.is_empty()),
            // IMDS is a link-local probe: fail fast off-Azure.
            agent: http::agent(StdDuration::from_secs(2)),
        }
    }

    fn request(&self, resource: &str) -> ureq::Request {
        let request = match &self.source {
            Source::AppService { endpoint, header } => self
                .agent
                .get(endpoint)
                .query("api-version", APP_SERVICE_API_VERSION)
                .set("X-IDENTITY-HEADER", header),
            Source::Imds => self
                .agent
                .get(IMDS_ENDPOINT)
                .query("api-version", IMDS_API_VERSION)
                .set("Metadata", "true"),
        };
        let request = request.query("resource", resource);
        match &self.client_id {
            Some(client_id) => request.query("client_id", client_id),
            None => request,
        }
    }
}

impl TokenCredential for ManagedIdentityCredential {
    fn get_token(&self, scopes: &[&str]) -> anyhow::Result<AccessToken> {
        let [scope] = scopes else {
            anyhow::bail!("managed identity takes exactly one scope, got {}", scopes.len());
        };
        let response: TokenResponse = self
            .request(scope_to_resource(scope))
            .call()
            .map_err(http::into_error)?
            .into_json()?;
        let expires_on = DateTime::<Utc>::from_timestamp(response.expires_on, 0)
            .unwrap_or_else(|| Utc::now() + Duration::minutes(5));
        Ok(AccessToken::new(response.access_token, expires_on))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expires_on_accepts_both_forms() {
        let imds: TokenResponse =
            serde_json::from_str(r#"{"access_token":"a","expires_on":"1700000000"}"#).unwrap();
        assert_eq!(imds.expires_on, 1_700_000_000);

        let app_service: TokenResponse =
            serde_json::from_str(r#"{"access_token":"a","expires_on":1700000000}"#).unwrap();
        assert_eq!(app_service.expires_on, 1_700_000_000);
    }

    #[test]
    fn rejects_multiple_scopes() {
        let cred = ManagedIdentityCredential {
            source: Source::Imds,
            client_id: None,
            agent: http::agent(StdDuration::from_millis(10)),
        };
        assert!(cred.get_token(&["a", "b"]).is_err());
    }
}

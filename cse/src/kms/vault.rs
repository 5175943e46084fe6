//! Key Vault backed key resolution.
//!
//! `/keys/` identifiers stay in the vault: wrapping and unwrapping are
//! remote `wrapkey` / `unwrapkey` operations. `/secrets/` identifiers
//! are fetched once and used locally as a [`SymmetricKey`].

use std::{sync::Arc, time::Duration};

use base64::{
    Engine,
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
};
use serde::{Deserialize, Serialize};
use url::Url;

use super::{KeyEncryptionKey, KeyResolver, local::SymmetricKey};
use crate::{
    cancel::CancellationToken,
    credential::{KEY_VAULT_SCOPE, TokenCredential},
    http,
};

pub const DEFAULT_API_VERSION: &str = "7.4";
pub const RSA_OAEP_256: &str = "RSA-OAEP-256";
pub const A256KW: &str = "A256KW";
const MANAGED_HSM_SCOPE: &str = "https://managedhsm.azure.net/.default";

/// Vault DNS suffixes this client will talk to, with the token scope
/// each one expects.
const VAULT_HOSTS: [(&str, &str); 6] = [
    (".vault.azure.net", KEY_VAULT_SCOPE),
    (".vault.azure.cn", "https://vault.azure.cn/.default"),
    (".vault.usgovcloudapi.net", "https://vault.usgovcloudapi.net/.default"),
    (".managedhsm.azure.net", MANAGED_HSM_SCOPE),
    (".managedhsm.azure.cn", "https://managedhsm.azure.cn/.default"),
    (".managedhsm.usgovcloudapi.net", "https://managedhsm.usgovcloudapi.net/.default"),
];

/// Which vault collection an identifier points into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Collection {
    Keys,
    Secrets,
}

/// A parsed `https://{vault}/{keys|secrets}/{name}[/{version}]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VaultObjectId {
    pub vault: Url,
    pub collection: Collection,
    pub name: String,
    pub version: Option<String>,
    scope: &'static str,
}

impl VaultObjectId {
    pub fn parse(id: &Url) -> anyhow::Result<Self> {
        anyhow::ensure!(id.scheme() == "https", "Key Vault identifiers must use https: {id}");
        let scope = scope_for(id)
            .ok_or_else(|| anyhow::anyhow!("{id} is not a Key Vault or Managed HSM address"))?;
        let segments: Vec<&str> = id
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).collect())
            .unwrap_or_default();

        let (collection, name, version) = match segments.as_slice() {
            [collection, name] => (*collection, *name, None),
            [collection, name, version] => (*collection, *name, Some((*version).to_owned())),
            _ => anyhow::bail!(
                "expected https://<vault>/keys|secrets/<name>[/<version>], got {id}"
            ),
        };
        let collection = match collection {
            "keys" => Collection::Keys,
            "secrets" => Collection::Secrets,
            other => anyhow::bail!("unsupported Key Vault collection '{other}' in {id}"),
        };

        let mut vault = id.clone();
        vault.set_path("");
        vault.set_query(None);
        vault.set_fragment(None);
        Ok(Self {
            vault,
            collection,
            name: name.to_owned(),
            version,
            scope,
        })
    }

    pub fn url(&self) -> anyhow::Result<Url> {
        let mut url = self.vault.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| anyhow::anyhow!("cannot build URL from {}", self.vault))?;
            segments.clear();
            segments.push(match self.collection {
                Collection::Keys => "keys",
                Collection::Secrets => "secrets",
            });
            segments.push(&self.name);
            if let Some(version) = &self.version {
                segments.push(version);
            }
        }
        Ok(url)
    }

    fn scope(&self) -> &'static str {
        self.scope
    }
}

/// Token scope for a vault address, or `None` if the host is not a
/// known vault endpoint.
fn scope_for(url: &Url) -> Option<&'static str> {
    let host = url.host_str()?;
    VAULT_HOSTS.iter().find_map(|(suffix, scope)| {
        (host.len() > suffix.len() && host.ends_with(suffix)).then_some(*scope)
    })
}

/// Shared request plumbing for the resolver and the keys it hands out.
#[derive(Clone)]
struct VaultClient {
    credential: Arc<dyn TokenCredential>,
    agent: ureq::Agent,
    api_version: String,
}

impl VaultClient {
    fn authorized(&self, request: ureq::Request, scope: &str) -> anyhow::Result<ureq::Request> {
        let token = self.credential.get_token(&[scope])?;
        Ok(request
            .query("api-version", &self.api_version)
            .set("Authorization", &format!("Bearer {}", token.token)))
    }

    fn get<T: for<'de> Deserialize<'de>>(&self, url: &Url, scope: &str) -> anyhow::Result<T> {
        let request = self.authorized(self.agent.get(url.as_str()), scope)?;
        Ok(request.call().map_err(http::into_error)?.into_json()?)
    }

    fn post<B: Serialize, T: for<'de> Deserialize<'de>>(
        &self,
        url: &Url,
        scope: &str,
        body: &B,
    ) -> anyhow::Result<T> {
        let request = self.authorized(self.agent.post(url.as_str()), scope)?;
        Ok(request
            .send_json(serde_json::to_value(body)?)
            .map_err(http::into_error)?
            .into_json()?)
    }
}

#[derive(Deserialize)]
struct KeyBundle {
    key: JsonWebKey,
}

#[derive(Deserialize)]
struct JsonWebKey {
    kid: String,
    kty: String,
}

#[derive(Deserialize)]
struct SecretBundle {
    id: String,
    value: String,
}

#[derive(Serialize)]
struct KeyOperationRequest<'a> {
    alg: &'a str,
    value: String,
}

#[derive(Deserialize)]
struct KeyOperationResult {
    value: String,
}

/// Resolves `https://` identifiers against Key Vault (or Managed HSM)
/// using an injected credential.
pub struct KeyVaultResolver {
    client: VaultClient,
}

impl KeyVaultResolver {
    pub fn new(credential: Arc<dyn TokenCredential>) -> Self {
        Self::with_api_version(credential, DEFAULT_API_VERSION)
    }

    pub fn with_api_version(
        credential: Arc<dyn TokenCredential>,
        api_version: impl Into<String>,
    ) -> Self {
        Self {
            client: VaultClient {
                credential,
                agent: http::agent(Duration::from_secs(30)),
                api_version: api_version.into(),
            },
        }
    }

    fn resolve_key(&self, id: &VaultObjectId) -> anyhow::Result<Arc<dyn KeyEncryptionKey>> {
        let bundle: KeyBundle = self.client.get(&id.url()?, id.scope())?;
        let default_algorithm = default_algorithm_for(&bundle.key.kty)?;
        log::debug!("resolved Key Vault key {} ({})", bundle.key.kid, bundle.key.kty);
        Ok(Arc::new(RemoteKey {
            kid: bundle.key.kid,
            default_algorithm,
            client: self.client.clone(),
        }))
    }

    fn resolve_secret(&self, id: &VaultObjectId) -> anyhow::Result<Arc<dyn KeyEncryptionKey>> {
        let bundle: SecretBundle = self.client.get(&id.url()?, id.scope())?;
        let bytes = decode_secret_value(&bundle.value)?;
        log::debug!("resolved Key Vault secret {}", bundle.id);
        Ok(Arc::new(SymmetricKey::new(bundle.id, bytes)?))
    }
}

impl KeyResolver for KeyVaultResolver {
    fn resolve(
        &self,
        key_id: &Url,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Arc<dyn KeyEncryptionKey>> {
        let id = VaultObjectId::parse(key_id)?;
        cancel.check()?;
        match id.collection {
            Collection::Keys => self.resolve_key(&id),
            Collection::Secrets => self.resolve_secret(&id),
        }
    }
}

fn default_algorithm_for(kty: &str) -> anyhow::Result<&'static str> {
    match kty {
        "RSA" | "RSA-HSM" => Ok(RSA_OAEP_256),
        "oct" | "oct-HSM" => Ok(A256KW),
        other => anyhow::bail!("key type '{other}' cannot wrap keys"),
    }
}

/// Secrets hold the key as base64 (either alphabet).
fn decode_secret_value(value: &str) -> anyhow::Result<Vec<u8>> {
    let value = value.trim();
    STANDARD
        .decode(value)
        .or_else(|_| URL_SAFE_NO_PAD.decode(value.trim_end_matches('=')))
        .map_err(|e| anyhow::anyhow!("secret value is not a base64 key: {e}"))
}

/// A key that never leaves the vault.
pub struct RemoteKey {
    kid: String,
    default_algorithm: &'static str,
    client: VaultClient,
}

impl RemoteKey {
    fn operation(&self, op: &str, algorithm: &str, input: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut url = Url::parse(&self.kid)?;
        url.path_segments_mut()
            .map_err(|()| anyhow::anyhow!("cannot build URL from {}", self.kid))?
            .push(op);
        let body = KeyOperationRequest {
            alg: algorithm,
            value: URL_SAFE_NO_PAD.encode(input),
        };
        let scope = scope_for(&url)
            .ok_or_else(|| anyhow::anyhow!("{url} is not a Key Vault or Managed HSM address"))?;
        let result: KeyOperationResult = self.client.post(&url, scope, &body)?;
        URL_SAFE_NO_PAD
            .decode(result.value.trim_end_matches('='))
            .map_err(|e| anyhow::anyhow!("{op} returned invalid base64url: {e}"))
    }
}

impl KeyEncryptionKey for RemoteKey {
    fn kid(&self) -> &str {
        &self.kid
    }

    fn default_algorithm(&self) -> &str {
        self.default_algorithm
    }

    fn wrap_key(&self, algorithm: &str, key: &[u8]) -> anyhow::Result<Vec<u8>> {
        self.operation("wrapkey", algorithm, key)
    }

    fn unwrap_key(&self, algorithm: &str, wrapped: &[u8]) -> anyhow::Result<Vec<u8>> {
        self.operation("unwrapkey", algorithm, wrapped)
    }
}

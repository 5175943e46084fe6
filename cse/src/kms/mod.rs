pub mod local;
pub mod vault;

use std::sync::Arc;

use url::Url;

use crate::cancel::CancellationToken;

/// A key-encryption key. Used only to wrap and unwrap per-blob
/// content keys, never to encrypt content directly.
pub trait KeyEncryptionKey: Send + Sync {
    /// Identifier recorded next to every key this KEK wraps, and used
    /// to find the KEK again on read.
    fn kid(&self) -> &str;

    /// Wrap algorithm used when the caller does not ask for one.
    fn default_algorithm(&self) -> &str;

    fn wrap_key(&self, algorithm: &str, key: &[u8]) -> anyhow::Result<Vec<u8>>;

    fn unwrap_key(&self, algorithm: &str, wrapped: &[u8]) -> anyhow::Result<Vec<u8>>;
}

/// Maps a key identifier to a usable KEK handle.
pub trait KeyResolver: Send + Sync {
    fn resolve(
        &self,
        key_id: &Url,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Arc<dyn KeyEncryptionKey>>;
}

/// Dispatches on the identifier's scheme: `file` to
/// [`local::LocalKeyResolver`], `https` to [`vault::KeyVaultResolver`].
pub struct DefaultKeyResolver {
    local: local::LocalKeyResolver,
    vault: vault::KeyVaultResolver,
}

impl DefaultKeyResolver {
    pub fn new(vault: vault::KeyVaultResolver) -> Self {
        Self {
            local: local::LocalKeyResolver,
            vault,
        }
    }
}

impl KeyResolver for DefaultKeyResolver {
    fn resolve(
        &self,
        key_id: &Url,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Arc<dyn KeyEncryptionKey>> {
        match key_id.scheme() {
            "file" => self.local.resolve(key_id, cancel),
            "https" => self.vault.resolve(key_id, cancel),
            other => anyhow::bail!("unsupported key identifier scheme '{other}' in {key_id}"),
        }
    }
}

use std::{fs::File, io::Read, sync::Arc};

use aes_gcm::{Aes256Gcm, KeyInit, Nonce, aead::Aead};
use url::Url;
use zeroize::Zeroizing;

use super::{KeyEncryptionKey, KeyResolver};
use crate::cancel::CancellationToken;

pub const A256GCM: &str = "A256GCM";
const KEK_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// A 256-bit symmetric KEK held in process memory. Backs both Key
/// Vault secrets and local key files.
///
/// Wrapped keys are laid out as `nonce (12) || ciphertext || tag (16)`.
pub struct SymmetricKey {
    kid: String,
    bytes: Zeroizing<Vec<u8>>,
}

impl SymmetricKey {
    pub fn new(kid: impl Into<String>, bytes: Vec<u8>) -> anyhow::Result<Self> {
        let bytes = Zeroizing::new(bytes);
        anyhow::ensure!(
            bytes.len() == KEK_LEN,
            "symmetric KEK must be exactly {KEK_LEN} bytes, got {}",
            bytes.len()
        );
        Ok(Self {
            kid: kid.into(),
            bytes,
        })
    }

    fn check_algorithm(algorithm: &str) -> anyhow::Result<()> {
        anyhow::ensure!(
            algorithm == A256GCM,
            "symmetric KEK supports only {A256GCM}, not '{algorithm}'"
        );
        Ok(())
    }
}

impl KeyEncryptionKey for SymmetricKey {
    fn kid(&self) -> &str {
        &self.kid
    }

    fn default_algorithm(&self) -> &str {
        A256GCM
    }

    fn wrap_key(&self, algorithm: &str, key: &[u8]) -> anyhow::Result<Vec<u8>> {
        Self::check_algorithm(algorithm)?;
        let cipher = Aes256Gcm::new_from_slice(&self.bytes)?;
        let nonce_bytes: [u8; NONCE_LEN] = crate::crypto::random_bytes()?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), key)
            .map_err(|e| anyhow::anyhow!("wrap encrypt failed: {e}"))?;
        let mut out = nonce_bytes.to_vec();
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn unwrap_key(&self, algorithm: &str, wrapped: &[u8]) -> anyhow::Result<Vec<u8>> {
        Self::check_algorithm(algorithm)?;
        anyhow::ensure!(wrapped.len() > NONCE_LEN, "wrapped key too short");
        let (nonce, ciphertext) = wrapped.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new_from_slice(&self.bytes)?;
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| anyhow::anyhow!("unwrap decrypt failed: {e}"))
    }
}

/// Resolves `file://` identifiers to a 32-byte key file on disk.
pub struct LocalKeyResolver;

impl KeyResolver for LocalKeyResolver {
    fn resolve(
        &self,
        key_id: &Url,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Arc<dyn KeyEncryptionKey>> {
        cancel.check()?;
        let path = key_id
            .to_file_path()
            .map_err(|()| anyhow::anyhow!("not a local file key identifier: {key_id}"))?;
        let mut bytes = Vec::with_capacity(KEK_LEN + 1);
        File::open(&path)
            .and_then(|file| file.take(KEK_LEN as u64 + 1).read_to_end(&mut bytes))
            .map_err(|e| anyhow::anyhow!("cannot read key file {}: {e}", path.display()))?;
        anyhow::ensure!(
            bytes.len() == KEK_LEN,
            "key file {} must be exactly {KEK_LEN} bytes",
            path.display()
        );
        log::debug!("resolved local KEK from {}", path.display());
        Ok(Arc::new(SymmetricKey::new(key_id.as_str(), bytes)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_round_trip() {
        let kek = SymmetricKey::new("kid", vec![1u8; 32]).unwrap();
        let wrapped = kek.wrap_key(A256GCM, b"content key material").unwrap();
        assert_eq!(wrapped.len(), NONCE_LEN + 20 + 16);
        assert_eq!(kek.unwrap_key(A256GCM, &wrapped).unwrap(), b"content key material");
    }

    #[test]
    fn rejects_other_algorithms() {
        let kek = SymmetricKey::new("kid", vec![1u8; 32]).unwrap();
        assert!(kek.wrap_key("RSA-OAEP-256", b"k").is_err());
    }

    #[test]
    fn rejects_short_keys() {
        assert!(SymmetricKey::new("kid", vec![1u8; 16]).is_err());
    }

    #[test]
    fn resolves_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kek.bin");
        std::fs::write(&path, [9u8; 32]).unwrap();
        let url = Url::from_file_path(&path).unwrap();

        let kek = LocalKeyResolver
            .resolve(&url, &CancellationToken::new())
            .unwrap();
        assert_eq!(kek.kid(), url.as_str());
        assert_eq!(kek.default_algorithm(), A256GCM);
    }

    #[test]
    fn key_file_must_be_32_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        std::fs::write(&path, [9u8; 31]).unwrap();
        let url = Url::from_file_path(&path).unwrap();
        assert!(LocalKeyResolver.resolve(&url, &CancellationToken::new()).is_err());
    }

    #[test]
    fn oversized_key_file_is_read_no_further() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.bin");
        std::fs::write(&path, vec![9u8; 1024 * 1024]).unwrap();
        let url = Url::from_file_path(&path).unwrap();
        let err = LocalKeyResolver
            .resolve(&url, &CancellationToken::new())
            .err()
            .unwrap();
        assert!(err.to_string().contains("must be exactly 32 bytes"));
    }

    #[test]
    fn cancelled_before_read() {
        let token = CancellationToken::new();
        token.cancel();
        let url = Url::parse("file:///does/not/matter").unwrap();
        let err = LocalKeyResolver.resolve(&url, &token).err().unwrap();
        assert!(crate::cancel::is_cancelled(&err));
    }
}

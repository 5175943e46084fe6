pub mod envelope;
pub mod keys;
pub mod legacy;
pub mod region;

use std::fmt;

/// Content or key material failed authentication, or the stored
/// encryption metadata is unusable.
#[derive(Debug)]
pub struct DecryptError(pub String);

impl fmt::Display for DecryptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "decryption failed: {}", self.0)
    }
}

impl std::error::Error for DecryptError {}

/// True if `err` or anything in its source chain is a [`DecryptError`].
pub fn is_decrypt_error(err: &anyhow::Error) -> bool {
    err.downcast_ref::<DecryptError>().is_some() || err.chain().any(|e| e.is::<DecryptError>())
}

pub(crate) fn random_bytes<const N: usize>() -> anyhow::Result<[u8; N]> {
    let mut buf = [0u8; N];
    getrandom::getrandom(&mut buf).map_err(|e| anyhow::anyhow!("getrandom failed: {e}"))?;
    Ok(buf)
}

//! Region-at-a-time AES-256-GCM content encryption.
//!
//! The plaintext is cut into fixed-size regions; each region is stored
//! as
//!
//! ```text
//! [ nonce (12) | ciphertext (<= region_len) | tag (16) ]
//! ```
//!
//! with a fresh random nonce, so every region authenticates on its
//! own and a download never holds more than one region in memory.

use std::io::{self, Read};

use aes_gcm::{Aes256Gcm, KeyInit, Nonce, aead::Aead};

use super::{DecryptError, keys::Dek};

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
/// Plaintext bytes per region.
pub const DEFAULT_REGION_LEN: usize = 4 * 1024 * 1024;
/// Upper bound accepted from blob metadata before allocating a buffer.
pub const MAX_REGION_LEN: usize = 64 * 1024 * 1024;

/// Encrypted size of a region carrying `plaintext_len` bytes.
pub fn sealed_len(plaintext_len: usize) -> usize {
    NONCE_LEN + plaintext_len + TAG_LEN
}

pub fn encrypt_region(dek: &Dek, plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(dek.as_bytes())?;
    let nonce_bytes: [u8; NONCE_LEN] = super::random_bytes()?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| anyhow::anyhow!("region encrypt failed: {e}"))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn decrypt_region(dek: &Dek, sealed: &[u8]) -> anyhow::Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(DecryptError(format!(
            "truncated region: {} bytes, need at least {}",
            sealed.len(),
            NONCE_LEN + TAG_LEN
        ))
        .into());
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(dek.as_bytes())?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| DecryptError("region authentication failed".into()).into())
}

/// Fill `buf` from `reader`, stopping short only at end of stream.
/// Returns the number of bytes read.
pub fn read_full(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_has_nonce_and_tag() {
        let dek = Dek::generate().unwrap();
        let sealed = encrypt_region(&dek, b"hello region").unwrap();
        assert_eq!(sealed.len(), sealed_len(12));
        assert_eq!(decrypt_region(&dek, &sealed).unwrap(), b"hello region");
    }

    #[test]
    fn nonces_are_fresh() {
        let dek = Dek::generate().unwrap();
        let a = encrypt_region(&dek, b"same").unwrap();
        let b = encrypt_region(&dek, b"same").unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails() {
        let dek1 = Dek::generate().unwrap();
        let dek2 = Dek::generate().unwrap();
        let sealed = encrypt_region(&dek1, b"secret").unwrap();
        let err = decrypt_region(&dek2, &sealed).unwrap_err();
        assert!(crate::crypto::is_decrypt_error(&err));
    }

    #[test]
    fn tampering_fails() {
        let dek = Dek::generate().unwrap();
        let mut sealed = encrypt_region(&dek, b"secret payload").unwrap();
        sealed[NONCE_LEN + 2] ^= 0x01;
        assert!(decrypt_region(&dek, &sealed).is_err());
    }

    #[test]
    fn short_input_is_truncated() {
        let dek = Dek::generate().unwrap();
        let err = decrypt_region(&dek, &[0u8; 20]).unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn read_full_stops_at_eof() {
        let mut src: &[u8] = b"abcdef";
        let mut buf = [0u8; 4];
        assert_eq!(read_full(&mut src, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(read_full(&mut src, &mut buf).unwrap(), 2);
        assert_eq!(read_full(&mut src, &mut buf).unwrap(), 0);
    }
}

//! Read side of protocol 1.0 blobs.
//!
//! The whole blob is a single AES-256-CBC stream with PKCS#7 padding
//! under `ContentEncryptionIV`. It is decrypted a chunk at a time; the
//! last full block is held back until the stream ends so the padding
//! can be stripped.

use aes::Aes256;
use cbc::cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7, generic_array::GenericArray};

use super::{DecryptError, keys::Dek};

pub const IV_LEN: usize = 16;
const BLOCK_LEN: usize = 16;

type Aes256CbcDec = cbc::Decryptor<Aes256>;

pub struct CbcDecryptor {
    cipher: Aes256CbcDec,
    pending: Vec<u8>,
}

impl CbcDecryptor {
    pub fn new(dek: &Dek, iv: &[u8; IV_LEN]) -> anyhow::Result<Self> {
        let cipher = Aes256CbcDec::new_from_slices(dek.as_bytes(), iv)
            .map_err(|e| anyhow::anyhow!("invalid CBC key or IV: {e}"))?;
        Ok(Self {
            cipher,
            pending: Vec::new(),
        })
    }

    /// Feed ciphertext and return whatever plaintext can no longer be
    /// part of the padding.
    pub fn update(&mut self, ciphertext: &[u8]) -> Vec<u8> {
        self.pending.extend_from_slice(ciphertext);
        let ready = match self.pending.len() {
            0..=BLOCK_LEN => 0,
            len => (len - 1) / BLOCK_LEN * BLOCK_LEN,
        };
        let mut out: Vec<u8> = self.pending.drain(..ready).collect();
        for block in out.chunks_exact_mut(BLOCK_LEN) {
            self.cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        out
    }

    /// Decrypt the held-back block and strip the padding.
    pub fn finish(mut self) -> anyhow::Result<Vec<u8>> {
        if self.pending.len() != BLOCK_LEN {
            return Err(DecryptError(format!(
                "CBC ciphertext is not a whole number of {BLOCK_LEN}-byte blocks"
            ))
            .into());
        }
        let plaintext = self
            .cipher
            .decrypt_padded_mut::<Pkcs7>(&mut self.pending)
            .map_err(|_| DecryptError("invalid CBC padding".into()))?;
        Ok(plaintext.to_vec())
    }
}

use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop};

pub const DEK_LEN: usize = 32;

/// A 256-bit content encryption key. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Dek {
    bytes: [u8; DEK_LEN],
}

impl Dek {
    pub fn generate() -> anyhow::Result<Self> {
        Ok(Self {
            bytes: super::random_bytes()?,
        })
    }

    pub fn from_slice(bytes: &[u8]) -> anyhow::Result<Self> {
        let bytes: [u8; DEK_LEN] = bytes.try_into().map_err(|_| {
            anyhow::anyhow!("content key must be {DEK_LEN} bytes, got {}", bytes.len())
        })?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; DEK_LEN] {
        &self.bytes
    }
}

impl fmt::Debug for Dek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Dek(***)")
    }
}

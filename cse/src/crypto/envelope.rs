//! Encryption metadata stored alongside each blob.
//!
//! The DEK never leaves the process in plaintext: it is prefixed with
//! the protocol tag, wrapped by the KEK, and the result is recorded in
//! the blob's `encryptiondata` metadata entry together with everything
//! a reader needs to rebuild the region layout.
//!
//! Protocol 1.0 blobs (AES-CBC content, raw wrapped DEK) are read but
//! never written.

use std::collections::{BTreeMap, HashMap};

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::{
    DecryptError,
    keys::{DEK_LEN, Dek},
    legacy::IV_LEN,
    region::{MAX_REGION_LEN, NONCE_LEN},
};
use crate::kms::KeyEncryptionKey;

/// Metadata entry name (sent as `x-ms-meta-encryptiondata`).
pub const METADATA_KEY: &str = "encryptiondata";
pub const PROTOCOL: &str = "2.0";
pub const CONTENT_ALGORITHM: &str = "AES_GCM_256";
pub const PROTOCOL_V1: &str = "1.0";
pub const CONTENT_ALGORITHM_V1: &str = "AES_CBC_256";
pub const ENCRYPTION_MODE: &str = "FullBlob";
/// The wrapped payload is `PROTOCOL` NUL-padded to this many bytes,
/// followed by the DEK.
const PROTOCOL_PREFIX_LEN: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EncryptionData {
    pub encryption_mode: String,
    pub wrapped_content_key: WrappedContentKey,
    pub encryption_agent: EncryptionAgent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_region_info: Option<RegionInfo>,
    /// Base64 IV of a protocol 1.0 blob.
    #[serde(
        rename = "ContentEncryptionIV",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub content_encryption_iv: Option<String>,
    #[serde(default)]
    pub key_wrapping_metadata: HashMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WrappedContentKey {
    pub key_id: String,
    /// Base64 of the wrapped `protocol || DEK` payload.
    pub encrypted_key: String,
    pub algorithm: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EncryptionAgent {
    pub protocol: String,
    pub encryption_algorithm: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RegionInfo {
    pub data_length: usize,
    pub nonce_length: usize,
}

/// How a blob's content is laid out on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentLayout {
    /// Protocol 2.0: AES-GCM regions of `region_len` plaintext bytes.
    Regions { region_len: usize },
    /// Protocol 1.0: one AES-CBC stream.
    Cbc { iv: [u8; IV_LEN] },
}

impl EncryptionData {
    /// Wrap `dek` under `kek` and describe a blob cut into
    /// `region_len`-byte regions.
    pub fn seal(
        dek: &Dek,
        kek: &dyn KeyEncryptionKey,
        algorithm: &str,
        region_len: usize,
    ) -> anyhow::Result<Self> {
        let mut payload = Zeroizing::new(Vec::with_capacity(PROTOCOL_PREFIX_LEN + DEK_LEN));
        payload.extend_from_slice(&protocol_prefix());
        payload.extend_from_slice(dek.as_bytes());
        let wrapped = kek.wrap_key(algorithm, &payload)?;

        let mut key_wrapping_metadata = HashMap::new();
        key_wrapping_metadata.insert(
            "EncryptionLibrary".to_owned(),
            concat!("blobcrypt-cse ", env!("CARGO_PKG_VERSION")).to_owned(),
        );

        Ok(Self {
            encryption_mode: ENCRYPTION_MODE.to_owned(),
            wrapped_content_key: WrappedContentKey {
                key_id: kek.kid().to_owned(),
                encrypted_key: STANDARD.encode(wrapped),
                algorithm: algorithm.to_owned(),
            },
            encryption_agent: EncryptionAgent {
                protocol: PROTOCOL.to_owned(),
                encryption_algorithm: CONTENT_ALGORITHM.to_owned(),
            },
            encrypted_region_info: Some(RegionInfo {
                data_length: region_len,
                nonce_length: NONCE_LEN,
            }),
            content_encryption_iv: None,
            key_wrapping_metadata,
        })
    }

    /// Check that this crate can read a blob described by `self` and
    /// return how its content is laid out.
    pub fn layout(&self) -> anyhow::Result<ContentLayout> {
        let bad = |msg: String| -> anyhow::Error { DecryptError(msg).into() };
        if self.encryption_mode != ENCRYPTION_MODE {
            return Err(bad(format!("unsupported encryption mode '{}'", self.encryption_mode)));
        }
        let agent = &self.encryption_agent;
        match (agent.protocol.as_str(), agent.encryption_algorithm.as_str()) {
            (PROTOCOL, CONTENT_ALGORITHM) => {
                let info = self
                    .encrypted_region_info
                    .as_ref()
                    .ok_or_else(|| bad("missing EncryptedRegionInfo".into()))?;
                if info.nonce_length != NONCE_LEN {
                    return Err(bad(format!("unsupported nonce length {}", info.nonce_length)));
                }
                if info.data_length == 0 || info.data_length > MAX_REGION_LEN {
                    return Err(bad(format!("invalid region length {}", info.data_length)));
                }
                Ok(ContentLayout::Regions {
                    region_len: info.data_length,
                })
            }
            (PROTOCOL_V1, CONTENT_ALGORITHM_V1) => {
                let encoded = self
                    .content_encryption_iv
                    .as_deref()
                    .ok_or_else(|| bad("missing ContentEncryptionIV".into()))?;
                let iv = STANDARD
                    .decode(encoded)
                    .ok()
                    .and_then(|iv| <[u8; IV_LEN]>::try_from(iv).ok())
                    .ok_or_else(|| bad(format!("ContentEncryptionIV must be {IV_LEN} bytes")))?;
                Ok(ContentLayout::Cbc { iv })
            }
            (protocol, algorithm) => Err(bad(format!(
                "unsupported encryption protocol '{protocol}' with content algorithm '{algorithm}'"
            ))),
        }
    }

    /// Unwrap the DEK with `kek`, which must be the key named by
    /// `wrapped_content_key.key_id`.
    pub fn open(&self, kek: &dyn KeyEncryptionKey) -> anyhow::Result<Dek> {
        let wrapped = STANDARD
            .decode(&self.wrapped_content_key.encrypted_key)
            .map_err(|e| DecryptError(format!("EncryptedKey is not base64: {e}")))?;
        let payload = Zeroizing::new(
            kek.unwrap_key(&self.wrapped_content_key.algorithm, &wrapped)
                .map_err(|e| DecryptError(format!("content key unwrap failed: {e:#}")))?,
        );

        if self.encryption_agent.protocol == PROTOCOL_V1 {
            if payload.len() != DEK_LEN {
                return Err(DecryptError(format!(
                    "unwrapped content key has {} bytes",
                    payload.len()
                ))
                .into());
            }
            return Dek::from_slice(&payload);
        }
        if payload.len() != PROTOCOL_PREFIX_LEN + DEK_LEN {
            return Err(
                DecryptError(format!("unwrapped content key has {} bytes", payload.len())).into(),
            );
        }
        if payload[..PROTOCOL_PREFIX_LEN] != protocol_prefix() {
            return Err(DecryptError("content key protocol tag mismatch".into()).into());
        }
        Dek::from_slice(&payload[PROTOCOL_PREFIX_LEN..])
    }

    pub fn to_metadata(&self) -> anyhow::Result<BTreeMap<String, String>> {
        let mut metadata = BTreeMap::new();
        metadata.insert(METADATA_KEY.to_owned(), serde_json::to_string(self)?);
        Ok(metadata)
    }

    /// Pull the encryption metadata out of a blob's metadata map.
    /// Metadata names are case-insensitive on the service side.
    pub fn from_metadata(metadata: &BTreeMap<String, String>) -> anyhow::Result<Self> {
        let raw = metadata
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(METADATA_KEY))
            .map(|(_, v)| v)
            .ok_or_else(|| DecryptError("blob has no encryption metadata".into()))?;
        serde_json::from_str(raw)
            .map_err(|e| DecryptError(format!("malformed encryption metadata: {e}")).into())
    }
}

fn protocol_prefix() -> [u8; PROTOCOL_PREFIX_LEN] {
    let mut prefix = [0u8; PROTOCOL_PREFIX_LEN];
    prefix[..PROTOCOL.len()].copy_from_slice(PROTOCOL.as_bytes());
    prefix
}

pub mod azure;
pub mod connection;
pub mod memory;
pub mod shared_key;

use std::{collections::BTreeMap, io::Read};

/// User-defined blob metadata (`x-ms-meta-*`), keyed by name.
pub type Metadata = BTreeMap<String, String>;

pub struct BlobDownload {
    pub metadata: Metadata,
    pub body: Box<dyn Read + Send>,
}

/// The block-blob operations the encrypting client is built on.
///
/// Staged blocks are invisible until [`BlobStore::commit_block_list`],
/// which atomically replaces any existing blob at that path.
pub trait BlobStore: Send + Sync {
    /// Returns `true` if the container was created, `false` if it
    /// already existed.
    fn create_container_if_not_exists(&self, container: &str) -> anyhow::Result<bool>;

    fn stage_block(
        &self,
        container: &str,
        blob: &str,
        block_id: &str,
        data: &[u8],
    ) -> anyhow::Result<()>;

    fn commit_block_list(
        &self,
        container: &str,
        blob: &str,
        block_ids: &[String],
        metadata: &Metadata,
    ) -> anyhow::Result<()>;

    fn get_blob(&self, container: &str, blob: &str) -> anyhow::Result<BlobDownload>;
}

//! In-process [`BlobStore`] with the service's block semantics.

use std::{
    collections::HashMap,
    io::Cursor,
    sync::atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;

use super::{BlobDownload, BlobStore, Metadata};

#[derive(Clone, Debug)]
pub struct StoredBlob {
    pub data: Vec<u8>,
    pub metadata: Metadata,
}

#[derive(Default)]
struct State {
    /// container -> blob path -> committed blob
    containers: HashMap<String, HashMap<String, StoredBlob>>,
    /// (container, blob, block id) -> uncommitted block
    staged: HashMap<(String, String, String), Vec<u8>>,
}

#[derive(Default)]
pub struct MemoryBlobStore {
    state: Mutex<State>,
    requests: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of store operations issued so far.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn container_exists(&self, container: &str) -> bool {
        self.state.lock().containers.contains_key(container)
    }

    pub fn blob(&self, container: &str, blob: &str) -> Option<StoredBlob> {
        self.state
            .lock()
            .containers
            .get(container)
            .and_then(|c| c.get(blob))
            .cloned()
    }

    /// Overwrite a committed blob's raw bytes, e.g. to simulate tampering.
    pub fn put_raw(&self, container: &str, blob: &str, data: Vec<u8>, metadata: Metadata) {
        self.state
            .lock()
            .containers
            .entry(container.to_owned())
            .or_default()
            .insert(blob.to_owned(), StoredBlob { data, metadata });
    }

    fn count(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
    }
}

impl BlobStore for MemoryBlobStore {
    fn create_container_if_not_exists(&self, container: &str) -> anyhow::Result<bool> {
        self.count();
        let mut state = self.state.lock();
        if state.containers.contains_key(container) {
            return Ok(false);
        }
        state.containers.insert(container.to_owned(), HashMap::new());
        Ok(true)
    }

    fn stage_block(
        &self,
        container: &str,
        blob: &str,
        block_id: &str,
        data: &[u8],
    ) -> anyhow::Result<()> {
        self.count();
        let mut state = self.state.lock();
        anyhow::ensure!(
            state.containers.contains_key(container),
            "container '{container}' does not exist"
        );
        state.staged.insert(
            (container.to_owned(), blob.to_owned(), block_id.to_owned()),
            data.to_vec(),
        );
        Ok(())
    }

    fn commit_block_list(
        &self,
        container: &str,
        blob: &str,
        block_ids: &[String],
        metadata: &Metadata,
    ) -> anyhow::Result<()> {
        self.count();
        let mut state = self.state.lock();
        anyhow::ensure!(
            state.containers.contains_key(container),
            "container '{container}' does not exist"
        );

        let mut data = Vec::new();
        for id in block_ids {
            let key = (container.to_owned(), blob.to_owned(), id.clone());
            let block = state
                .staged
                .get(&key)
                .ok_or_else(|| anyhow::anyhow!("block '{id}' was never staged"))?;
            data.extend_from_slice(block);
        }
        state
            .staged
            .retain(|(c, b, _), _| !(c == container && b == blob));
        state
            .containers
            .entry(container.to_owned())
            .or_default()
            .insert(
                blob.to_owned(),
                StoredBlob {
                    data,
                    metadata: metadata.clone(),
                },
            );
        Ok(())
    }

    fn get_blob(&self, container: &str, blob: &str) -> anyhow::Result<BlobDownload> {
        self.count();
        let stored = self
            .blob(container, blob)
            .ok_or_else(|| anyhow::anyhow!("blob '{container}/{blob}' does not exist"))?;
        Ok(BlobDownload {
            metadata: stored.metadata,
            body: Box::new(Cursor::new(stored.data)),
        })
    }
}

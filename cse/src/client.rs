//! Blob clients with transparent client-side encryption.
//!
//! Mirrors the service's client hierarchy: a [`BlobServiceClient`]
//! hands out [`ContainerClient`]s, which hand out [`BlobClient`]s. All
//! three share one store and one set of encryption options.

use std::{
    io::{Read, Write},
    sync::Arc,
};

use anyhow::Context;
use url::Url;

use crate::{
    cancel::CancellationToken,
    crypto::{
        DecryptError,
        envelope::{ContentLayout, EncryptionData},
        keys::Dek,
        legacy::{CbcDecryptor, IV_LEN},
        region::{self, DEFAULT_REGION_LEN, MAX_REGION_LEN},
    },
    kms::{KeyEncryptionKey, KeyResolver},
    storage::{BlobStore, azure::block_id},
};

#[derive(Clone)]
pub struct ClientSideEncryptionOptions {
    /// Wraps content keys on upload; unwraps them on download when the
    /// blob names this key.
    pub kek: Arc<dyn KeyEncryptionKey>,
    /// Finds the KEK for blobs wrapped under a different key id.
    pub resolver: Arc<dyn KeyResolver>,
    pub key_wrap_algorithm: String,
    /// Plaintext bytes per encrypted region (and per staged block).
    pub region_len: usize,
}

impl ClientSideEncryptionOptions {
    /// Options using the KEK's own default wrap algorithm.
    pub fn new(kek: Arc<dyn KeyEncryptionKey>, resolver: Arc<dyn KeyResolver>) -> Self {
        let key_wrap_algorithm = kek.default_algorithm().to_owned();
        Self {
            kek,
            resolver,
            key_wrap_algorithm,
            region_len: DEFAULT_REGION_LEN,
        }
    }

    pub fn key_wrap_algorithm(mut self, algorithm: impl Into<String>) -> Self {
        self.key_wrap_algorithm = algorithm.into();
        self
    }

    pub fn region_len(mut self, len: usize) -> Self {
        self.region_len = len;
        self
    }
}

pub struct BlobServiceClient {
    store: Arc<dyn BlobStore>,
    encryption: ClientSideEncryptionOptions,
}

impl BlobServiceClient {
    pub fn new(
        store: Arc<dyn BlobStore>,
        encryption: ClientSideEncryptionOptions,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            encryption.region_len > 0 && encryption.region_len <= MAX_REGION_LEN,
            "region length must be between 1 and {MAX_REGION_LEN} bytes"
        );
        Ok(Self { store, encryption })
    }

    pub fn container<'a>(&'a self, name: &'a str) -> ContainerClient<'a> {
        ContainerClient {
            service: self,
            name,
        }
    }
}

pub struct ContainerClient<'a> {
    service: &'a BlobServiceClient,
    name: &'a str,
}

impl<'a> ContainerClient<'a> {
    /// Returns `true` if the container was created by this call.
    pub fn create_if_not_exists(&self, cancel: &CancellationToken) -> anyhow::Result<bool> {
        cancel.check()?;
        let created = self.service.store.create_container_if_not_exists(self.name)?;
        if created {
            log::info!("created container '{}'", self.name);
        }
        Ok(created)
    }

    pub fn blob(&self, path: &'a str) -> BlobClient<'a> {
        BlobClient {
            service: self.service,
            container: self.name,
            path,
        }
    }
}

pub struct BlobClient<'a> {
    service: &'a BlobServiceClient,
    container: &'a str,
    path: &'a str,
}

impl BlobClient<'_> {
    fn store(&self) -> &dyn BlobStore {
        self.service.store.as_ref()
    }

    fn options(&self) -> &ClientSideEncryptionOptions {
        &self.service.encryption
    }

    /// Encrypt everything `source` yields into this blob, replacing any
    /// existing blob. One block is staged per region; nothing becomes
    /// visible until the final commit. Returns the plaintext length.
    pub fn upload(&self, source: &mut dyn Read, cancel: &CancellationToken) -> anyhow::Result<u64> {
        let options = self.options();
        let dek = Dek::generate()?;
        let encryption = EncryptionData::seal(
            &dek,
            options.kek.as_ref(),
            &options.key_wrap_algorithm,
            options.region_len,
        )
        .context("wrapping content key")?;

        let mut buf = vec![0u8; options.region_len];
        let mut block_ids = Vec::new();
        let mut total = 0u64;
        loop {
            let n = region::read_full(source, &mut buf).context("reading upload source")?;
            if n == 0 {
                break;
            }
            let sealed = region::encrypt_region(&dek, &buf[..n])?;
            let id = block_id(block_ids.len());
            cancel.check()?;
            self.store()
                .stage_block(self.container, self.path, &id, &sealed)
                .with_context(|| format!("staging block {}", block_ids.len()))?;
            block_ids.push(id);
            total += n as u64;
            if n < buf.len() {
                break;
            }
        }

        cancel.check()?;
        self.store()
            .commit_block_list(self.container, self.path, &block_ids, &encryption.to_metadata()?)
            .context("committing block list")?;
        log::info!(
            "uploaded {total} bytes to '{}/{}' in {} blocks",
            self.container,
            self.path,
            block_ids.len()
        );
        Ok(total)
    }

    /// Stream the decrypted blob into `sink`. Returns the plaintext
    /// length.
    pub fn download_to(
        &self,
        sink: &mut dyn Write,
        cancel: &CancellationToken,
    ) -> anyhow::Result<u64> {
        cancel.check()?;
        let mut download = self.store().get_blob(self.container, self.path)?;
        let encryption = EncryptionData::from_metadata(&download.metadata)?;
        let layout = encryption.layout()?;
        let kek = self.kek_for(&encryption.wrapped_content_key.key_id, cancel)?;
        let dek = encryption.open(kek.as_ref())?;

        let total = match layout {
            ContentLayout::Regions { region_len } => {
                read_regions(&dek, region_len, &mut download.body, sink, cancel)?
            }
            ContentLayout::Cbc { iv } => read_cbc(&dek, &iv, &mut download.body, sink, cancel)?,
        };
        sink.flush().context("writing decrypted content")?;
        log::info!("downloaded {total} bytes from '{}/{}'", self.container, self.path);
        Ok(total)
    }

    /// The configured KEK if the blob names it, otherwise whatever the
    /// resolver finds for the blob's key id. Only key ids from the
    /// configured KEK's own vault (or key file directory) are resolved.
    fn kek_for(
        &self,
        key_id: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Arc<dyn KeyEncryptionKey>> {
        let options = self.options();
        if key_id == options.kek.kid() {
            return Ok(options.kek.clone());
        }
        let named = Url::parse(key_id).map_err(|e| {
            DecryptError(format!("invalid key id '{key_id}' in blob metadata: {e}"))
        })?;
        if !same_key_source(options.kek.kid(), &named) {
            return Err(DecryptError(format!(
                "blob names key '{key_id}', which is not in the same place as '{}'",
                options.kek.kid()
            ))
            .into());
        }
        log::info!("blob was wrapped under '{key_id}', resolving it");
        options
            .resolver
            .resolve(&named, cancel)
            .with_context(|| format!("resolving key '{key_id}' named by the blob"))
    }
}

/// Ciphertext bytes read per step of a protocol 1.0 download.
const CBC_CHUNK_LEN: usize = 64 * 1024;

fn read_regions(
    dek: &Dek,
    region_len: usize,
    body: &mut dyn Read,
    sink: &mut dyn Write,
    cancel: &CancellationToken,
) -> anyhow::Result<u64> {
    let mut buf = vec![0u8; region::sealed_len(region_len)];
    let mut total = 0u64;
    loop {
        cancel.check()?;
        let n = region::read_full(body, &mut buf).context("reading blob content")?;
        if n == 0 {
            break;
        }
        let plaintext = region::decrypt_region(dek, &buf[..n])?;
        sink.write_all(&plaintext).context("writing decrypted content")?;
        total += plaintext.len() as u64;
        if n < buf.len() {
            break;
        }
    }
    Ok(total)
}

fn read_cbc(
    dek: &Dek,
    iv: &[u8; IV_LEN],
    body: &mut dyn Read,
    sink: &mut dyn Write,
    cancel: &CancellationToken,
) -> anyhow::Result<u64> {
    let mut decryptor = CbcDecryptor::new(dek, iv)?;
    let mut buf = vec![0u8; CBC_CHUNK_LEN];
    let mut total = 0u64;
    loop {
        cancel.check()?;
        let n = region::read_full(body, &mut buf).context("reading blob content")?;
        if n == 0 {
            break;
        }
        let plaintext = decryptor.update(&buf[..n]);
        sink.write_all(&plaintext).context("writing decrypted content")?;
        total += plaintext.len() as u64;
    }
    let tail = decryptor.finish()?;
    sink.write_all(&tail).context("writing decrypted content")?;
    Ok(total + tail.len() as u64)
}

/// Whether a key id found in blob metadata lives next to the configured
/// KEK: the same `https` host, or a `file` in the same directory.
fn same_key_source(configured: &str, named: &Url) -> bool {
    let Ok(configured) = Url::parse(configured) else {
        return false;
    };
    if configured.scheme() != named.scheme() {
        return false;
    }
    match named.scheme() {
        "https" => {
            named.host_str().is_some()
                && configured.host_str() == named.host_str()
                && configured.port_or_known_default() == named.port_or_known_default()
        }
        "file" => match (configured.to_file_path(), named.to_file_path()) {
            (Ok(configured), Ok(named)) => {
                configured.parent().is_some() && configured.parent() == named.parent()
            }
            _ => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, io};

    use aes::Aes256;
    use base64::{Engine, engine::general_purpose::STANDARD};
    use cbc::cipher::{BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
    use parking_lot::Mutex;

    use super::*;
    use crate::{
        cancel::is_cancelled,
        crypto::{envelope::METADATA_KEY, is_decrypt_error},
        kms::local::{A256GCM, LocalKeyResolver, SymmetricKey},
        storage::{BlobDownload, Metadata, memory::MemoryBlobStore},
    };

    fn options(key: u8) -> ClientSideEncryptionOptions {
        let kek = Arc::new(SymmetricKey::new("file:///tmp/kek", vec![key; 32]).unwrap());
        ClientSideEncryptionOptions::new(kek, Arc::new(LocalKeyResolver))
    }

    fn client(
        store: &Arc<MemoryBlobStore>,
        options: ClientSideEncryptionOptions,
    ) -> BlobServiceClient {
        BlobServiceClient::new(store.clone(), options).unwrap()
    }

    fn upload(service: &BlobServiceClient, data: &[u8]) {
        let token = CancellationToken::new();
        let container = service.container("docs");
        container.create_if_not_exists(&token).unwrap();
        container.blob("a/b.bin").upload(&mut &data[..], &token).unwrap();
    }

    fn download(service: &BlobServiceClient) -> anyhow::Result<Vec<u8>> {
        let mut out = Vec::new();
        service
            .container("docs")
            .blob("a/b.bin")
            .download_to(&mut out, &CancellationToken::new())?;
        Ok(out)
    }

    #[test]
    fn multi_region_round_trip() {
        let store = Arc::new(MemoryBlobStore::new());
        let service = client(&store, options(1).region_len(16));
        let data: Vec<u8> = (0..=255u8).cycle().take(100).collect();
        upload(&service, &data);

        let stored = store.blob("docs", "a/b.bin").unwrap();
        // 6 full regions of 16 plus one of 4, each with 28 bytes overhead.
        assert_eq!(stored.data.len(), 100 + 7 * 28);
        assert!(stored.metadata.contains_key(METADATA_KEY));
        assert_eq!(download(&service).unwrap(), data);
    }

    #[test]
    fn exact_multiple_of_region() {
        let store = Arc::new(MemoryBlobStore::new());
        let service = client(&store, options(1).region_len(16));
        let data = vec![0x5a; 32];
        upload(&service, &data);
        assert_eq!(store.blob("docs", "a/b.bin").unwrap().data.len(), 2 * (16 + 28));
        assert_eq!(download(&service).unwrap(), data);
    }

    #[test]
    fn empty_blob() {
        let store = Arc::new(MemoryBlobStore::new());
        let service = client(&store, options(1));
        upload(&service, b"");
        assert!(store.blob("docs", "a/b.bin").unwrap().data.is_empty());
        assert_eq!(download(&service).unwrap(), b"");
    }

    #[test]
    fn wrong_kek_is_decrypt_error() {
        let store = Arc::new(MemoryBlobStore::new());
        upload(&client(&store, options(1)), b"secret");
        let err = download(&client(&store, options(2))).unwrap_err();
        assert!(is_decrypt_error(&err), "{err:#}");
    }

    #[test]
    fn tampered_content_is_decrypt_error() {
        let store = Arc::new(MemoryBlobStore::new());
        let service = client(&store, options(1));
        upload(&service, b"secret");
        let mut stored = store.blob("docs", "a/b.bin").unwrap();
        let last = stored.data.len() - 1;
        stored.data[last] ^= 0x80;
        store.put_raw("docs", "a/b.bin", stored.data, stored.metadata);
        assert!(is_decrypt_error(&download(&service).unwrap_err()));
    }

    #[test]
    fn plain_blob_is_decrypt_error() {
        let store = Arc::new(MemoryBlobStore::new());
        store.put_raw("docs", "a/b.bin", b"plaintext".to_vec(), BTreeMap::new());
        let err = download(&client(&store, options(1))).unwrap_err();
        assert!(is_decrypt_error(&err));
    }

    #[test]
    fn resolves_other_key_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.key");
        std::fs::write(&path, [3u8; 32]).unwrap();
        let old_url = Url::from_file_path(&path).unwrap();
        let old_kek = LocalKeyResolver
            .resolve(&old_url, &CancellationToken::new())
            .unwrap();

        let store = Arc::new(MemoryBlobStore::new());
        let writer = client(
            &store,
            ClientSideEncryptionOptions::new(old_kek, Arc::new(LocalKeyResolver)),
        );
        upload(&writer, b"written under the old key");

        // Reader is configured with a different KEK but can resolve the old one.
        let current = Url::from_file_path(dir.path().join("current.key")).unwrap();
        let current_kek = Arc::new(SymmetricKey::new(current.as_str(), vec![9u8; 32]).unwrap());
        let reader = client(
            &store,
            ClientSideEncryptionOptions::new(current_kek, Arc::new(LocalKeyResolver)),
        );
        assert_eq!(download(&reader).unwrap(), b"written under the old key");
    }

    #[test]
    fn cancelled_upload_commits_nothing() {
        let store = Arc::new(MemoryBlobStore::new());
        let service = client(&store, options(1));
        let container = service.container("docs");
        container.create_if_not_exists(&CancellationToken::new()).unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let err = container
            .blob("a/b.bin")
            .upload(&mut &b"data"[..], &token)
            .unwrap_err();
        assert!(is_cancelled(&err));
        assert!(store.blob("docs", "a/b.bin").is_none());
    }

    #[test]
    fn rejects_zero_region_len() {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        assert!(BlobServiceClient::new(store, options(1).region_len(0)).is_err());
    }

    /// Records every key id it is asked for and resolves none.
    #[derive(Default)]
    struct RecordingResolver {
        calls: Mutex<Vec<String>>,
    }

    impl KeyResolver for RecordingResolver {
        fn resolve(
            &self,
            key_id: &Url,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<Arc<dyn KeyEncryptionKey>> {
            self.calls.lock().push(key_id.to_string());
            anyhow::bail!("no such key")
        }
    }

    const VAULT_KID: &str = "https://myvault.vault.azure.net/secrets/kek/v1";

    fn rename_blob_key(store: &MemoryBlobStore, key_id: &str) {
        let stored = store.blob("docs", "a/b.bin").unwrap();
        let mut encryption = EncryptionData::from_metadata(&stored.metadata).unwrap();
        encryption.wrapped_content_key.key_id = key_id.to_owned();
        store.put_raw("docs", "a/b.bin", stored.data, encryption.to_metadata().unwrap());
    }

    fn vault_service(
        store: &Arc<MemoryBlobStore>,
        resolver: &Arc<RecordingResolver>,
    ) -> BlobServiceClient {
        let kek = Arc::new(SymmetricKey::new(VAULT_KID, vec![4u8; 32]).unwrap());
        client(store, ClientSideEncryptionOptions::new(kek, resolver.clone()))
    }

    #[test]
    fn foreign_key_host_is_never_resolved() {
        let store = Arc::new(MemoryBlobStore::new());
        let resolver = Arc::new(RecordingResolver::default());
        let service = vault_service(&store, &resolver);
        upload(&service, b"secret");

        rename_blob_key(&store, "https://attacker.example.com/keys/steal");
        let err = download(&service).unwrap_err();
        assert!(is_decrypt_error(&err), "{err:#}");
        assert!(resolver.calls.lock().is_empty());
    }

    #[test]
    fn other_version_in_same_vault_is_resolved() {
        let store = Arc::new(MemoryBlobStore::new());
        let resolver = Arc::new(RecordingResolver::default());
        let service = vault_service(&store, &resolver);
        upload(&service, b"secret");

        rename_blob_key(&store, "https://myvault.vault.azure.net/secrets/kek/v0");
        assert!(download(&service).is_err());
        assert_eq!(
            *resolver.calls.lock(),
            vec!["https://myvault.vault.azure.net/secrets/kek/v0".to_owned()]
        );
    }

    #[test]
    fn key_sources_must_match() {
        let url = |s: &str| Url::parse(s).unwrap();
        assert!(same_key_source(VAULT_KID, &url("https://myvault.vault.azure.net/keys/other")));
        assert!(!same_key_source(VAULT_KID, &url("https://evil.vault.azure.net/keys/kek")));
        assert!(!same_key_source(VAULT_KID, &url("https://myvault.vault.azure.net:8443/keys/k")));
        assert!(!same_key_source(VAULT_KID, &url("file:///keys/kek")));
        assert!(same_key_source("file:///keys/a.key", &url("file:///keys/b.key")));
        assert!(!same_key_source("file:///keys/a.key", &url("file:///dev/zero")));
        assert!(!same_key_source("file:///keys/a.key", &url("file:///keys/../dev/zero")));
    }

    /// Cancels its token as soon as any blob content has been read.
    struct CancelOnRead {
        body: Box<dyn Read + Send>,
        cancel: CancellationToken,
    }

    impl Read for CancelOnRead {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.body.read(buf)?;
            self.cancel.cancel();
            Ok(n)
        }
    }

    struct CancelOnDownload {
        inner: Arc<MemoryBlobStore>,
        cancel: CancellationToken,
    }

    impl BlobStore for CancelOnDownload {
        fn create_container_if_not_exists(&self, container: &str) -> anyhow::Result<bool> {
            self.inner.create_container_if_not_exists(container)
        }

        fn stage_block(
            &self,
            container: &str,
            blob: &str,
            block_id: &str,
            data: &[u8],
        ) -> anyhow::Result<()> {
            self.inner.stage_block(container, blob, block_id, data)
        }

        fn commit_block_list(
            &self,
            container: &str,
            blob: &str,
            block_ids: &[String],
            metadata: &Metadata,
        ) -> anyhow::Result<()> {
            self.inner.commit_block_list(container, blob, block_ids, metadata)
        }

        fn get_blob(&self, container: &str, blob: &str) -> anyhow::Result<BlobDownload> {
            let download = self.inner.get_blob(container, blob)?;
            Ok(BlobDownload {
                metadata: download.metadata,
                body: Box::new(CancelOnRead {
                    body: download.body,
                    cancel: self.cancel.clone(),
                }),
            })
        }
    }

    #[test]
    fn cancelled_download_stops_between_regions() {
        let memory = Arc::new(MemoryBlobStore::new());
        upload(&client(&memory, options(1).region_len(16)), &[0x33; 100]);

        let cancel = CancellationToken::new();
        let store: Arc<dyn BlobStore> = Arc::new(CancelOnDownload {
            inner: memory,
            cancel: cancel.clone(),
        });
        let service = BlobServiceClient::new(store, options(1).region_len(16)).unwrap();
        let mut out = Vec::new();
        let err = service
            .container("docs")
            .blob("a/b.bin")
            .download_to(&mut out, &cancel)
            .unwrap_err();
        assert!(is_cancelled(&err));
        assert_eq!(out, vec![0x33; 16]);
    }

    fn put_v1_blob(store: &MemoryBlobStore, kek: &SymmetricKey, plaintext: &[u8]) {
        let dek = Dek::generate().unwrap();
        let iv = [0x2a; IV_LEN];
        let ciphertext = cbc::Encryptor::<Aes256>::new_from_slices(dek.as_bytes(), &iv)
            .unwrap()
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);
        let wrapped = kek.wrap_key(A256GCM, dek.as_bytes()).unwrap();
        let encryption = serde_json::json!({
            "EncryptionMode": "FullBlob",
            "WrappedContentKey": {
                "KeyId": kek.kid(),
                "EncryptedKey": STANDARD.encode(wrapped),
                "Algorithm": A256GCM,
            },
            "EncryptionAgent": {"Protocol": "1.0", "EncryptionAlgorithm": "AES_CBC_256"},
            "ContentEncryptionIV": STANDARD.encode(iv),
            "KeyWrappingMetadata": {"EncryptionLibrary": ".NET 12.13.0"},
        });
        let mut metadata = BTreeMap::new();
        metadata.insert(METADATA_KEY.to_owned(), encryption.to_string());
        store.put_raw("docs", "a/b.bin", ciphertext, metadata);
    }

    #[test]
    fn reads_protocol_1_blobs() {
        let store = Arc::new(MemoryBlobStore::new());
        let kek = SymmetricKey::new("file:///tmp/kek", vec![1u8; 32]).unwrap();
        let plaintext: Vec<u8> = (0..200_000u32).map(|i| (i % 253) as u8).collect();
        put_v1_blob(&store, &kek, &plaintext);

        assert_eq!(download(&client(&store, options(1))).unwrap(), plaintext);
    }

    #[test]
    fn truncated_protocol_1_blob_is_decrypt_error() {
        let store = Arc::new(MemoryBlobStore::new());
        let kek = SymmetricKey::new("file:///tmp/kek", vec![1u8; 32]).unwrap();
        put_v1_blob(&store, &kek, b"written by an older client");
        let mut stored = store.blob("docs", "a/b.bin").unwrap();
        stored.data.truncate(stored.data.len() - 5);
        store.put_raw("docs", "a/b.bin", stored.data, stored.metadata);

        assert!(is_decrypt_error(&download(&client(&store, options(1))).unwrap_err()));
    }
}

use std::path::PathBuf;

use blobcrypt_cse::kms::vault::DEFAULT_API_VERSION;
use clap::Parser;
use url::Url;

use crate::runner::Invocation;

/// Uploads a file using client-side encryption, or downloads and prints
/// an existing path using client-side decryption.
#[derive(Parser, Debug)]
#[command(name = "blobcrypt")]
#[command(version)]
pub struct Cli {
    /// The URI to a Key Vault key or secret (or a file:// key file)
    /// holding the key-encryption key
    #[arg(long, env = "BLOBCRYPT_KEY_ID", value_name = "URI")]
    pub key_id: Url,

    /// The connection string to the storage account
    #[arg(
        long,
        env = "AZURE_STORAGE_CONNECTION_STRING",
        hide_env_values = true,
        value_name = "STRING"
    )]
    pub connection_string: String,

    /// The name of the blob container
    #[arg(long)]
    pub container: String,

    /// The path within the container to upload or download
    #[arg(long)]
    pub path: String,

    /// The local path of a file to encrypt and upload; omit to download
    /// and decrypt to stdout
    #[arg(long, value_name = "FILE")]
    pub file: Option<PathBuf>,

    /// Key wrap algorithm, overriding the key's default
    /// (RSA-OAEP-256 for RSA keys, A256GCM for secrets and key files)
    #[arg(long, value_name = "ALG")]
    pub key_wrap_algorithm: Option<String>,

    /// Key Vault REST API version
    #[arg(long, default_value = DEFAULT_API_VERSION, value_name = "VERSION")]
    pub vault_api_version: String,
}

impl Cli {
    pub fn invocation(&self) -> Invocation {
        Invocation {
            key_id: self.key_id.clone(),
            container: self.container.clone(),
            path: self.path.clone(),
            file: self.file.clone(),
            key_wrap_algorithm: self.key_wrap_algorithm.clone(),
        }
    }
}

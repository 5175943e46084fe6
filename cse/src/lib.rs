//! Client-side envelope encryption for Azure Blob Storage.
//!
//! Content is encrypted locally under a random per-blob data key
//! (DEK); the DEK is wrapped by a key-encryption key (KEK) resolved
//! from Key Vault (or a local key file) and stored next to the blob in
//! its `encryptiondata` metadata entry.

pub mod cancel;
pub mod client;
pub mod credential;
pub mod crypto;
mod http;
pub mod kms;
pub mod storage;

pub use cancel::{CancellationToken, Cancelled};
pub use client::{BlobClient, BlobServiceClient, ClientSideEncryptionOptions, ContainerClient};
pub use http::ServiceError;

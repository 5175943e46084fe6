//! The command runner: resolve the KEK, build the encrypting client,
//! then run exactly one of upload or download.

use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use blobcrypt_cse::{
    BlobServiceClient, CancellationToken, ClientSideEncryptionOptions,
    cancel::is_cancelled,
    crypto::is_decrypt_error,
    kms::KeyResolver,
    storage::BlobStore,
};
use url::Url;

use crate::error::Error;

/// Everything one run needs besides its collaborators.
#[derive(Clone, Debug)]
pub struct Invocation {
    pub key_id: Url,
    pub container: String,
    pub path: String,
    /// Upload this file; download to stdout when absent.
    pub file: Option<PathBuf>,
    /// Overrides the KEK's default wrap algorithm.
    pub key_wrap_algorithm: Option<String>,
}

impl Invocation {
    fn target(&self) -> String {
        format!("{}/{}", self.container, self.path)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Downloaded { bytes: u64 },
    Uploaded { bytes: u64 },
}

/// Run one upload or download.
///
/// Stages run strictly in order: open the local file (upload only),
/// resolve the KEK, `connect` to the store, transfer. Status lines go
/// to `status`; only decrypted blob bytes go to `output`.
pub fn run<C>(
    invocation: &Invocation,
    resolver: Arc<dyn KeyResolver>,
    connect: C,
    cancel: &CancellationToken,
    output: &mut dyn Write,
    status: &mut dyn Write,
) -> Result<Outcome, Error>
where
    C: FnOnce() -> anyhow::Result<Arc<dyn BlobStore>>,
{
    // Local I/O problems surface before any network call.
    let source = match &invocation.file {
        Some(path) => {
            let file = File::open(path).map_err(|source| Error::LocalIo {
                path: path.clone(),
                source,
            })?;
            Some((display_path(path), file))
        }
        None => None,
    };

    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let kek = resolver
        .resolve(&invocation.key_id, cancel)
        .map_err(|e| {
            classify(e, |source| Error::Resolution {
                key_id: invocation.key_id.to_string(),
                source,
            })
        })?;
    log::info!("resolved KEK {}", kek.kid());

    let store = connect().map_err(Error::Configuration)?;
    let mut options = ClientSideEncryptionOptions::new(kek, resolver);
    if let Some(algorithm) = &invocation.key_wrap_algorithm {
        options = options.key_wrap_algorithm(algorithm.as_str());
    }
    let service = BlobServiceClient::new(store, options).map_err(Error::Configuration)?;
    let container = service.container(&invocation.container);
    let blob = container.blob(&invocation.path);
    let target = invocation.target();

    match source {
        None => {
            writeln!(status, "Downloading '{target}'...").map_err(Error::Output)?;
            let bytes = blob.download_to(output, cancel).map_err(|e| {
                classify(e, |source| {
                    if is_decrypt_error(&source) {
                        Error::Decryption {
                            target: target.clone(),
                            source,
                        }
                    } else {
                        Error::Transfer {
                            target: target.clone(),
                            source,
                        }
                    }
                })
            })?;
            Ok(Outcome::Downloaded { bytes })
        }
        Some((display, mut file)) => {
            writeln!(status, "Uploading '{display}' to '{target}'...").map_err(Error::Output)?;
            container.create_if_not_exists(cancel).map_err(|e| {
                classify(e, |source| Error::Container {
                    container: invocation.container.clone(),
                    source,
                })
            })?;
            let bytes = blob.upload(&mut file, cancel).map_err(|e| {
                classify(e, |source| Error::Transfer {
                    target: target.clone(),
                    source,
                })
            })?;
            writeln!(status, "Done").map_err(Error::Output)?;
            Ok(Outcome::Uploaded { bytes })
        }
    }
}

fn classify(err: anyhow::Error, otherwise: impl FnOnce(anyhow::Error) -> Error) -> Error {
    if is_cancelled(&err) {
        Error::Cancelled
    } else {
        otherwise(err)
    }
}

fn display_path(path: &Path) -> String {
    std::path::absolute(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

#[cfg(test)]
mod tests {
    use blobcrypt_cse::{Cancelled, crypto::DecryptError};

    use super::*;

    fn transfer(source: anyhow::Error) -> Error {
        Error::Transfer {
            target: "c/p".into(),
            source,
        }
    }

    #[test]
    fn cancellation_wins_over_stage() {
        let err = anyhow::Error::new(Cancelled).context("staging block 3");
        assert!(matches!(classify(err, transfer), Error::Cancelled));
    }

    #[test]
    fn other_errors_keep_their_stage() {
        let err = anyhow::Error::new(DecryptError("tag mismatch".into()));
        assert!(matches!(classify(err, transfer), Error::Transfer { .. }));
    }

    #[test]
    fn relative_paths_are_shown_absolute() {
        let shown = display_path(Path::new("report.pdf"));
        assert!(Path::new(&shown).is_absolute());
        assert!(shown.ends_with("report.pdf"));
    }
}

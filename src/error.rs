use std::path::PathBuf;

/// Why a run stopped, by stage. Every variant except [`Error::Cancelled`]
/// is a failure; none is retried.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot read '{}'", path.display())]
    LocalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to resolve key '{key_id}'")]
    Resolution {
        key_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid storage configuration")]
    Configuration(#[source] anyhow::Error),

    #[error("failed to create container '{container}'")]
    Container {
        container: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("transfer of '{target}' failed")]
    Transfer {
        target: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("cannot decrypt '{target}'")]
    Decryption {
        target: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to write status output")]
    Output(#[source] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Cancellation is an expected way for a run to end.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_cancelled() { 0 } else { 1 }
    }
}

use std::{io, process::ExitCode, sync::Arc};

use blobcrypt::{Error, Outcome, cli::Cli, interrupt, runner};
use blobcrypt_cse::{
    CancellationToken,
    credential::{DefaultCredential, TokenCredential},
    kms::{DefaultKeyResolver, KeyResolver, vault::KeyVaultResolver},
    storage::{BlobStore, azure::AzureBlobStore},
};
use clap::Parser;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    if let Err(e) = interrupt::install(cancel.clone()) {
        eprintln!("Error: {e:#}");
        return ExitCode::FAILURE;
    }

    match execute(&cli, &cancel) {
        Ok(Outcome::Downloaded { bytes }) => {
            log::info!("downloaded {bytes} bytes");
            ExitCode::SUCCESS
        }
        Ok(Outcome::Uploaded { bytes }) => {
            log::info!("uploaded {bytes} bytes");
            ExitCode::SUCCESS
        }
        Err(Error::Cancelled) => {
            log::info!("cancelled");
            ExitCode::SUCCESS
        }
        Err(e) => {
            let code = e.exit_code() as u8;
            eprintln!("Error: {:#}", anyhow::Error::from(e));
            ExitCode::from(code)
        }
    }
}

fn execute(cli: &Cli, cancel: &CancellationToken) -> Result<Outcome, Error> {
    let credential: Arc<dyn TokenCredential> = Arc::new(DefaultCredential::new());
    let vault = KeyVaultResolver::with_api_version(credential, cli.vault_api_version.as_str());
    let resolver: Arc<dyn KeyResolver> = Arc::new(DefaultKeyResolver::new(vault));

    let connect = || -> anyhow::Result<Arc<dyn BlobStore>> {
        Ok(Arc::new(AzureBlobStore::from_connection_string(
            &cli.connection_string,
        )?))
    };

    let mut stdout = io::stdout().lock();
    let mut stderr = io::stderr();
    runner::run(
        &cli.invocation(),
        resolver,
        connect,
        cancel,
        &mut stdout,
        &mut stderr,
    )
}

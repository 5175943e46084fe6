use std::io::Write;

use anyhow::Context;
use blobcrypt_cse::CancellationToken;

/// Route Ctrl-C into `token` for the rest of the process. The signal no
/// longer terminates the process; the running transfer notices the
/// token and unwinds instead.
pub fn install(token: CancellationToken) -> anyhow::Result<()> {
    ctrlc::set_handler(move || {
        on_interrupt(&token, &mut std::io::stderr());
    })
    .context("failed to set up interrupt handler")?;
    log::debug!("interrupt handler installed");
    Ok(())
}

/// Cancel `token`, announcing it on `status` the first time only.
pub fn on_interrupt(token: &CancellationToken, status: &mut dyn Write) -> bool {
    if token.cancel() {
        let _ = writeln!(status, "Cancelling...");
        true
    } else {
        log::debug!("interrupt received again while cancelling");
        false
    }
}

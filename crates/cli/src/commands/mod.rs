//! Subcommand implementations

pub mod benchmark;
pub mod control;
pub mod load;
pub mod policy;

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Token cancelled on Ctrl-C
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let signalled = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(event = "shutdown_requested", "SIGINT received");
            signalled.cancel();
        }
    });
    token
}

/// Cancel `token` after `after`, if given
pub fn cancel_after(token: &CancellationToken, after: Option<std::time::Duration>) {
    if let Some(after) = after {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            token.cancel();
        });
    }
}

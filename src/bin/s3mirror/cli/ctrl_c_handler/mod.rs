use tokio::task::JoinHandle;
use tokio::{select, signal};
use tracing::{debug, error, warn};

use s3mirror::types::token::SyncCancellationToken;

/// Cancels the sync on SIGINT. Partially uploaded multipart sessions stay resumable.
pub fn spawn_ctrl_c_handler(cancellation_token: SyncCancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        select! {
            _ = cancellation_token.cancelled() => {
                debug!("cancellation_token canceled.")
            }
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => {
                        warn!("ctrl-c received, cancelling the sync.");
                        cancellation_token.cancel();
                    }
                    Err(e) => {
                        error!(error = e.to_string(), "failed to listen for ctrl-c signal.");
                    }
                }
            }
        }
    })
}

//! Reload: rebuild and republish the authorization table on request.

use anyhow::Result;
use tokio::sync::mpsc;

use crate::auth::{ConfigLoader, TableHandle};

/// Reload the table once per request until every sender is gone. Failures are logged and
/// leave the published table in place.
pub async fn run_reload_loop(loader: ConfigLoader, table: TableHandle, mut requests: mpsc::Receiver<()>) {
    while requests.recv().await.is_some() {
        match loader.reload(&table) {
            Ok(()) => log::info!("reload: config reloaded from {}", loader.path().display()),
            Err(e) => log::warn!("reload: failed to reload config, keeping previous table: {:#}", e),
        }
    }
    log::debug!("reload: request channel closed");
}

/// Take over SIGUSR1, whose default action would terminate the process. With a sender each
/// signal becomes a reload request; without one the signal is logged and ignored.
#[cfg(unix)]
pub fn forward_reload_signal(tx: Option<mpsc::Sender<()>>) -> Result<()> {
    use anyhow::Context;
    use tokio::signal::unix::{signal, SignalKind};
    use tokio::sync::mpsc::error::TrySendError;

    let mut sigusr1 = signal(SignalKind::user_defined1()).context("installing SIGUSR1 handler")?;
    tokio::spawn(async move {
        while sigusr1.recv().await.is_some() {
            let Some(tx) = &tx else {
                log::info!("reload: SIGUSR1 received, reload disabled, ignoring");
                continue;
            };
            log::info!("reload: SIGUSR1 received");
            match tx.try_send(()) {
                Ok(()) | Err(TrySendError::Full(())) => {}
                Err(TrySendError::Closed(())) => log::warn!("reload: reload loop is gone, ignoring SIGUSR1"),
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
pub fn forward_reload_signal(_tx: Option<mpsc::Sender<()>>) -> Result<()> {
    log::warn!("reload: no reload signal on this platform");
    Ok(())
}

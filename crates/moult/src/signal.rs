//! Translate an OS signal into upgrade attempts.

use std::io;

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::upgrader::Upgrader;

/// Run one [`Upgrader::upgrade`] for every delivery of `kind` (conventionally
/// `SIGHUP`) until the upgrader's exit fires.
///
/// The handler is registered before this returns. Each attempt runs on its own
/// task, so a signal arriving mid-upgrade observes `UpgradeInProgress` instead
/// of queueing.
pub fn upgrade_on_signal(upgrader: Upgrader, kind: SignalKind) -> io::Result<JoinHandle<()>> {
    let mut signals = signal(kind)?;
    let exit = upgrader.exit_token();
    let signo = kind.as_raw_value();

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = exit.cancelled() => {
                    debug!(signal = signo, "Exit fired, no longer listening for upgrade signals");
                    break;
                }
                received = signals.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!(signal = signo, "Received upgrade signal");
                    let upgrader = upgrader.clone();
                    tokio::spawn(async move {
                        match upgrader.upgrade().await {
                            Ok(()) => debug!("Signal-triggered upgrade completed"),
                            Err(err) if err.is_upgrade_failure() => {
                                warn!(error = %err, "Signal-triggered upgrade did not happen");
                            }
                            Err(err) => error!(error = %err, "Signal-triggered upgrade failed"),
                        }
                    });
                }
            }
        }
    }))
}

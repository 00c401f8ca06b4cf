//! # OS signal handling for [`Engine::run`](crate::Engine::run).
//!
//! **Unix:** `SIGINT`, `SIGTERM`, `SIGQUIT` and Ctrl-C.
//! **Other platforms:** Ctrl-C via [`tokio::signal::ctrl_c`].

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::events::{Bus, Event, EventKind};

/// Waits for a termination signal.
///
/// Returns `Err` if signal registration fails.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv()  => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

/// Waits for a termination signal.
///
/// Returns `Err` if signal registration fails.
#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Cancels `token` on the first termination signal, publishing `ShutdownRequested`.
///
/// The watcher exits quietly if `token` is cancelled first.
pub(crate) fn spawn_signal_watcher(bus: Bus, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            res = wait_for_shutdown_signal() => match res {
                Ok(()) => {
                    bus.publish(Event::new(EventKind::ShutdownRequested));
                    token.cancel();
                }
                Err(e) => warn!(error = %e, "failed to install signal handlers; cancel the engine explicitly"),
            },
        }
    })
}

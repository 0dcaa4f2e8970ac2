//! `SIGTERM`/`SIGINT` drive the `watch` channel every long-running
//! subcommand's accept loop already polls (`LmtpServer::run`,
//! `FudServer::run`); `SIGUSR1` is the reload signal, carried over from
//! the old generation's PID-file-and-`kill` convention (`reload()` in
//! the previous `main.rs`) but polled here instead of acted on
//! in-place, since none of the daemons hold config behind a handle
//! that can be hot-swapped yet.

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

/// Spawns a task that flips `must_exit` to `true` on `SIGTERM` or
/// `SIGINT`, and logs (without acting on it yet) every `SIGUSR1`.
/// Returns the receiving end for the caller's accept loop.
pub fn install(daemon: &'static str) -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        let mut int = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGINT handler");
                return;
            }
        };
        let mut usr1 = match signal(SignalKind::user_defined1()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGUSR1 handler");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = term.recv() => {
                    tracing::info!(daemon, "received SIGTERM, draining");
                    let _ = tx.send(true);
                    break;
                }
                _ = int.recv() => {
                    tracing::info!(daemon, "received SIGINT, draining");
                    let _ = tx.send(true);
                    break;
                }
                _ = usr1.recv() => {
                    tracing::info!(daemon, "received SIGUSR1; config reload is not yet hot-swappable, restart to pick up changes");
                }
            }
        }
    });

    rx
}

//! Turns SIGINT / SIGTERM into a shutdown request.

use radarlink_core::Shutdown;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Install signal listeners that request `shutdown`.
///
/// Repeated signals are harmless; only the first one is logged at info.
///
/// # Errors
///
/// Returns an error if a signal handler cannot be registered.
#[cfg(unix)]
pub fn install(shutdown: Shutdown) -> std::io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                Some(()) = sigint.recv() => "SIGINT",
                Some(()) = sigterm.recv() => "SIGTERM",
                else => break,
            };
            notify(&shutdown, name);
        }
    }))
}

/// Install a Ctrl+C listener that requests `shutdown`.
///
/// # Errors
///
/// Never fails on this platform; the signature matches the Unix variant.
#[cfg(not(unix))]
pub fn install(shutdown: Shutdown) -> std::io::Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            notify(&shutdown, "Ctrl+C");
        }
    }))
}

fn notify(shutdown: &Shutdown, signal: &'static str) {
    if shutdown.request() {
        info!(signal, "Received signal, initiating shutdown");
    } else {
        debug!(signal, "Shutdown already in progress");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_install_does_not_request_shutdown() {
        let shutdown = Shutdown::new();
        let handle = install(shutdown.clone()).unwrap();
        tokio::task::yield_now().await;

        assert!(!shutdown.is_requested());
        handle.abort();
    }

    #[test]
    fn test_notify_is_idempotent() {
        let shutdown = Shutdown::new();
        notify(&shutdown, "SIGTERM");
        notify(&shutdown, "SIGINT");
        assert!(shutdown.is_requested());
    }
}

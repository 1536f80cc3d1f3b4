//! SIGINT / SIGTERM handling for one-shot and watch runs.
//!
//! The first signal cancels the run's token; stages stop before their next
//! page or batch and the result still carries what was counted. A second
//! signal exits with [`FORCED_EXIT_CODE`].

use std::sync::atomic::{AtomicU32, Ordering};

use tokio_util::sync::CancellationToken;

/// Exit code used when a second signal forces the process down.
pub const FORCED_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalOutcome {
    /// Token cancelled, in-flight batches finish.
    Drain,
    ForceExit,
}

/// Signal bookkeeping shared by the listener task.
#[derive(Debug)]
struct ShutdownLatch {
    token: CancellationToken,
    received: AtomicU32,
}

impl ShutdownLatch {
    fn new(token: CancellationToken) -> Self {
        Self {
            token,
            received: AtomicU32::new(0),
        }
    }

    fn on_signal(&self) -> SignalOutcome {
        if self.received.fetch_add(1, Ordering::SeqCst) == 0 {
            self.token.cancel();
            SignalOutcome::Drain
        } else {
            SignalOutcome::ForceExit
        }
    }
}

/// Install the listener and return the token it cancels.
pub(crate) fn install_signal_handler() -> anyhow::Result<CancellationToken> {
    let token = CancellationToken::new();

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("failed to register SIGTERM handler: {}", e))?;

    let latch = ShutdownLatch::new(token.clone());
    tokio::spawn(async move {
        loop {
            #[cfg(unix)]
            {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }

            #[cfg(not(unix))]
            {
                if tokio::signal::ctrl_c().await.is_err() {
                    tracing::warn!("Failed to listen for Ctrl+C, graceful shutdown disabled");
                    return;
                }
            }

            match latch.on_signal() {
                SignalOutcome::Drain => {
                    tracing::info!("Received shutdown signal, finishing in-flight batches...");
                    tracing::info!("Press Ctrl+C again to force exit");
                }
                SignalOutcome::ForceExit => {
                    tracing::warn!("Force exit requested");
                    std::process::exit(FORCED_EXIT_CODE);
                }
            }
        }
    });

    Ok(token)
}

//! Interrupt handling: the first signal asks for a graceful shutdown, enough
//! further signals force the process out.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// Start the graceful shutdown.
    Shutdown,
    /// Shutdown already running; this many more signals force an exit.
    Pending { remaining: usize },
    /// Give up on the graceful path.
    ForceExit,
}

#[derive(Debug)]
pub struct InterruptCounter {
    received: usize,
    threshold: usize,
}

impl InterruptCounter {
    /// `threshold` is the total number of signals that forces an exit.
    pub fn new(threshold: usize) -> Self {
        Self {
            received: 0,
            threshold: threshold.max(2),
        }
    }

    pub fn record(&mut self) -> SignalAction {
        self.received += 1;
        if self.received == 1 {
            SignalAction::Shutdown
        } else if self.received >= self.threshold {
            SignalAction::ForceExit
        } else {
            SignalAction::Pending {
                remaining: self.threshold - self.received,
            }
        }
    }
}

async fn next_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r,
            _ = term.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

/// Cancels `shutdown` on the first interrupt and exits the process once
/// `threshold` interrupts have arrived.
pub fn spawn_signal_handler(shutdown: CancellationToken, threshold: usize) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut counter = InterruptCounter::new(threshold);
        loop {
            if let Err(e) = next_signal().await {
                error!(error = %e, "failed to listen for signals");
                return;
            }
            match counter.record() {
                SignalAction::Shutdown => {
                    info!("interrupt received, saving state before exit");
                    shutdown.cancel();
                }
                SignalAction::Pending { remaining } => {
                    warn!(remaining, "shutdown in progress, interrupt again to force exit");
                }
                SignalAction::ForceExit => {
                    error!("forced exit, state may be inconsistent");
                    std::process::exit(130);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escalation() {
        let mut counter = InterruptCounter::new(3);
        assert_eq!(counter.record(), SignalAction::Shutdown);
        assert_eq!(counter.record(), SignalAction::Pending { remaining: 1 });
        assert_eq!(counter.record(), SignalAction::ForceExit);
    }

    #[test]
    fn test_threshold_floor() {
        let mut counter = InterruptCounter::new(0);
        assert_eq!(counter.record(), SignalAction::Shutdown);
        assert_eq!(counter.record(), SignalAction::ForceExit);
    }
}

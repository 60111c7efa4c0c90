use std::sync::Weak;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use super::manager::Inner;

/// Periodic expiry check for one active session.
///
/// Holds only a weak reference to the manager, so a dropped manager ends the
/// loop on its next tick even if nobody called `stop`.
pub(crate) struct ExpiryMonitor {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ExpiryMonitor {
    /// Spawn the loop on the current tokio runtime. Returns `None` outside a runtime.
    pub(crate) fn spawn(manager: Weak<Inner>, period: Duration) -> Option<Self> {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                debug!("No async runtime, background expiry check disabled");
                return None;
            }
        };

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let handle = runtime.spawn(async move {
            debug!(period_secs = period.as_secs(), "Background expiry check started");
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    // Err means the sender is gone, which is a stop as well
                    _ = shutdown_rx.changed() => break,
                }

                let Some(inner) = manager.upgrade() else {
                    break;
                };
                if !inner.run_expiry_check().await {
                    break;
                }
            }
            debug!("Background expiry check stopped");
        });

        Some(Self { shutdown, handle })
    }

    pub(crate) fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    pub(crate) fn stop(self) {
        let _ = self.shutdown.send(true);
        self.handle.abort();
    }
}

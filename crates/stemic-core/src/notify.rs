//! Sinks the session manager uses to reach the user interface.
//!
//! The manager only ever says two things to the UI: "show this message" and
//! "go to the login entry point". Both are fire-and-forget.

use anyhow::Result;
use tracing::warn;

/// Message shown to the user when a session ends without them asking
pub const SESSION_EXPIRED_MESSAGE: &str = "Your session has expired. Please sign in again.";

/// Displays user-visible messages. Delivery is best effort.
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str) -> Result<()>;
}

/// Moves the UI to the login entry point.
pub trait Navigator: Send + Sync {
    fn redirect_to_login(&self);
}

/// Notifier that only records the message in the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str) -> Result<()> {
        warn!(message, "Session notification");
        Ok(())
    }
}

/// Navigator for headless embeddings that have nowhere to go
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNavigator;

impl Navigator for NoopNavigator {
    fn redirect_to_login(&self) {}
}

//! # Platform Notifier
//!
//! Capability used to raise an OS-level notification for each new item.
//! The host injects an implementation; the link never owns the platform.
//!
//! ## Implementations
//! - [`NoOpNotifier`]: disabled capability (tests, headless hosts)
//! - [`ChannelNotifier`]: forwards title/body to the host over an mpsc channel

use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Platform notification capability.
pub trait PlatformNotifier: Send + Sync {
    /// Returns false when the capability is switched off.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Shows a notification.
    fn notify(&self, title: &str, body: &str);
}

/// No-op notifier for hosts without platform notifications.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpNotifier;

impl PlatformNotifier for NoOpNotifier {
    fn is_enabled(&self) -> bool {
        false
    }

    fn notify(&self, _title: &str, _body: &str) {}
}

/// A notification handed to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformAlert {
    pub title: String,
    pub body: String,
}

/// Forwards alerts to the host over a bounded channel.
///
/// Alerts are dropped when the host falls behind.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::Sender<PlatformAlert>,
    enabled: bool,
}

impl ChannelNotifier {
    /// Creates a notifier and the receiver the host drains.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<PlatformAlert>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (ChannelNotifier { tx, enabled: true }, rx)
    }

    /// Enables or disables forwarding.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

impl PlatformNotifier for ChannelNotifier {
    fn is_enabled(&self) -> bool {
        self.enabled && !self.tx.is_closed()
    }

    fn notify(&self, title: &str, body: &str) {
        let alert = PlatformAlert {
            title: title.to_string(),
            body: body.to_string(),
        };
        match self.tx.try_send(alert) {
            Ok(()) => debug!(title = %title, "Platform alert forwarded"),
            Err(e) => warn!(error = %e, "Dropping platform alert"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_is_disabled() {
        assert!(!NoOpNotifier.is_enabled());
        NoOpNotifier.notify("t", "b");
    }

    #[test]
    fn test_channel_notifier_forwards() {
        let (notifier, mut rx) = ChannelNotifier::new(4);
        assert!(notifier.is_enabled());
        notifier.notify("Class moved", "Yoga at 18:30");
        assert_eq!(
            rx.try_recv().unwrap(),
            PlatformAlert {
                title: "Class moved".into(),
                body: "Yoga at 18:30".into()
            }
        );
    }

    #[test]
    fn test_channel_notifier_disabled_when_receiver_gone() {
        let (notifier, rx) = ChannelNotifier::new(1);
        drop(rx);
        assert!(!notifier.is_enabled());

        let (notifier, _rx) = ChannelNotifier::new(1);
        assert!(!notifier.enabled(false).is_enabled());
    }
}

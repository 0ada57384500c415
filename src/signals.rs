//! Per-session control mailboxes addressed by token.
//!
//! Each session registers one mailbox when it starts and removes it during
//! cleanup. A mailbox carries:
//!
//! - a control channel for [`ControlSignal::Pause`] / [`ControlSignal::Resume`],
//!   consumed only by the resumable driver
//! - a one-shot listener-attached signal, deliverable from the moment the
//!   session exists, even before its first chunk
//!
//! The bus is owned by a [`Relay`](crate::Relay) and cloned into sessions;
//! there is no process-global listener map.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument};

/// External control signal for a session's upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Abort the current attempt, keeping the server-acknowledged offset.
    Pause,
    /// Start a new attempt from the server-acknowledged offset.
    Resume,
}

#[derive(Debug)]
struct Mailbox {
    control: mpsc::UnboundedSender<ControlSignal>,
    ready: Option<oneshot::Sender<()>>,
}

/// Receiving ends of a session's mailbox.
#[derive(Debug)]
pub(crate) struct MailboxReceivers {
    pub(crate) control: mpsc::UnboundedReceiver<ControlSignal>,
    pub(crate) ready: oneshot::Receiver<()>,
}

/// Token-scoped control channels shared by a relay's sessions.
///
/// Cloning is cheap; clones share the same mailboxes.
#[derive(Debug, Clone, Default)]
pub struct SignalBus {
    mailboxes: Arc<DashMap<String, Mailbox>>,
}

impl SignalBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the mailbox for `token`, replacing any stale one.
    pub(crate) fn register(&self, token: &str) -> MailboxReceivers {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let previous = self.mailboxes.insert(
            token.to_string(),
            Mailbox {
                control: control_tx,
                ready: Some(ready_tx),
            },
        );
        if previous.is_some() {
            debug!(token, "replaced existing session mailbox");
        }
        MailboxReceivers {
            control: control_rx,
            ready: ready_rx,
        }
    }

    /// Removes the mailbox for `token`. Returns false if there was none.
    pub(crate) fn deregister(&self, token: &str) -> bool {
        self.mailboxes.remove(token).is_some()
    }

    /// True while a session with this token is live.
    #[must_use]
    pub fn is_registered(&self, token: &str) -> bool {
        self.mailboxes.contains_key(token)
    }

    /// Number of live mailboxes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mailboxes.len()
    }

    /// True if no session is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mailboxes.is_empty()
    }

    /// Delivers a control signal. Returns false if no live session listens for it.
    #[instrument(level = "debug", skip(self))]
    pub fn send(&self, token: &str, signal: ControlSignal) -> bool {
        let Some(mailbox) = self.mailboxes.get(token) else {
            debug!("no mailbox for token");
            return false;
        };
        mailbox.control.send(signal).is_ok()
    }

    /// Fires the one-time listener-attached signal. Returns false if it was
    /// already fired or the token is unknown.
    #[instrument(level = "debug", skip(self))]
    pub fn listener_attached(&self, token: &str) -> bool {
        let Some(mut mailbox) = self.mailboxes.get_mut(token) else {
            debug!("no mailbox for token");
            return false;
        };
        mailbox
            .ready
            .take()
            .is_some_and(|ready| ready.send(()).is_ok())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_reaches_registered_session() {
        let bus = SignalBus::new();
        let mut receivers = bus.register("abc");

        assert!(bus.send("abc", ControlSignal::Pause));
        assert!(bus.send("abc", ControlSignal::Resume));
        assert_eq!(receivers.control.recv().await, Some(ControlSignal::Pause));
        assert_eq!(receivers.control.recv().await, Some(ControlSignal::Resume));
    }

    #[test]
    fn test_send_to_unknown_token_is_rejected() {
        let bus = SignalBus::new();
        assert!(!bus.send("missing", ControlSignal::Pause));
        assert!(!bus.listener_attached("missing"));
    }

    #[test]
    fn test_send_fails_when_receiver_dropped() {
        let bus = SignalBus::new();
        let receivers = bus.register("abc");
        drop(receivers.control);
        assert!(!bus.send("abc", ControlSignal::Pause));
    }

    #[tokio::test]
    async fn test_listener_attached_fires_once() {
        let bus = SignalBus::new();
        let receivers = bus.register("abc");

        assert!(bus.listener_attached("abc"));
        assert!(!bus.listener_attached("abc"));
        receivers.ready.await.unwrap();
    }

    #[test]
    fn test_deregister_removes_mailbox() {
        let bus = SignalBus::new();
        let _receivers = bus.register("abc");
        let clone = bus.clone();
        assert_eq!(clone.len(), 1);

        assert!(bus.deregister("abc"));
        assert!(!bus.deregister("abc"));
        assert!(clone.is_empty());
        assert!(!clone.send("abc", ControlSignal::Resume));
    }

    #[tokio::test]
    async fn test_deregister_closes_receivers() {
        let bus = SignalBus::new();
        let mut receivers = bus.register("abc");
        bus.deregister("abc");
        assert_eq!(receivers.control.recv().await, None);
        assert!(receivers.ready.await.is_err());
    }
}

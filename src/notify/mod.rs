//! Session events and their publication.
//!
//! A [`StateNotifier`] sends each [`SessionEvent`] on the session's channel
//! and, when a [`StateStore`] is configured, overwrites the session's durable
//! state with the same payload. Store failures are logged and never affect
//! the event itself. Once a terminal event (`success` or `error`) has gone
//! out, everything published afterwards is dropped.

mod store;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub use store::{MemoryStateStore, SqliteStateStore, StateStore, StoreError, state_key};

use crate::progress::ProgressUpdate;
use crate::protocol::{ErrorDetail, UploadError, UploadOutcome};

/// Event published on a session's channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Progress estimate crossed into a new whole percent.
    Progress {
        /// Percentage in `[0, 100]`, two decimal places.
        percentage: f64,
        /// Numerator of the estimate.
        bytes_uploaded: u64,
        /// Denominator of the estimate.
        bytes_total: u64,
    },
    /// Upload finished.
    Success {
        /// Destination URL of the uploaded file, if known.
        url: Option<String>,
        /// Raw protocol response.
        response: Option<serde_json::Value>,
        /// Always true; kept for clients that check it.
        completed: bool,
    },
    /// Upload failed.
    Error {
        /// Structured error detail.
        error: ErrorDetail,
        /// Optional additional context.
        extra: Option<serde_json::Value>,
    },
}

impl SessionEvent {
    /// True for `success` and `error`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress { .. })
    }

    /// Builds a `success` event.
    #[must_use]
    pub fn success(outcome: UploadOutcome) -> Self {
        Self::Success {
            url: outcome.url,
            response: outcome.response,
            completed: true,
        }
    }

    /// Builds an `error` event.
    #[must_use]
    pub fn failure(error: &UploadError, extra: Option<serde_json::Value>) -> Self {
        Self::Error {
            error: error.detail(),
            extra,
        }
    }
}

impl From<ProgressUpdate> for SessionEvent {
    fn from(update: ProgressUpdate) -> Self {
        Self::Progress {
            percentage: update.percentage,
            bytes_uploaded: update.bytes_uploaded,
            bytes_total: update.bytes_total,
        }
    }
}

/// Publishes one session's events.
#[derive(Debug)]
pub struct StateNotifier {
    token: String,
    events: mpsc::UnboundedSender<SessionEvent>,
    store: Option<Arc<dyn StateStore>>,
    terminal_sent: bool,
}

impl StateNotifier {
    /// Creates a notifier for `token`.
    #[must_use]
    pub fn new(
        token: impl Into<String>,
        events: mpsc::UnboundedSender<SessionEvent>,
        store: Option<Arc<dyn StateStore>>,
    ) -> Self {
        Self {
            token: token.into(),
            events,
            store,
            terminal_sent: false,
        }
    }

    /// Whether the terminal event has been published.
    #[must_use]
    pub fn terminal_sent(&self) -> bool {
        self.terminal_sent
    }

    /// Publishes an event. Returns false if it was dropped because the
    /// session already published its terminal event.
    pub async fn publish(&mut self, event: SessionEvent) -> bool {
        if self.terminal_sent {
            debug!(token = %self.token, ?event, "dropping event after terminal event");
            return false;
        }
        if event.is_terminal() {
            self.terminal_sent = true;
        }

        if self.events.send(event.clone()).is_err() {
            debug!(token = %self.token, "no event receiver attached");
        }
        self.persist(&event).await;
        true
    }

    async fn persist(&self, event: &SessionEvent) {
        let Some(store) = &self.store else {
            return;
        };
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(token = %self.token, error = %error, "failed to serialize session state");
                return;
            }
        };
        if let Err(error) = store.put(&state_key(&self.token), &payload).await {
            warn!(token = %self.token, error = %error, "failed to persist session state");
        }
    }
}

//! Per-session task owning progress, events, the upload strategy and cleanup.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::{Lifecycle, SessionMessage, SessionSummary};
use crate::notify::{SessionEvent, StateNotifier};
use crate::progress::{ProgressEstimator, ProgressUpdate};
use crate::protocol::{ProtocolKind, UploadError, UploadOutcome, UploadStrategy};
use crate::stream::SinkProgress;

/// Drives one session from its first chunk to cleanup.
///
/// Exactly one terminal event is published: the first `Finished` message,
/// or an abandoned error if the host drops the session before the end chunk.
#[derive(Debug)]
pub(crate) struct Coordinator {
    token: String,
    protocol: ProtocolKind,
    messages: mpsc::UnboundedReceiver<SessionMessage>,
    sink: watch::Receiver<SinkProgress>,
    strategy: Option<UploadStrategy>,
    running: Option<JoinHandle<()>>,
    estimator: ProgressEstimator,
    notifier: StateNotifier,
    lifecycle: Lifecycle,
    terminated: Arc<AtomicBool>,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        token: String,
        messages: mpsc::UnboundedReceiver<SessionMessage>,
        sink: watch::Receiver<SinkProgress>,
        strategy: UploadStrategy,
        estimator: ProgressEstimator,
        notifier: StateNotifier,
        lifecycle: Lifecycle,
        terminated: Arc<AtomicBool>,
    ) -> Self {
        Self {
            token,
            protocol: strategy.kind(),
            messages,
            sink,
            strategy: Some(strategy),
            running: None,
            estimator,
            notifier,
            lifecycle,
            terminated,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<SessionSummary> {
        tokio::spawn(self.run())
    }

    #[instrument(skip(self), fields(token = %self.token, protocol = %self.protocol))]
    async fn run(mut self) -> SessionSummary {
        if self.protocol.starts_during_download() {
            self.start_upload();
        }

        let mut watching_sink = true;
        let outcome = loop {
            tokio::select! {
                biased;
                message = self.messages.recv() => {
                    let Some(message) = message else {
                        break Err(UploadError::Abandoned);
                    };
                    if let Some(outcome) = self.handle(message).await {
                        break outcome;
                    }
                }
                changed = self.sink.changed(), if watching_sink => {
                    if changed.is_err() {
                        watching_sink = false;
                        if !self.sink.borrow().closed {
                            warn!("session dropped before the end of the download");
                            break Err(UploadError::Abandoned);
                        }
                    }
                }
            }
        };

        self.terminated.store(true, Ordering::SeqCst);
        if let Some(task) = self.running.take() {
            task.abort();
        }
        self.strategy = None;

        let succeeded = outcome.is_ok();
        let event = match outcome {
            Ok(outcome) => {
                info!(
                    bytes_written = self.estimator.bytes_written(),
                    url = outcome.url.as_deref().unwrap_or(""),
                    "upload completed"
                );
                SessionEvent::success(outcome)
            }
            Err(error) => {
                warn!(error = %error, "upload failed");
                SessionEvent::failure(&error, Some(self.counters()))
            }
        };
        self.notifier.publish(event).await;
        self.lifecycle.cleanup().await;

        SessionSummary {
            token: self.token,
            succeeded,
            bytes_written: self.estimator.bytes_written(),
            bytes_uploaded: self.estimator.bytes_uploaded(),
        }
    }

    /// Applies one message. Returns the terminal outcome when one arrives.
    async fn handle(
        &mut self,
        message: SessionMessage,
    ) -> Option<Result<UploadOutcome, UploadError>> {
        match message {
            SessionMessage::Written { bytes_written } => {
                self.estimator.record_written(bytes_written);
                let update = self.estimator.illusive();
                self.publish_progress(update).await;
            }
            SessionMessage::DownloadEnded { bytes_written } => {
                debug!(bytes_written, "download ended");
                self.estimator.finish_download(bytes_written);
                let update = self.estimator.illusive();
                self.publish_progress(update).await;
                self.start_upload();
            }
            SessionMessage::UploadProgress { bytes_uploaded } => {
                self.estimator.record_uploaded(bytes_uploaded);
                let update = self.estimator.literal();
                self.publish_progress(update).await;
            }
            SessionMessage::UploadStreamed { bytes_uploaded } => {
                self.estimator.record_uploaded(bytes_uploaded);
                let update = self.estimator.illusive();
                self.publish_progress(update).await;
            }
            SessionMessage::Finished(outcome) => return Some(outcome),
        }
        None
    }

    fn start_upload(&mut self) {
        if let Some(strategy) = self.strategy.take() {
            debug!("starting upload");
            self.running = Some(strategy.spawn());
        }
    }

    async fn publish_progress(&mut self, update: Option<ProgressUpdate>) {
        if let Some(update) = update {
            self.notifier.publish(update.into()).await;
        }
    }

    fn counters(&self) -> serde_json::Value {
        serde_json::json!({
            "bytes_written": self.estimator.bytes_written(),
            "bytes_uploaded": self.estimator.bytes_uploaded(),
        })
    }
}

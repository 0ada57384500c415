//! Upload strategies: form multipart, resumable (tus) and object-storage multipart.
//!
//! Exactly one strategy is built per session, at construction, from the
//! session's [`ProtocolConfig`](crate::session::ProtocolConfig). The
//! session coordinator decides when it starts:
//!
//! - form multipart once the download has ended (the body needs the whole file)
//! - resumable immediately; the driver waits for the first tee'd chunk
//! - object storage immediately; the driver tails the growing file
//!
//! Drivers talk to their destinations through the [`ResumableClient`] and
//! [`ObjectStorageClient`] seams and report back through an
//! [`UploadReporter`].

mod error;
mod form;
pub mod headers;
mod object_storage;
mod resumable;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

pub use error::{ErrorDetail, UploadError};
pub(crate) use form::FormUpload;
pub(crate) use object_storage::ObjectStorageUpload;
pub use object_storage::{
    KeyGenerator, MultipartTarget, ObjectStorageClient, ObjectStorageTarget, PartReceipt,
    S3MultipartClient, default_key,
};
pub(crate) use resumable::ResumableUpload;
pub use resumable::{ResumableClient, TusClient, UploadStatus};

use crate::session::SessionMessage;

/// The three upload protocols a session can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolKind {
    /// HTTP `multipart/form-data` POST of the finished file.
    FormMultipart,
    /// Resumable chunked upload (tus) fed by the live tee.
    Resumable,
    /// Object-storage multipart upload reading the growing file.
    ObjectStorage,
}

impl ProtocolKind {
    /// Whether the upload starts before the download has ended.
    #[must_use]
    pub fn starts_during_download(self) -> bool {
        !matches!(self, Self::FormMultipart)
    }

    /// Whether chunks are tee'd in memory to the upload driver.
    #[must_use]
    pub fn uses_tee(self) -> bool {
        matches!(self, Self::Resumable)
    }
}

impl std::fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::FormMultipart => "form-multipart",
            Self::Resumable => "resumable",
            Self::ObjectStorage => "object-storage",
        };
        f.write_str(name)
    }
}

/// Successful result of an upload.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UploadOutcome {
    /// Where the uploaded file can be found, when the protocol tells us.
    pub url: Option<String>,
    /// Raw protocol response (status, headers, body, or object details).
    pub response: Option<serde_json::Value>,
}

/// Channel back into the owning session's coordinator.
///
/// Sends never fail loudly: once the coordinator has published a terminal
/// event it stops listening, and late reports are simply dropped.
#[derive(Debug, Clone)]
pub struct UploadReporter {
    messages: mpsc::UnboundedSender<SessionMessage>,
}

impl UploadReporter {
    pub(crate) fn new(messages: mpsc::UnboundedSender<SessionMessage>) -> Self {
        Self { messages }
    }

    /// Literal progress: bytes the destination has acknowledged.
    pub fn uploaded(&self, bytes_uploaded: u64) {
        self.send(SessionMessage::UploadProgress { bytes_uploaded });
    }

    /// Bytes handed to the transport so far (form multipart body streaming).
    pub fn streamed(&self, bytes_uploaded: u64) {
        self.send(SessionMessage::UploadStreamed { bytes_uploaded });
    }

    /// Final outcome of the upload.
    pub fn finish(&self, outcome: Result<UploadOutcome, UploadError>) {
        self.send(SessionMessage::Finished(outcome));
    }

    fn send(&self, message: SessionMessage) {
        if self.messages.send(message).is_err() {
            debug!("session coordinator gone; dropping upload report");
        }
    }
}

/// The single upload strategy selected for a session.
#[derive(Debug)]
pub(crate) struct UploadStrategy {
    driver: Driver,
    reporter: UploadReporter,
}

#[derive(Debug)]
enum Driver {
    Form(FormUpload),
    Resumable(ResumableUpload),
    ObjectStorage(ObjectStorageUpload),
}

impl UploadStrategy {
    pub(crate) fn form(upload: FormUpload, reporter: UploadReporter) -> Self {
        Self {
            driver: Driver::Form(upload),
            reporter,
        }
    }

    pub(crate) fn resumable(upload: ResumableUpload, reporter: UploadReporter) -> Self {
        Self {
            driver: Driver::Resumable(upload),
            reporter,
        }
    }

    pub(crate) fn object_storage(upload: ObjectStorageUpload, reporter: UploadReporter) -> Self {
        Self {
            driver: Driver::ObjectStorage(upload),
            reporter,
        }
    }

    pub(crate) fn kind(&self) -> ProtocolKind {
        match self.driver {
            Driver::Form(_) => ProtocolKind::FormMultipart,
            Driver::Resumable(_) => ProtocolKind::Resumable,
            Driver::ObjectStorage(_) => ProtocolKind::ObjectStorage,
        }
    }

    /// Runs the driver on its own task; its outcome is reported, not returned.
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        let Self { driver, reporter } = self;
        tokio::spawn(async move {
            let outcome = match driver {
                Driver::Form(upload) => upload.run(&reporter).await,
                Driver::Resumable(upload) => upload.run(&reporter).await,
                Driver::ObjectStorage(upload) => upload.run(&reporter).await,
            };
            reporter.finish(outcome);
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_kind_start_rules() {
        assert!(!ProtocolKind::FormMultipart.starts_during_download());
        assert!(ProtocolKind::Resumable.starts_during_download());
        assert!(ProtocolKind::ObjectStorage.starts_during_download());
        assert!(ProtocolKind::Resumable.uses_tee());
        assert!(!ProtocolKind::ObjectStorage.uses_tee());
    }

    #[test]
    fn test_protocol_kind_serializes_kebab_case() {
        let json = serde_json::to_string(&ProtocolKind::FormMultipart).unwrap();
        assert_eq!(json, "\"form-multipart\"");
        assert_eq!(ProtocolKind::ObjectStorage.to_string(), "object-storage");
    }

    #[tokio::test]
    async fn test_reporter_survives_closed_coordinator() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let reporter = UploadReporter::new(tx);
        reporter.uploaded(10);
        reporter.finish(Ok(UploadOutcome::default()));
    }
}

//! Sessions: one in-flight download-then-upload transfer each.
//!
//! A [`Session`] is created by [`Relay::start_session`](crate::Relay::start_session).
//! The host feeds it [`Chunk`]s in order and reads [`SessionEvent`]s from
//! [`Session::take_events`]. Behind the handle, a per-session coordinator task
//! owns the progress estimator, the event notifier, the upload strategy and
//! cleanup; the writer and the strategy talk to it through [`SessionMessage`]s,
//! so no mutable state is shared between sessions.
//!
//! A session whose configuration fails validation is still returned, carrying
//! the [`ValidationError`]; it never creates a file or starts an upload, and
//! every operation on it returns that error.

mod coordinator;
mod error;
mod lifecycle;
pub mod validation;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, instrument};

pub(crate) use coordinator::Coordinator;
pub use error::{SessionError, ValidationError};
pub(crate) use lifecycle::Lifecycle;
pub use validation::{AllowList, Destination, ValidationRules};

use crate::notify::SessionEvent;
use crate::protocol::{ObjectStorageTarget, ProtocolKind, UploadError, UploadOutcome};
use crate::stream::DualStreamWriter;

/// Descriptive metadata about the transferred file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Original file name.
    pub filename: Option<String>,
    /// MIME type of the content.
    pub content_type: Option<String>,
    /// Any other caller-supplied fields.
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, String>,
}

impl Metadata {
    /// Creates metadata with a file name and content type.
    #[must_use]
    pub fn new(filename: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            filename: Some(filename.into()),
            content_type: Some(content_type.into()),
            extra: BTreeMap::new(),
        }
    }

    /// Adds an extra field.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(name.into(), value.into());
        self
    }

    /// All fields as name/value pairs, as sent to form and tus destinations.
    ///
    /// The content type is sent as `filetype`, matching tus client conventions.
    #[must_use]
    pub fn fields(&self) -> Vec<(String, String)> {
        let mut fields = Vec::with_capacity(self.extra.len() + 2);
        if let Some(filename) = &self.filename {
            fields.push(("filename".to_string(), filename.clone()));
        }
        if let Some(content_type) = &self.content_type {
            fields.push(("filetype".to_string(), content_type.clone()));
        }
        fields.extend(
            self.extra
                .iter()
                .filter(|(name, _)| name.as_str() != "filename" && name.as_str() != "filetype")
                .map(|(name, value)| (name.clone(), value.clone())),
        );
        fields
    }
}

/// Destination and protocol choice. The protocol is always explicit.
#[derive(Debug, Clone)]
pub enum ProtocolConfig {
    /// POST the finished file as `multipart/form-data`.
    FormMultipart {
        /// Destination URL.
        endpoint: String,
        /// Form field name for the file part.
        field_name: String,
    },
    /// tus upload, created at `endpoint` or continuing a pre-issued `upload_url`.
    Resumable {
        /// Creation endpoint.
        endpoint: Option<String>,
        /// Pre-issued upload URL.
        upload_url: Option<String>,
    },
    /// Object-storage multipart upload; `None` when the server has no client configured.
    ObjectStorage(Option<ObjectStorageTarget>),
}

impl ProtocolConfig {
    /// Which protocol this configuration selects.
    #[must_use]
    pub fn kind(&self) -> ProtocolKind {
        match self {
            Self::FormMultipart { .. } => ProtocolKind::FormMultipart,
            Self::Resumable { .. } => ProtocolKind::Resumable,
            Self::ObjectStorage(_) => ProtocolKind::ObjectStorage,
        }
    }
}

/// Everything needed to start a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Protocol and destination.
    pub protocol: ProtocolConfig,
    /// Size announced by the source. Advisory only.
    pub declared_size: Option<u64>,
    /// File metadata.
    pub metadata: Metadata,
    /// Outbound headers; sanitized before use.
    pub headers: BTreeMap<String, String>,
}

impl SessionConfig {
    /// Creates a configuration with empty metadata and headers.
    #[must_use]
    pub fn new(protocol: ProtocolConfig) -> Self {
        Self {
            protocol,
            declared_size: None,
            metadata: Metadata::default(),
            headers: BTreeMap::new(),
        }
    }

    /// Sets the declared size.
    #[must_use]
    pub fn with_declared_size(mut self, size: u64) -> Self {
        self.declared_size = Some(size);
        self
    }

    /// Sets the metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Adds an outbound header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// One element of the incoming stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// Downloaded bytes.
    Data(Bytes),
    /// End of the download. Nothing may follow it.
    End,
}

impl From<Bytes> for Chunk {
    fn from(bytes: Bytes) -> Self {
        Self::Data(bytes)
    }
}

/// Messages into a session's coordinator task.
#[derive(Debug)]
pub(crate) enum SessionMessage {
    /// The persistent sink acknowledged bytes; total so far.
    Written { bytes_written: u64 },
    /// The persistent sink finished; final total.
    DownloadEnded { bytes_written: u64 },
    /// Bytes acknowledged by the destination.
    UploadProgress { bytes_uploaded: u64 },
    /// Bytes handed to the transport (form multipart).
    UploadStreamed { bytes_uploaded: u64 },
    /// Terminal outcome of the upload or of the sink.
    Finished(Result<UploadOutcome, UploadError>),
}

/// What a finished session did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    /// Session token.
    pub token: String,
    /// Whether the terminal event was `success`.
    pub succeeded: bool,
    /// Bytes persisted from the download.
    pub bytes_written: u64,
    /// Bytes the destination acknowledged or received.
    pub bytes_uploaded: u64,
}

/// Host-side handle of one transfer.
#[derive(Debug)]
pub struct Session {
    token: String,
    path: PathBuf,
    protocol: ProtocolKind,
    error: Option<ValidationError>,
    writer: Option<DualStreamWriter>,
    events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    ready: Option<oneshot::Receiver<()>>,
    coordinator: Option<JoinHandle<SessionSummary>>,
    terminated: Arc<AtomicBool>,
}

impl Session {
    /// A session that failed validation. No file, no mailbox, no tasks.
    pub(crate) fn rejected(
        token: String,
        path: PathBuf,
        protocol: ProtocolKind,
        error: ValidationError,
    ) -> Self {
        Self {
            token,
            path,
            protocol,
            error: Some(error),
            writer: None,
            events: None,
            ready: None,
            coordinator: None,
            terminated: Arc::new(AtomicBool::new(true)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn running(
        token: String,
        path: PathBuf,
        protocol: ProtocolKind,
        writer: DualStreamWriter,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        ready: oneshot::Receiver<()>,
        coordinator: JoinHandle<SessionSummary>,
        terminated: Arc<AtomicBool>,
    ) -> Self {
        Self {
            token,
            path,
            protocol,
            error: None,
            writer: Some(writer),
            events: Some(events),
            ready: Some(ready),
            coordinator: Some(coordinator),
            terminated,
        }
    }

    /// The session token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Local path of the persisted download.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The selected protocol.
    #[must_use]
    pub fn protocol(&self) -> ProtocolKind {
        self.protocol
    }

    /// The construction-time validation failure, if any.
    #[must_use]
    pub fn error(&self) -> Option<&ValidationError> {
        self.error.as_ref()
    }

    /// Whether a terminal event has already been published (always true for rejected sessions).
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Bytes acknowledged by the persistent sink.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.writer.as_ref().map_or(0, DualStreamWriter::bytes_written)
    }

    /// Whether the end chunk has been accepted.
    #[must_use]
    pub fn is_download_ended(&self) -> bool {
        self.writer.as_ref().is_some_and(DualStreamWriter::is_ended)
    }

    /// Takes the event receiver. Returns `None` after the first call and for rejected sessions.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events.take()
    }

    /// Accepts one chunk; returns once every active sink has acknowledged it.
    ///
    /// The caller must not deliver the next chunk before this resolves.
    ///
    /// # Errors
    ///
    /// - [`SessionError::Validation`] if the session was rejected at construction
    /// - [`SessionError::AlreadyEnded`] for chunks after [`Chunk::End`]
    /// - [`SessionError::Terminated`] once a terminal event was published
    /// - [`SessionError::Sink`] if the local file could not be written
    pub async fn handle_chunk(&mut self, chunk: Chunk) -> Result<(), SessionError> {
        self.check_usable()?;
        if self.terminated.load(Ordering::SeqCst) {
            return Err(SessionError::Terminated);
        }
        let writer = self.writer.as_mut().ok_or(SessionError::Terminated)?;
        writer.handle_chunk(chunk).await
    }

    /// Waits for the one-time listener-attached signal for this token.
    ///
    /// # Errors
    ///
    /// Returns the validation error for rejected sessions, and
    /// [`SessionError::Terminated`] if the session ended first or the signal
    /// was already consumed.
    #[instrument(skip(self), fields(token = %self.token))]
    pub async fn listener_attached(&mut self) -> Result<(), SessionError> {
        self.check_usable()?;
        let ready = self.ready.take().ok_or(SessionError::Terminated)?;
        ready.await.map_err(|_| SessionError::Terminated)?;
        debug!("listener attached");
        Ok(())
    }

    /// Waits until the terminal event is published and cleanup has run.
    ///
    /// # Errors
    ///
    /// Returns the validation error for rejected sessions, and
    /// [`SessionError::Terminated`] if the coordinator task was lost.
    pub async fn join(mut self) -> Result<SessionSummary, SessionError> {
        self.check_usable()?;
        // Dropping the writer lets an unfinished session conclude as abandoned.
        self.writer = None;
        let coordinator = self.coordinator.take().ok_or(SessionError::Terminated)?;
        coordinator.await.map_err(|_| SessionError::Terminated)
    }

    fn check_usable(&self) -> Result<(), SessionError> {
        match &self.error {
            Some(error) => Err(SessionError::Validation(error.clone())),
            None => Ok(()),
        }
    }
}

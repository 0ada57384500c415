//! Transload Core Library
//!
//! Relays a file that is still being downloaded to an upload destination.
//! Each session persists the incoming chunks locally and uploads them
//! concurrently over one of three protocols, publishing progress and a
//! single terminal event along the way.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`relay`] - Entry point creating sessions and routing control signals
//! - [`session`] - Session handles, configuration validation and cleanup
//! - [`stream`] - Local persistence of the incoming stream (tee and tailing)
//! - [`protocol`] - Form multipart, resumable (tus) and object-storage uploads
//! - [`progress`] - Blended download/upload progress estimation
//! - [`notify`] - Session events and durable latest-state storage
//! - [`signals`] - Per-session pause/resume/listener mailboxes

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod constants;
pub mod notify;
pub mod progress;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod signals;
pub mod stream;

// Re-export commonly used types
pub use notify::{
    MemoryStateStore, SessionEvent, SqliteStateStore, StateNotifier, StateStore, StoreError,
};
pub use progress::{ProgressEstimator, ProgressUpdate};
pub use protocol::{
    ErrorDetail, ObjectStorageClient, ObjectStorageTarget, ProtocolKind, ResumableClient,
    S3MultipartClient, TusClient, UploadError, UploadOutcome, UploadStatus,
};
pub use relay::{Relay, RelayError, RelayOptions};
pub use session::{
    Chunk, Metadata, ProtocolConfig, Session, SessionConfig, SessionError, SessionSummary,
    ValidationError,
};
pub use signals::{ControlSignal, SignalBus};

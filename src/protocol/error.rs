//! Error types for upload strategies and the persistent sink.
//!
//! Every failure that reaches a session's `error` event passes through
//! [`UploadError`], which keeps enough context (URL, path, operation) to be
//! useful once serialized into an [`ErrorDetail`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that end an upload attempt.
#[derive(Debug, Error)]
pub enum UploadError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error uploading to {url}: {source}")]
    Network {
        /// The destination URL.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout uploading to {url}")]
    Timeout {
        /// The destination URL.
        url: String,
    },

    /// The destination answered with a 4xx/5xx status.
    #[error("HTTP {status} from {url}")]
    HttpStatus {
        /// The destination URL.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// Response body, when the server sent one.
        body: Option<String>,
    },

    /// The destination answered, but not in the shape the protocol requires.
    #[error("protocol error from {url}: {message}")]
    Protocol {
        /// The destination URL.
        url: String,
        /// What was wrong with the exchange.
        message: String,
    },

    /// Local file error (persistent sink write, reading the persisted file).
    #[error("IO error on {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// An object-storage call failed.
    #[error("object storage {operation} failed: {message}")]
    ObjectStorage {
        /// The client operation that failed.
        operation: &'static str,
        /// Error text reported by the client.
        message: String,
    },

    /// Object-storage protocol selected but no client/bucket is configured.
    #[error("object storage upload requested but no object storage client is configured")]
    MissingObjectStorageConfig,

    /// The session ended without any upload outcome being reported.
    #[error("session abandoned before the upload completed")]
    Abandoned,
}

impl UploadError {
    /// Creates a network or timeout error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            Self::Timeout { url: url.into() }
        } else {
            Self::Network {
                url: url.into(),
                source,
            }
        }
    }

    /// Creates an HTTP status error without a body.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            body: None,
        }
    }

    /// Creates an HTTP status error carrying the response body.
    pub fn http_status_with_body(url: impl Into<String>, status: u16, body: Option<String>) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            body: body.filter(|text| !text.is_empty()),
        }
    }

    /// Creates a protocol error.
    pub fn protocol(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an object-storage error for the named operation.
    pub fn object_storage(operation: &'static str, message: impl Into<String>) -> Self {
        Self::ObjectStorage {
            operation,
            message: message.into(),
        }
    }

    /// Short machine-readable classification used in [`ErrorDetail::kind`].
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network",
            Self::Timeout { .. } => "timeout",
            Self::HttpStatus { .. } => "http_status",
            Self::Protocol { .. } => "protocol",
            Self::Io { .. } => "io",
            Self::ObjectStorage { .. } => "object_storage",
            Self::MissingObjectStorageConfig => "configuration",
            Self::Abandoned => "abandoned",
        }
    }

    /// HTTP status associated with the failure, if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Structured, serializable description of this error.
    #[must_use]
    pub fn detail(&self) -> ErrorDetail {
        ErrorDetail {
            kind: self.kind().to_string(),
            message: self.to_string(),
            status: self.status(),
            body: match self {
                Self::HttpStatus { body, .. } => body.clone(),
                _ => None,
            },
        }
    }
}

/// Serializable error payload carried by `error` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Classification (`network`, `http_status`, `configuration`, ...).
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// HTTP status, for status failures.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub status: Option<u16>,
    /// Response body the destination sent with a status failure.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub body: Option<String>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_error_http_status_display() {
        let error = UploadError::http_status("https://uploads.example.com/files", 413);
        let msg = error.to_string();
        assert!(msg.contains("413"), "Expected '413' in: {msg}");
        assert!(
            msg.contains("https://uploads.example.com/files"),
            "Expected URL in: {msg}"
        );
    }

    #[test]
    fn test_upload_error_detail_carries_status() {
        let detail = UploadError::http_status_with_body(
            "https://uploads.example.com/files",
            500,
            Some("boom".to_string()),
        )
        .detail();
        assert_eq!(detail.kind, "http_status");
        assert_eq!(detail.status, Some(500));
        assert_eq!(detail.body.as_deref(), Some("boom"));
    }

    #[test]
    fn test_error_detail_serializes_destination_body() {
        let detail = UploadError::http_status_with_body(
            "https://u.example.com",
            413,
            Some("quota exceeded: 2GB max".to_string()),
        )
        .detail();
        let json = serde_json::to_value(&detail).unwrap();
        assert_eq!(json["status"], 413);
        assert_eq!(json["body"], "quota exceeded: 2GB max");
        let back: ErrorDetail = serde_json::from_value(json).unwrap();
        assert_eq!(back, detail);
    }

    #[test]
    fn test_upload_error_empty_body_dropped() {
        let error =
            UploadError::http_status_with_body("https://uploads.example.com", 502, Some(String::new()));
        assert!(matches!(error, UploadError::HttpStatus { body: None, .. }));
    }

    #[test]
    fn test_missing_object_storage_config_is_configuration_kind() {
        let detail = UploadError::MissingObjectStorageConfig.detail();
        assert_eq!(detail.kind, "configuration");
        assert_eq!(detail.status, None);
        assert!(detail.message.contains("object storage"));
    }

    #[test]
    fn test_error_detail_skips_missing_status_when_serialized() {
        let json = serde_json::to_value(UploadError::Abandoned.detail()).unwrap();
        assert_eq!(json["kind"], "abandoned");
        assert!(json.get("status").is_none());
        assert!(json.get("body").is_none());
    }

    #[test]
    fn test_io_error_display_includes_path() {
        let io_error = std::io::Error::new(std::io::ErrorKind::StorageFull, "disk full");
        let msg = UploadError::io("/tmp/session-token", io_error).to_string();
        assert!(msg.contains("/tmp/session-token"), "Expected path in: {msg}");
    }
}

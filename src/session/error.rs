//! Error types for session construction and chunk delivery.

use std::path::PathBuf;

use thiserror::Error;

use crate::constants::VALIDATION_ERROR_STATUS;

/// Configuration rejected before any I/O.
///
/// All variants map to the same fixed status, see [`ValidationError::status`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Neither an endpoint nor a resumable upload URL was given.
    #[error("a destination endpoint or upload URL is required")]
    MissingDestination,

    /// A destination URL could not be parsed.
    #[error("invalid destination URL {url}: {reason}")]
    InvalidUrl {
        /// The offending URL.
        url: String,
        /// Why parsing failed.
        reason: String,
    },

    /// A destination URL uses a scheme other than http/https.
    #[error("destination URL {url} uses unsupported scheme '{scheme}' (expected http or https)")]
    UnsupportedScheme {
        /// The offending URL.
        url: String,
        /// The scheme it used.
        scheme: String,
    },

    /// A destination host has no top-level domain (only allowed in debug mode).
    #[error("destination URL {url} has no top-level domain")]
    MissingTopLevelDomain {
        /// The offending URL.
        url: String,
    },

    /// A destination URL matches none of the configured allow-list patterns.
    #[error("destination URL {url} is not in the allowed destinations")]
    NotAllowed {
        /// The offending URL.
        url: String,
    },

    /// Form multipart upload without a field name for the file.
    #[error("a form field name is required for form multipart uploads")]
    MissingFieldName,
}

impl ValidationError {
    /// HTTP-style status reported with every validation failure.
    #[must_use]
    pub fn status(&self) -> u16 {
        VALIDATION_ERROR_STATUS
    }
}

/// Errors returned by [`Session`](super::Session) operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session was rejected at construction.
    #[error("session rejected: {0}")]
    Validation(#[from] ValidationError),

    /// A chunk arrived after the end of the download.
    #[error("download already ended; no further chunks are accepted")]
    AlreadyEnded,

    /// The session already published its terminal event.
    #[error("session already terminated")]
    Terminated,

    /// The persistent sink failed to write.
    #[error("failed to persist chunk to {path}: {source}")]
    Sink {
        /// Local file path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_status_is_fixed() {
        let errors = [
            ValidationError::MissingDestination,
            ValidationError::MissingFieldName,
            ValidationError::NotAllowed {
                url: "https://evil.example.com/x".to_string(),
            },
        ];
        for error in errors {
            assert_eq!(error.status(), 400);
        }
    }

    #[test]
    fn test_not_allowed_display_names_url() {
        let msg = ValidationError::NotAllowed {
            url: "https://evil.example.com/x".to_string(),
        }
        .to_string();
        assert!(msg.contains("https://evil.example.com/x"), "Expected URL in: {msg}");
    }

    #[test]
    fn test_session_error_wraps_validation_message() {
        let error = SessionError::from(ValidationError::MissingDestination);
        assert!(error.to_string().starts_with("session rejected:"));
    }
}

//! Session cleanup: local file removal and mailbox deregistration.

use std::io::ErrorKind;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::signals::SignalBus;

/// Runs a session's cleanup exactly once.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    token: String,
    path: PathBuf,
    bus: SignalBus,
    cleaned: bool,
}

impl Lifecycle {
    pub(crate) fn new(token: String, path: PathBuf, bus: SignalBus) -> Self {
        Self {
            token,
            path,
            bus,
            cleaned: false,
        }
    }

    /// Deletes the persisted file and removes the session's mailbox.
    ///
    /// Deletion failures are logged and otherwise ignored. Returns false if
    /// cleanup already ran.
    pub(crate) async fn cleanup(&mut self) -> bool {
        if self.cleaned {
            return false;
        }
        self.cleaned = true;

        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => debug!(path = %self.path.display(), "removed session file"),
            Err(error) if error.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "session file already gone");
            }
            Err(error) => warn!(
                path = %self.path.display(),
                error = %error,
                "failed to remove session file"
            ),
        }

        if !self.bus.deregister(&self.token) {
            debug!(token = %self.token, "session mailbox already removed");
        }
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_cleanup_removes_file_and_mailbox_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tok");
        std::fs::write(&path, b"data").unwrap();
        let bus = SignalBus::new();
        let _receivers = bus.register("tok");

        let mut lifecycle = Lifecycle::new("tok".to_string(), path.clone(), bus.clone());
        assert!(lifecycle.cleanup().await);
        assert!(!path.exists());
        assert!(!bus.is_registered("tok"));

        assert!(!lifecycle.cleanup().await, "second cleanup must be a no-op");
    }

    #[tokio::test]
    async fn test_cleanup_tolerates_missing_file() {
        let dir = TempDir::new().unwrap();
        let bus = SignalBus::new();
        let mut lifecycle = Lifecycle::new("gone".to_string(), dir.path().join("gone"), bus);
        assert!(lifecycle.cleanup().await);
    }
}

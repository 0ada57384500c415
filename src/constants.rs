//! Constants shared across sessions (timeouts, chunk ceilings, key prefixes).

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout between received bytes (5 minutes for slow destinations).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Largest body sent in a single resumable PATCH (8 MiB).
///
/// The total length is unknown while the download runs, so this bounds the
/// buffer a single attempt can hold.
pub const RESUMABLE_CHUNK_CEILING: usize = 8 * 1024 * 1024;

/// Object-storage part size (5 MiB, the S3 minimum for all parts but the last).
pub const OBJECT_PART_SIZE: usize = 5 * 1024 * 1024;

/// Prefix for durable state keys (`transload:<token>`).
pub const STATE_KEY_PREFIX: &str = "transload";

/// Status returned alongside every validation failure.
pub const VALIDATION_ERROR_STATUS: u16 = 400;

/// Length of generated session tokens.
pub const TOKEN_LENGTH: usize = 32;

/// tus protocol version spoken by [`crate::protocol::TusClient`].
pub const TUS_VERSION: &str = "1.0.0";

/// Project URL for User-Agent identification.
const PROJECT_UA_URL: &str = "https://github.com/fierce/transload";

/// User-Agent for every outbound request, source fetches included.
#[must_use]
pub fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("transload/{version} (+{PROJECT_UA_URL})")
}

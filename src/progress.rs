//! Progress estimation for a session.
//!
//! Two signals feed one estimate:
//!
//! - **literal** progress, `bytes_uploaded / total`, reported by drivers that
//!   know what the destination acknowledged (resumable, object storage)
//! - **illusive** progress, `0.5 * bytes_written + 0.5 * bytes_uploaded` over the
//!   same total, which blends download and upload into one number while real
//!   upload progress is not measurable (form multipart, and the download phase
//!   of the other protocols)
//!
//! The total is the declared size until the download ends, then the exact
//! number of bytes written. Updates are only emitted when the whole-number
//! percentage rises above the last emitted one.

/// An estimate worth publishing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressUpdate {
    /// Percentage in `[0, 100]`, two decimal places.
    pub percentage: f64,
    /// Numerator used for the estimate.
    pub bytes_uploaded: u64,
    /// Denominator used for the estimate.
    pub bytes_total: u64,
}

/// Per-session progress state. Owned by exactly one session coordinator.
#[derive(Debug, Clone, Default)]
pub struct ProgressEstimator {
    declared_size: Option<u64>,
    bytes_written: u64,
    bytes_uploaded: u64,
    download_ended: bool,
    last_emitted: Option<u8>,
}

impl ProgressEstimator {
    /// Creates an estimator. A declared size of zero is treated as unknown.
    #[must_use]
    pub fn new(declared_size: Option<u64>) -> Self {
        Self {
            declared_size: declared_size.filter(|size| *size > 0),
            ..Self::default()
        }
    }

    /// Records the persistent sink's running total. Never moves backwards.
    pub fn record_written(&mut self, bytes_written: u64) {
        self.bytes_written = self.bytes_written.max(bytes_written);
    }

    /// Records bytes uploaded so far. Never moves backwards.
    pub fn record_uploaded(&mut self, bytes_uploaded: u64) {
        self.bytes_uploaded = self.bytes_uploaded.max(bytes_uploaded);
    }

    /// Marks the download finished; the total becomes the exact byte count.
    pub fn finish_download(&mut self, bytes_written: u64) {
        self.record_written(bytes_written);
        self.download_ended = true;
    }

    /// Current denominator.
    #[must_use]
    pub fn total(&self) -> u64 {
        if self.download_ended {
            self.bytes_written
        } else {
            self.declared_size.unwrap_or(self.bytes_written)
        }
    }

    /// Bytes written so far.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Bytes uploaded so far.
    #[must_use]
    pub fn bytes_uploaded(&self) -> u64 {
        self.bytes_uploaded
    }

    /// Whether the download has ended.
    #[must_use]
    pub fn download_ended(&self) -> bool {
        self.download_ended
    }

    /// Last whole percentage emitted, if any.
    #[must_use]
    pub fn last_emitted(&self) -> Option<u8> {
        self.last_emitted
    }

    /// Illusive estimate, if it crosses into a new whole percent.
    #[allow(clippy::cast_precision_loss)]
    pub fn illusive(&mut self) -> Option<ProgressUpdate> {
        let numerator = 0.5 * self.bytes_written as f64 + 0.5 * self.bytes_uploaded as f64;
        self.gate(numerator)
    }

    /// Literal estimate, if it crosses into a new whole percent.
    #[allow(clippy::cast_precision_loss)]
    pub fn literal(&mut self) -> Option<ProgressUpdate> {
        self.gate(self.bytes_uploaded as f64)
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn gate(&mut self, numerator: f64) -> Option<ProgressUpdate> {
        let total = self.total();
        if total == 0 {
            return None;
        }
        let raw = (numerator * 100.0 / total as f64).clamp(0.0, 100.0);
        let whole = raw.floor() as u8;
        if self.last_emitted.is_some_and(|last| whole <= last) {
            return None;
        }
        self.last_emitted = Some(whole);
        Some(ProgressUpdate {
            percentage: (raw * 100.0).round() / 100.0,
            bytes_uploaded: numerator.round() as u64,
            bytes_total: total,
        })
    }
}

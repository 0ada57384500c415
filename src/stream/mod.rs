//! Local persistence of the incoming stream.
//!
//! - [`DualStreamWriter`] writes every chunk to the session file and, for the
//!   resumable protocol, tees it to the upload driver
//! - [`TailingReader`] follows that file while it is still being written

mod tail;
mod writer;

pub use tail::TailingReader;
pub(crate) use writer::DualStreamWriter;

/// What the persistent sink has acknowledged so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkProgress {
    /// Bytes written and flushed to the session file.
    pub bytes_written: u64,
    /// True once the file is complete.
    pub closed: bool,
}

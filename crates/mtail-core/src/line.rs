//! The unit of data flowing from tailers to virtual machines.

use std::path::Path;
use std::sync::Arc;

/// One complete line read from a log file.
///
/// `seq` is strictly increasing per source path, including across rotations
/// of that path.
#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    /// Line content without the terminator.
    pub text: String,
    /// Path the line was read from.
    pub source: Arc<Path>,
    /// Per-file sequence number, starting at 1.
    pub seq: u64,
}

impl LogLine {
    pub fn new(text: impl Into<String>, source: Arc<Path>, seq: u64) -> Self {
        Self {
            text: text.into(),
            source,
            seq,
        }
    }
}

//! Reader for one growing log file.
//!
//! A file that shrinks below the read offset, or whose (device, inode) pair
//! changes, is treated as a new stream and read from offset zero.

use std::fs::{File, Metadata};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::line::LogLine;

/// Maximum number of bytes read in a single read call.
const MAX_READ_BYTES: u64 = 1 << 20;

/// Maximum number of bytes consumed by one `poll`. A larger backlog is left
/// for the next call and reported by `has_backlog`.
const MAX_POLL_BYTES: u64 = 16 * MAX_READ_BYTES;

/// Identity of the file currently behind a path.
///
/// Any change between two observations means the path now names a new
/// stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileIdentity {
    dev: u64,
    ino: u64,
}

impl FileIdentity {
    #[cfg(unix)]
    pub fn of(metadata: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        }
    }

    /// Without inodes rotation is detected by size only.
    #[cfg(not(unix))]
    pub fn of(_metadata: &Metadata) -> Self {
        Self { dev: 0, ino: 0 }
    }
}

/// Where to begin reading a file that already exists when tailing starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartAt {
    Beginning,
    #[default]
    End,
}

/// Read position within one identity of the file. Replaced, never reset,
/// when the identity changes.
#[derive(Debug)]
struct FileState {
    identity: FileIdentity,
    offset: u64,
    /// Bytes after the last line terminator.
    partial: Vec<u8>,
}

impl FileState {
    fn new(identity: FileIdentity, offset: u64) -> Self {
        Self {
            identity,
            offset,
            partial: Vec::new(),
        }
    }
}

/// Reads lines appended to a file since the last read.
///
/// Re-opens the path on every poll, so a rename followed by re-creation is
/// picked up as a new stream starting at offset zero. Bytes written to the
/// old file after the last poll are not recovered.
#[derive(Debug)]
pub struct FileTailer {
    path: PathBuf,
    source: Arc<Path>,
    /// `None` until the file has been seen.
    state: Option<FileState>,
    seq: u64,
    poll_budget: u64,
    /// The last poll stopped before the end of the file.
    backlog: bool,
}

impl FileTailer {
    /// Open `path`, positioned according to `start`.
    ///
    /// Returns `Err` if the file does not exist or cannot be opened.
    pub fn new(path: PathBuf, start: StartAt) -> io::Result<Self> {
        let metadata = File::open(&path)?.metadata()?;
        let offset = match start {
            StartAt::Beginning => 0,
            StartAt::End => metadata.len(),
        };
        Ok(Self {
            source: Arc::from(path.as_path()),
            state: Some(FileState::new(FileIdentity::of(&metadata), offset)),
            path,
            seq: 0,
            poll_budget: MAX_POLL_BYTES,
            backlog: false,
        })
    }

    /// Tailer for a file that does not exist yet. It is read from the
    /// beginning once it appears.
    pub fn pending(path: PathBuf) -> Self {
        Self {
            source: Arc::from(path.as_path()),
            state: None,
            path,
            seq: 0,
            poll_budget: MAX_POLL_BYTES,
            backlog: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_poll_budget(mut self, bytes: u64) -> Self {
        self.poll_budget = bytes;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_pending(&self) -> bool {
        self.state.is_none()
    }

    /// Whether the last `poll` left bytes that were already in the file
    /// when it started.
    pub fn has_backlog(&self) -> bool {
        self.backlog
    }

    /// Bytes consumed from the current identity of the file.
    pub fn offset(&self) -> u64 {
        self.state.as_ref().map_or(0, |s| s.offset)
    }

    /// Read what was appended since the last call, up to the per-poll
    /// budget, and pass each complete line to `emit`. Returns the number of
    /// lines emitted.
    ///
    /// A missing file is not an error; the next poll tries again.
    pub fn poll(&mut self, mut emit: impl FnMut(LogLine)) -> io::Result<u64> {
        self.backlog = false;
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        let metadata = file.metadata()?;
        let identity = FileIdentity::of(&metadata);
        let size = metadata.len();

        let fresh = match &self.state {
            Some(state) if state.identity != identity => {
                debug!(path = %self.path.display(), "file replaced, reading new file from start");
                true
            }
            Some(state) if size < state.offset => {
                debug!(
                    path = %self.path.display(),
                    size,
                    offset = state.offset,
                    "file truncated, reading from start"
                );
                true
            }
            Some(_) => false,
            None => {
                debug!(path = %self.path.display(), "file appeared");
                true
            }
        };
        if fresh {
            self.state = Some(FileState::new(identity, 0));
        }
        let Some(state) = self.state.as_mut() else {
            return Ok(0);
        };
        if size == state.offset {
            return Ok(0);
        }

        // Bytes written after the size was taken wait for the next poll.
        let end = size.min(state.offset.saturating_add(self.poll_budget));
        file.seek(SeekFrom::Start(state.offset))?;
        let mut emitted = 0;
        let mut chunk = Vec::new();
        while state.offset < end {
            chunk.clear();
            let want = (end - state.offset).min(MAX_READ_BYTES);
            let n = (&mut file).take(want).read_to_end(&mut chunk)?;
            if n == 0 {
                break;
            }
            state.offset += n as u64;
            state.partial.extend_from_slice(&chunk);
            emitted += split_lines(&mut state.partial, &mut self.seq, &self.source, &mut emit);
        }
        self.backlog = state.offset < size;
        Ok(emitted)
    }

    /// Read to end of file and also emit a final unterminated line, once.
    pub fn finish(&mut self, mut emit: impl FnMut(LogLine)) -> io::Result<u64> {
        let mut emitted = self.poll(&mut emit)?;
        while self.backlog {
            emitted += self.poll(&mut emit)?;
        }
        if let Some(state) = self.state.as_mut()
            && !state.partial.is_empty()
        {
            let rest = std::mem::take(&mut state.partial);
            self.seq += 1;
            emit(LogLine::new(decode(&rest), Arc::clone(&self.source), self.seq));
            emitted += 1;
        }
        Ok(emitted)
    }

    /// Collect the complete lines appended since the last call.
    pub fn read_new_lines(&mut self) -> io::Result<Vec<LogLine>> {
        let mut lines = Vec::new();
        self.poll(|line| lines.push(line))?;
        Ok(lines)
    }
}

/// Emit every terminated line in `buffer`, keeping the unterminated rest.
fn split_lines(
    buffer: &mut Vec<u8>,
    seq: &mut u64,
    source: &Arc<Path>,
    emit: &mut impl FnMut(LogLine),
) -> u64 {
    let mut start = 0;
    let mut emitted = 0;
    while let Some(pos) = buffer[start..].iter().position(|&b| b == b'\n') {
        let end = start + pos;
        *seq += 1;
        emit(LogLine::new(decode(&buffer[start..end]), Arc::clone(source), *seq));
        emitted += 1;
        start = end + 1;
    }
    buffer.drain(..start);
    emitted
}

fn decode(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

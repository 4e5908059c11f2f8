//! Incremental reader for a growing log file.
//!
//! Rotation is detected by inode change or truncation (file shorter than
//! the saved offset); either restarts reading at the top of the new file.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::PathBuf;

/// Maximum number of lines returned by one `read_new_lines()` call.
pub const MAX_LINES_PER_READ: usize = 10_000;

/// Reads complete lines appended since the last read.
///
/// Starts at the end of the file. A trailing line without `\n` is left
/// for the next call so a line being written is never split.
pub struct FileTailer {
    path: PathBuf,
    offset: u64,
    inode: u64,
}

impl FileTailer {
    /// Opens a tailer positioned at the current end of `path`.
    pub fn new(path: PathBuf) -> io::Result<Self> {
        let metadata = fs::metadata(&path)?;
        Ok(Self {
            inode: get_inode(&metadata),
            offset: metadata.len(),
            path,
        })
    }

    /// Returns up to `MAX_LINES_PER_READ` complete new lines.
    ///
    /// A missing file (rotation in progress) yields an empty batch.
    pub fn read_new_lines(&mut self) -> io::Result<Vec<String>> {
        let metadata = match fs::metadata(&self.path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let inode = get_inode(&metadata);
        let size = metadata.len();
        if inode != self.inode || size < self.offset {
            self.inode = inode;
            self.offset = 0;
        }
        if size <= self.offset {
            return Ok(Vec::new());
        }

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.offset))?;
        let mut reader = BufReader::new(file);

        let mut lines = Vec::new();
        let mut buf = Vec::new();
        while lines.len() < MAX_LINES_PER_READ {
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf)?;
            if n == 0 || buf.last() != Some(&b'\n') {
                break;
            }
            self.offset += n as u64;
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
            lines.push(String::from_utf8_lossy(&buf).into_owned());
        }
        Ok(lines)
    }

    /// Byte offset of the next unread line.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

#[cfg(unix)]
fn get_inode(metadata: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

/// Non-Unix: rotation is detected by size only.
#[cfg(not(unix))]
fn get_inode(_metadata: &fs::Metadata) -> u64 {
    0
}

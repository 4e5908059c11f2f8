use std::io;

/// Failure to persist a record.
///
/// Reported and counted by the scheduler; the affected sample is dropped.
#[derive(Debug)]
pub enum WriteError {
    /// No space left on the device holding the result directory.
    StorageFull(io::Error),
    /// Result directory or partition file is not writable.
    PermissionDenied(io::Error),
    /// Result directory (or a parent) does not exist.
    PathMissing(io::Error),
    /// Any other I/O failure.
    Io(io::Error),
    /// Sample could not be encoded as JSON.
    Encode(serde_json::Error),
    /// A writer thread panicked while holding the partition lock.
    Poisoned,
    /// The writer was closed at shutdown.
    Closed,
}

impl std::fmt::Display for WriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteError::StorageFull(e) => write!(f, "filesystem full: {}", e),
            WriteError::PermissionDenied(e) => write!(f, "permission denied: {}", e),
            WriteError::PathMissing(e) => write!(f, "path missing: {}", e),
            WriteError::Io(e) => write!(f, "I/O error: {}", e),
            WriteError::Encode(e) => write!(f, "encode error: {}", e),
            WriteError::Poisoned => write!(f, "partition lock poisoned"),
            WriteError::Closed => write!(f, "writer is closed"),
        }
    }
}

impl std::error::Error for WriteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WriteError::StorageFull(e)
            | WriteError::PermissionDenied(e)
            | WriteError::PathMissing(e)
            | WriteError::Io(e) => Some(e),
            WriteError::Encode(e) => Some(e),
            WriteError::Poisoned | WriteError::Closed => None,
        }
    }
}

impl From<io::Error> for WriteError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::StorageFull => WriteError::StorageFull(e),
            io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem => {
                WriteError::PermissionDenied(e)
            }
            io::ErrorKind::NotFound => WriteError::PathMissing(e),
            _ => WriteError::Io(e),
        }
    }
}

impl From<serde_json::Error> for WriteError {
    fn from(e: serde_json::Error) -> Self {
        WriteError::Encode(e)
    }
}

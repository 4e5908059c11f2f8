//! Startup failures.
//!
//! Anything that prevents a required long-lived resource from being built
//! ends up here. The binary reports it and exits non-zero before the
//! scheduler starts; per-tick failures use [`CollectError`] instead.
//!
//! [`CollectError`]: crate::collector::CollectError

use std::path::PathBuf;

use crate::storage::WriteError;

#[derive(Debug)]
pub enum StartupError {
    /// Configuration is invalid or ambiguous.
    Config(String),
    /// Credential file could not be read.
    Credentials { path: PathBuf, source: std::io::Error },
    /// Kernel event subscriber could not attach.
    Attach(String),
    /// Result directory is unusable.
    Storage(WriteError),
    /// Async runtime or another process-level resource could not be created.
    Runtime(String),
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartupError::Config(msg) => write!(f, "invalid configuration: {}", msg),
            StartupError::Credentials { path, source } => {
                write!(f, "cannot read password file {}: {}", path.display(), source)
            }
            StartupError::Attach(msg) => write!(f, "tracepoint attach failed: {}", msg),
            StartupError::Storage(e) => write!(f, "result directory unusable: {}", e),
            StartupError::Runtime(msg) => write!(f, "runtime error: {}", msg),
        }
    }
}

impl std::error::Error for StartupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StartupError::Credentials { source, .. } => Some(source),
            StartupError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<WriteError> for StartupError {
    fn from(e: WriteError) -> Self {
        StartupError::Storage(e)
    }
}

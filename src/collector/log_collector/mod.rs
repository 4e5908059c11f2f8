//! Debug log shadow capture.
//!
//! Copies new lines of the node's `debug.log` into the record stream so
//! log context is stored next to the samples it explains.

mod tailer;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use crate::collector::{CollectContext, CollectError, Source, SourceDescriptor, SourceKind};
use crate::storage::Sample;

pub use tailer::{FileTailer, MAX_LINES_PER_READ};

/// Source emitting the lines appended to the debug log since the last tick.
pub struct DebugLogSource {
    descriptor: SourceDescriptor,
    path: PathBuf,
    tailer: Option<FileTailer>,
}

impl DebugLogSource {
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            descriptor: SourceDescriptor::new("debug_log", SourceKind::Log, interval),
            path: path.into(),
            tailer: None,
        }
    }

    fn read(&mut self) -> Result<Vec<String>, CollectError> {
        if self.tailer.is_none() {
            // Opened lazily: the node may create its log after we start.
            let tailer = FileTailer::new(self.path.clone()).map_err(|e| {
                CollectError::unavailable(format!("{}: {}", self.path.display(), e))
            })?;
            info!(path = %self.path.display(), offset = tailer.offset(), "tailing debug log");
            self.tailer = Some(tailer);
        }
        match self.tailer.as_mut() {
            Some(tailer) => tailer.read_new_lines().map_err(|e| {
                CollectError::unavailable(format!("{}: {}", self.path.display(), e))
            }),
            None => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl Source for DebugLogSource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    async fn collect(&mut self, ctx: &CollectContext) -> Result<Sample, CollectError> {
        let lines = self.read()?;
        debug!(lines = lines.len(), "debug log lines captured");
        Ok(ctx.sample(
            &self.descriptor,
            json!({ "line_count": lines.len(), "lines": lines }),
        ))
    }
}

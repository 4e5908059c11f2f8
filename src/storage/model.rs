//! Sample and its persisted form.

use std::time::Instant;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::collector::{CollectContext, CollectError, SourceDescriptor, SourceKind};

/// Outcome of one collection event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleStatus {
    Ok,
    Error,
}

/// One timestamped observation produced by a source.
///
/// Ownership moves from the source to the scheduler to the writer; nothing
/// mutates a sample after it is built.
#[derive(Debug, Clone)]
pub struct Sample {
    pub source: String,
    pub kind: SourceKind,
    /// Wall-clock capture time. Selects the partition.
    pub timestamp: DateTime<Utc>,
    /// Monotonic capture instant. Not persisted.
    pub captured_at: Instant,
    pub status: SampleStatus,
    pub error: Option<CollectError>,
    pub payload: serde_json::Value,
    /// Kernel events discarded on buffer overflow since the previous drain.
    pub dropped_events: Option<u64>,
}

impl Sample {
    pub fn ok(
        descriptor: &SourceDescriptor,
        ctx: &CollectContext,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            source: descriptor.name.clone(),
            kind: descriptor.kind,
            timestamp: ctx.timestamp,
            captured_at: ctx.captured_at,
            status: SampleStatus::Ok,
            error: None,
            payload,
            dropped_events: None,
        }
    }

    pub fn failed(descriptor: &SourceDescriptor, ctx: &CollectContext, error: CollectError) -> Self {
        Self {
            source: descriptor.name.clone(),
            kind: descriptor.kind,
            timestamp: ctx.timestamp,
            captured_at: ctx.captured_at,
            status: SampleStatus::Error,
            error: Some(error),
            payload: serde_json::Value::Null,
            dropped_events: None,
        }
    }

    pub fn with_dropped_events(mut self, dropped: u64) -> Self {
        self.dropped_events = (dropped > 0).then_some(dropped);
        self
    }

    /// UTC calendar day this sample is persisted under.
    pub fn date(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }

    pub fn is_ok(&self) -> bool {
        self.status == SampleStatus::Ok
    }

    pub fn to_record(&self) -> SampleRecord {
        SampleRecord {
            source: self.source.clone(),
            kind: self.kind,
            timestamp: self.timestamp,
            status: self.status,
            error: self.error.clone(),
            payload: self.payload.clone(),
            dropped_events: self.dropped_events,
        }
    }
}

/// Persisted line of a partition file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub source: String,
    pub kind: SourceKind,
    pub timestamp: DateTime<Utc>,
    pub status: SampleStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CollectError>,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dropped_events: Option<u64>,
}

impl SampleRecord {
    /// Encodes the record as one newline-terminated line.
    pub fn to_line(&self) -> serde_json::Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

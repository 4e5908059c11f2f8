use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use super::EventBuffer;
use crate::collector::{CollectContext, CollectError, Source, SourceDescriptor, SourceKind};
use crate::storage::Sample;

/// Drains the kernel event buffer once per tick into one batched sample.
pub struct NetTracepointSource {
    descriptor: SourceDescriptor,
    buffer: Arc<EventBuffer>,
}

impl NetTracepointSource {
    pub fn new(interval: Duration, buffer: Arc<EventBuffer>) -> Self {
        Self {
            descriptor: SourceDescriptor::new("net", SourceKind::Tracepoint, interval),
            buffer,
        }
    }
}

#[async_trait]
impl Source for NetTracepointSource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    async fn collect(&mut self, ctx: &CollectContext) -> Result<Sample, CollectError> {
        if let Some(reason) = self.buffer.stopped_reason() {
            return Err(CollectError::unavailable(format!(
                "tracepoint reader stopped: {}",
                reason
            )));
        }
        let drained = self.buffer.drain();
        if drained.dropped > 0 {
            warn!(
                dropped = drained.dropped,
                capacity = self.buffer.capacity(),
                "kernel event buffer overflowed"
            );
        }
        debug!(events = drained.events.len(), "drained kernel events");
        let payload = json!({
            "count": drained.events.len(),
            "events": drained.events,
        });
        Ok(ctx
            .sample(&self.descriptor, payload)
            .with_dropped_events(drained.dropped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::CollectErrorKind;
    use crate::collector::tracepoint::KernelEvent;
    use crate::collector::tracepoint::event::encode_for_test;
    use chrono::Utc;

    fn push(buffer: &EventBuffer, n: u64) {
        for i in 0..n {
            let raw = encode_for_test((i % 2) as u8, i, "1.2.3.4:8333", "inbound", "inv", 37);
            buffer.push(KernelEvent::decode(&raw, Utc::now()).unwrap());
        }
    }

    #[tokio::test]
    async fn test_drain_batches_events() {
        let buffer = Arc::new(EventBuffer::new(100));
        let mut src = NetTracepointSource::new(Duration::from_secs(5), buffer.clone());
        push(&buffer, 3);

        let s = src.collect(&CollectContext::new(1, Utc::now())).await.unwrap();
        assert_eq!(s.kind, SourceKind::Tracepoint);
        assert_eq!(s.payload["count"], 3);
        assert_eq!(s.payload["events"][1]["event_type"], "outbound_message");
        assert_eq!(s.dropped_events, None);

        // Nothing new: an empty batch, not a wait.
        let s = src.collect(&CollectContext::new(2, Utc::now())).await.unwrap();
        assert_eq!(s.payload["count"], 0);
    }

    #[tokio::test]
    async fn test_overflow_reported_on_next_sample() {
        let buffer = Arc::new(EventBuffer::new(2));
        let mut src = NetTracepointSource::new(Duration::from_secs(5), buffer.clone());
        push(&buffer, 5);

        let s = src.collect(&CollectContext::new(1, Utc::now())).await.unwrap();
        assert_eq!(s.payload["count"], 2);
        assert_eq!(s.dropped_events, Some(3));
    }

    #[tokio::test]
    async fn test_dead_reader_is_unavailable_not_quiet() {
        let buffer = Arc::new(EventBuffer::new(16));
        let mut src = NetTracepointSource::new(Duration::from_secs(5), buffer.clone());
        let s = src.collect(&CollectContext::new(1, Utc::now())).await.unwrap();
        assert_eq!(s.payload["count"], 0);

        buffer.mark_stopped("ring buffer poll: Bad file descriptor");
        let ctx = CollectContext::new(2, Utc::now());
        let err = src.collect(&ctx).await.unwrap_err();
        assert_eq!(err.kind, CollectErrorKind::Unavailable);
        assert!(err.message.contains("tracepoint reader stopped"));

        let record = ctx.failure(src.descriptor(), err).to_record();
        let line = serde_json::to_value(&record).unwrap();
        assert_eq!(line["status"], "error");
        assert_eq!(line["error"]["kind"], "unavailable");
    }
}

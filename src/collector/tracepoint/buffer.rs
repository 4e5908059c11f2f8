//! Bounded hand-off queue between the kernel reader thread and the
//! scheduler's drain.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use super::KernelEvent;

pub const DEFAULT_EVENT_BUFFER_CAPACITY: usize = 65_536;

/// Events accumulated since the last drain.
#[derive(Debug, Default)]
pub struct Drained {
    pub events: Vec<KernelEvent>,
    /// Events evicted on overflow since the previous drain.
    pub dropped: u64,
}

/// Mutex-guarded ring of kernel events.
///
/// When full, pushing evicts the oldest event and bumps the drop counter,
/// which the next drain reports and resets.
#[derive(Debug)]
pub struct EventBuffer {
    queue: Mutex<VecDeque<KernelEvent>>,
    capacity: usize,
    dropped: AtomicU64,
    total: AtomicU64,
    /// Set by the reader thread when it exits on an error.
    stopped: Mutex<Option<String>>,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_EVENT_BUFFER_CAPACITY))),
            capacity,
            dropped: AtomicU64::new(0),
            total: AtomicU64::new(0),
            stopped: Mutex::new(None),
        }
    }

    pub fn push(&self, event: KernelEvent) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let Ok(mut queue) = self.queue.lock() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(event);
    }

    /// Takes everything buffered so far. Never waits for new events.
    pub fn drain(&self) -> Drained {
        let events = match self.queue.lock() {
            Ok(mut queue) => queue.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        Drained {
            events,
            dropped: self.dropped.swap(0, Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events pushed since creation, including dropped ones.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Records that no more events will arrive because the reader failed.
    pub fn mark_stopped(&self, reason: impl Into<String>) {
        let mut stopped = self.stopped.lock().unwrap_or_else(|p| p.into_inner());
        stopped.get_or_insert_with(|| reason.into());
    }

    /// Why the reader stopped, if it did.
    pub fn stopped_reason(&self) -> Option<String> {
        self.stopped
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::tracepoint::event::encode_for_test;
    use chrono::Utc;
    use std::sync::Arc;

    fn event(peer_id: u64) -> KernelEvent {
        KernelEvent::decode(
            &encode_for_test(0, peer_id, "1.2.3.4:8333", "inbound", "ping", 8),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn test_drain_returns_in_order_and_empties() {
        let buf = EventBuffer::new(10);
        for i in 0..3 {
            buf.push(event(i));
        }
        let d = buf.drain();
        assert_eq!(d.events.iter().map(|e| e.peer_id).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(d.dropped, 0);
        assert!(buf.is_empty());
        assert!(buf.drain().events.is_empty());
    }

    #[test]
    fn test_overflow_drops_oldest_and_is_counted() {
        let buf = EventBuffer::new(3);
        for i in 0..5 {
            buf.push(event(i));
        }
        let d = buf.drain();
        assert_eq!(d.events.iter().map(|e| e.peer_id).collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(d.dropped, 2);
        assert_eq!(buf.total(), 5);
        // Reported once.
        assert_eq!(buf.drain().dropped, 0);
    }

    #[test]
    fn test_first_stop_reason_is_kept() {
        let buf = EventBuffer::new(4);
        assert_eq!(buf.stopped_reason(), None);
        buf.mark_stopped("ring buffer poll: EINTR");
        buf.mark_stopped("second");
        assert_eq!(buf.stopped_reason().as_deref(), Some("ring buffer poll: EINTR"));
    }

    #[test]
    fn test_concurrent_producer_no_loss_below_capacity() {
        let buf = Arc::new(EventBuffer::new(10_000));
        let producers: Vec<_> = (0..4)
            .map(|t| {
                let buf = buf.clone();
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        buf.push(event(t * 1000 + i));
                    }
                })
            })
            .collect();

        let mut seen = 0;
        while producers.iter().any(|p| !p.is_finished()) {
            seen += buf.drain().events.len();
        }
        for p in producers {
            p.join().unwrap();
        }
        let last = buf.drain();
        seen += last.events.len();
        assert_eq!(seen, 4000);
        assert_eq!(last.dropped, 0);
    }
}

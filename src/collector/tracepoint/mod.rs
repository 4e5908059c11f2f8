//! Kernel tracepoint source.
//!
//! ```text
//!  bitcoind ──USDT net:*_message──▶ BPF ring buffer
//!                                        │ poll (reader thread)
//!                                        ▼
//!                                   EventBuffer (bounded, drop-oldest)
//!                                        │ drain (each tick)
//!                                        ▼
//!                               NetTracepointSource ──▶ Sample
//! ```

mod buffer;
pub(crate) mod event;
mod source;
mod subscriber;

pub use buffer::{DEFAULT_EVENT_BUFFER_CAPACITY, Drained, EventBuffer};
pub use event::{DecodeError, KernelEvent, KernelEventType};
pub use source::NetTracepointSource;
pub use subscriber::{SubscriberConfig, TracepointSubscriber, find_pid};

//! Sources of node state.
//!
//! Every data origin is a [`Source`]: something with a name, a sampling
//! interval, and a `collect()` that yields one [`Sample`] or a typed
//! [`CollectError`]. Three behavioural profiles share that contract:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Scheduler                            │
//! │        one task per Source, collect() under a timeout        │
//! └──────┬──────────────────┬──────────────────┬─────────────────┘
//!        │                  │                  │
//! ┌──────▼──────┐   ┌───────▼───────┐   ┌──────▼────────┐
//! │  RpcSource  │   │ NetTracepoint │   │ Counter srcs  │
//! │ pull/reply  │   │ drain buffer  │   │ delta vs last │
//! └──────┬──────┘   └───────▲───────┘   └──────┬────────┘
//!        │                  │ push              │
//!   RpcClient        TracepointSubscriber  CommandRunner (trait)
//!   (HTTP JSON-RPC)  (USDT ring buffer)    systemctl / iptables
//! ```
//!
//! Variant-specific state (last counter values, the kernel event buffer,
//! the tail offset of the debug log) lives inside each concrete source.

pub mod accounting;
pub mod log_collector;
#[cfg(test)]
pub mod mock;
pub mod rpc;
pub mod tracepoint;
pub mod traits;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::Sample;

pub use accounting::{
    CounterReading, CounterTracker, FirewallSource, IpAccountingSource, TrafficSource,
};
pub use log_collector::{DebugLogSource, FileTailer};
pub use rpc::{RpcClient, RpcError, RpcMethod, RpcSource};
pub use tracepoint::{EventBuffer, KernelEvent, NetTracepointSource, TracepointSubscriber};
pub use traits::{CommandOutput, CommandRunner, SystemRunner};

/// Sampling mechanism behind a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Rpc,
    Tracepoint,
    Counter,
    Log,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Rpc => "rpc",
            SourceKind::Tracepoint => "tracepoint",
            SourceKind::Counter => "counter",
            SourceKind::Log => "log",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static description of a source, fixed at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDescriptor {
    pub name: String,
    pub enabled: bool,
    pub interval: Duration,
    /// Upper bound on a single `collect()`; exceeding it is a `Timeout`.
    pub timeout: Duration,
    pub kind: SourceKind,
}

impl SourceDescriptor {
    pub fn new(name: impl Into<String>, kind: SourceKind, interval: Duration) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            interval,
            timeout: interval.min(DEFAULT_COLLECT_TIMEOUT),
            kind,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Default per-collect timeout when a source does not set its own.
pub const DEFAULT_COLLECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Failure class of a single collection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectErrorKind {
    Timeout,
    Unavailable,
    Auth,
    Protocol,
    Unsupported,
}

impl CollectErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectErrorKind::Timeout => "timeout",
            CollectErrorKind::Unavailable => "unavailable",
            CollectErrorKind::Auth => "auth",
            CollectErrorKind::Protocol => "protocol",
            CollectErrorKind::Unsupported => "unsupported",
        }
    }
}

/// Per-tick failure. Persisted as data, never propagated past the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectError {
    pub kind: CollectErrorKind,
    pub message: String,
}

impl CollectError {
    pub fn new(kind: CollectErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            CollectErrorKind::Timeout,
            format!("collect did not finish within {}", crate::fmt::format_interval(after)),
        )
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(CollectErrorKind::Unavailable, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(CollectErrorKind::Protocol, message)
    }
}

impl std::fmt::Display for CollectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for CollectError {}

/// Per-tick context handed to `collect()`.
#[derive(Debug, Clone)]
pub struct CollectContext {
    /// Tick number for this source, starting at 1.
    pub tick: u64,
    /// Wall-clock capture time, used for persistence.
    pub timestamp: DateTime<Utc>,
    /// Monotonic capture instant.
    pub captured_at: Instant,
}

impl CollectContext {
    pub fn new(tick: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            tick,
            timestamp,
            captured_at: Instant::now(),
        }
    }

    /// Builds a successful sample for `descriptor` stamped with this context.
    pub fn sample(&self, descriptor: &SourceDescriptor, payload: serde_json::Value) -> Sample {
        Sample::ok(descriptor, self, payload)
    }

    /// Builds a failure record for `descriptor` stamped with this context.
    pub fn failure(&self, descriptor: &SourceDescriptor, error: CollectError) -> Sample {
        Sample::failed(descriptor, self, error)
    }
}

/// A unit of collection driven by the scheduler.
///
/// Calling `collect()` twice yields two independent point-in-time samples.
/// Counter sources are the exception that keeps state: the previous
/// cumulative value, needed for the delta.
#[async_trait]
pub trait Source: Send {
    fn descriptor(&self) -> &SourceDescriptor;

    fn name(&self) -> &str {
        &self.descriptor().name
    }

    fn interval(&self) -> Duration {
        self.descriptor().interval
    }

    async fn collect(&mut self, ctx: &CollectContext) -> Result<Sample, CollectError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_error_serializes_snake_case() {
        let e = CollectError::new(CollectErrorKind::Unsupported, "method not found");
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["kind"], "unsupported");
        assert_eq!(json["message"], "method not found");
        assert_eq!(e.to_string(), "unsupported: method not found");
    }

    #[test]
    fn test_descriptor_timeout_capped_by_interval() {
        let d = SourceDescriptor::new("net", SourceKind::Tracepoint, Duration::from_secs(5));
        assert_eq!(d.timeout, Duration::from_secs(5));
        let d = SourceDescriptor::new("x", SourceKind::Rpc, Duration::from_secs(600));
        assert_eq!(d.timeout, DEFAULT_COLLECT_TIMEOUT);
        let d = d.with_timeout(Duration::from_secs(1));
        assert_eq!(d.timeout, Duration::from_secs(1));
    }
}

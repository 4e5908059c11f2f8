//! Counter-backed sources.
//!
//! OS counters (systemd per-unit IP accounting, iptables rule counters,
//! cgroup traffic counted by BPF programs) are cumulative. Each source keeps
//! the previous read in a [`CounterTracker`] and reports the delta since
//! the last tick:
//!
//! - first read after startup: `baseline` (no delta)
//! - value grew or stayed: `delta`
//! - value shrank (service restart, `iptables -Z`): `reset`, no delta

pub mod firewall;
pub mod systemd;
pub mod traffic;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::collector::{CollectError, CommandOutput};

pub use firewall::FirewallSource;
pub use systemd::IpAccountingSource;
pub use traffic::{TrafficConfig, TrafficSource};

/// One counter read translated against the previous read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CounterReading {
    /// First observation; nothing to diff against.
    Baseline { value: u64 },
    /// Activity since the previous read.
    Delta { value: u64, delta: u64 },
    /// Counter went backwards; the previous value is reported instead of
    /// a negative delta.
    Reset { value: u64, previous: u64 },
}

impl CounterReading {
    pub fn value(&self) -> u64 {
        match self {
            CounterReading::Baseline { value }
            | CounterReading::Delta { value, .. }
            | CounterReading::Reset { value, .. } => *value,
        }
    }

    /// Delta since the previous read, if there is a meaningful one.
    pub fn delta(&self) -> Option<u64> {
        match self {
            CounterReading::Delta { delta, .. } => Some(*delta),
            _ => None,
        }
    }
}

/// Last observed value per named counter.
#[derive(Debug, Default)]
pub struct CounterTracker {
    last: HashMap<String, u64>,
}

impl CounterTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `value` for `key` and classifies it against the previous read.
    pub fn observe(&mut self, key: &str, value: u64) -> CounterReading {
        match self.last.insert(key.to_string(), value) {
            None => CounterReading::Baseline { value },
            Some(previous) if value >= previous => CounterReading::Delta {
                value,
                delta: value - previous,
            },
            Some(previous) => CounterReading::Reset { value, previous },
        }
    }

    /// Forgets every counter, so the next read is a baseline again.
    pub fn clear(&mut self) {
        self.last.clear();
    }

    pub fn len(&self) -> usize {
        self.last.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}

/// Maps a failed OS command run to the per-tick error.
///
/// A missing binary means the counter facility is not installed.
pub(crate) fn spawn_error(program: &str, e: std::io::Error) -> CollectError {
    if e.kind() == std::io::ErrorKind::NotFound {
        CollectError::unavailable(format!("{} not found", program))
    } else {
        CollectError::unavailable(format!("failed to run {}: {}", program, e))
    }
}

/// First non-empty line of a failed command's stderr.
pub(crate) fn stderr_summary(out: &CommandOutput) -> String {
    out.stderr
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("no output")
        .to_string()
}

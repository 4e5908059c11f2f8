//! systemd per-unit IP accounting.
//!
//! With `IPAccounting=yes` on the node's unit, systemd keeps cumulative
//! ingress/egress byte and packet counters in the unit's cgroup BPF
//! program. We read them through `systemctl show`:
//!
//! ```text
//! IPAccounting=yes
//! IPIngressBytes=1837261
//! IPIngressPackets=4211
//! IPEgressBytes=923311
//! IPEgressPackets=3001
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use super::{CounterTracker, spawn_error, stderr_summary};
use crate::collector::{
    CollectContext, CollectError, CommandRunner, Source, SourceDescriptor, SourceKind,
};
use crate::storage::Sample;

const SYSTEMCTL: &str = "systemctl";

const COUNTERS: [(&str, &str); 4] = [
    ("IPIngressBytes", "ingress_bytes"),
    ("IPIngressPackets", "ingress_packets"),
    ("IPEgressBytes", "egress_bytes"),
    ("IPEgressPackets", "egress_packets"),
];

/// systemd prints `UINT64_MAX` for counters it has no data for.
const NO_DATA: u64 = u64::MAX;

fn args(unit: &str) -> Vec<&str> {
    let mut args = vec!["show", unit, "-p", "IPAccounting"];
    for (property, _) in COUNTERS {
        args.push("-p");
        args.push(property);
    }
    args
}

/// The exact command line this reader runs for `unit`.
pub fn command_line(unit: &str) -> String {
    std::iter::once(SYSTEMCTL)
        .chain(args(unit))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Raw cumulative counters of one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IpCounters {
    pub ingress_bytes: u64,
    pub ingress_packets: u64,
    pub egress_bytes: u64,
    pub egress_packets: u64,
}

impl IpCounters {
    fn set(&mut self, key: &str, value: u64) {
        match key {
            "ingress_bytes" => self.ingress_bytes = value,
            "ingress_packets" => self.ingress_packets = value,
            "egress_bytes" => self.egress_bytes = value,
            "egress_packets" => self.egress_packets = value,
            _ => {}
        }
    }

    fn iter(&self) -> [(&'static str, u64); 4] {
        [
            ("ingress_bytes", self.ingress_bytes),
            ("ingress_packets", self.ingress_packets),
            ("egress_bytes", self.egress_bytes),
            ("egress_packets", self.egress_packets),
        ]
    }
}

/// Parses `systemctl show -p ...` output.
///
/// Fails with `Unavailable` unless accounting is on and every counter
/// carries a number.
pub fn parse_show(unit: &str, stdout: &str) -> Result<IpCounters, CollectError> {
    let mut enabled = false;
    let mut counters = IpCounters::default();
    let mut seen = 0;

    for line in stdout.lines() {
        let Some((property, value)) = line.trim().split_once('=') else {
            continue;
        };
        if property == "IPAccounting" {
            enabled = value == "yes";
            continue;
        }
        let Some((_, key)) = COUNTERS.iter().find(|(p, _)| *p == property) else {
            continue;
        };
        match value.parse::<u64>() {
            Ok(v) if v != NO_DATA => {
                counters.set(key, v);
                seen += 1;
            }
            _ => {
                return Err(CollectError::unavailable(format!(
                    "{unit}: {property} has no data"
                )));
            }
        }
    }

    if !enabled {
        return Err(CollectError::unavailable(format!(
            "IP accounting is not enabled for {unit}"
        )));
    }
    if seen < COUNTERS.len() {
        return Err(CollectError::protocol(format!(
            "{unit}: expected {} counters, got {seen}",
            COUNTERS.len()
        )));
    }
    Ok(counters)
}

/// Counter source over one systemd unit's IP accounting.
pub struct IpAccountingSource {
    descriptor: SourceDescriptor,
    unit: String,
    runner: Arc<dyn CommandRunner>,
    tracker: CounterTracker,
}

impl IpAccountingSource {
    pub fn new(
        unit: impl Into<String>,
        interval: Duration,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            descriptor: SourceDescriptor::new("ip_accounting", SourceKind::Counter, interval),
            unit: unit.into(),
            runner,
            tracker: CounterTracker::new(),
        }
    }
}

fn read_counters(runner: &dyn CommandRunner, unit: &str) -> Result<IpCounters, CollectError> {
    let out = runner
        .run(SYSTEMCTL, &args(unit))
        .map_err(|e| spawn_error(SYSTEMCTL, e))?;
    if !out.is_success() {
        return Err(CollectError::unavailable(format!(
            "systemctl show {} failed: {}",
            unit,
            stderr_summary(&out)
        )));
    }
    parse_show(unit, &out.stdout)
}

#[async_trait]
impl Source for IpAccountingSource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    async fn collect(&mut self, ctx: &CollectContext) -> Result<Sample, CollectError> {
        let runner = self.runner.clone();
        let unit = self.unit.clone();
        let counters = tokio::task::spawn_blocking(move || read_counters(runner.as_ref(), &unit))
            .await
            .map_err(|e| CollectError::unavailable(format!("counter read aborted: {e}")))??;

        let mut payload = serde_json::Map::new();
        payload.insert("unit".into(), json!(self.unit));
        for (key, value) in counters.iter() {
            let reading = self.tracker.observe(key, value);
            payload.insert(key.into(), json!(reading));
        }
        debug!(unit = %self.unit, ingress_bytes = counters.ingress_bytes, egress_bytes = counters.egress_bytes, "ip accounting read");
        Ok(ctx.sample(&self.descriptor, payload.into()))
    }
}

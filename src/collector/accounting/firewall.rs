//! iptables rule packet/byte counters.
//!
//! Operators add accounting rules for the node's P2P port to dedicated
//! chains. Each configured chain is listed with exact counters and the
//! per-rule columns are summed:
//!
//! ```text
//! Chain BTC_IN (1 references)
//!     pkts      bytes target     prot opt in     out     source               destination
//!     4211  1837261 ACCEPT     tcp  --  *      *       0.0.0.0/0            0.0.0.0/0            tcp dpt:8333
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

const IPTABLES: &str = "iptables";

fn args(chain: &str) -> [&str; 6] {
    ["-w", "-n", "-v", "-x", "-L", chain]
}

/// The exact command line this reader runs for `chain`.
pub fn command_line(chain: &str) -> String {
    std::iter::once(IPTABLES)
        .chain(args(chain))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Summed counters of one chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChainCounters {
    pub packets: u64,
    pub bytes: u64,
    pub rules: usize,
}

/// Sums the `pkts` and `bytes` columns of every rule line.
///
/// Header lines (`Chain ...`, column titles) do not start with two
/// numbers and are skipped.
pub fn parse_chain(stdout: &str) -> ChainCounters {
    let mut totals = ChainCounters::default();
    for line in stdout.lines() {
        let mut cols = line.split_whitespace();
        let (Some(pkts), Some(bytes)) = (cols.next(), cols.next()) else {
            continue;
        };
        if let (Ok(pkts), Ok(bytes)) = (pkts.parse::<u64>(), bytes.parse::<u64>()) {
            totals.packets = totals.packets.saturating_add(pkts);
            totals.bytes = totals.bytes.saturating_add(bytes);
            totals.rules += 1;
        }
    }
    totals
}

fn read_chain(runner: &dyn CommandRunner, chain: &str) -> Result<ChainCounters, CollectError> {
    let out = runner
        .run(IPTABLES, &args(chain))
        .map_err(|e| spawn_error(IPTABLES, e))?;
    if !out.is_success() {
        return Err(CollectError::unavailable(format!(
            "iptables chain {}: {}",
            chain,
            stderr_summary(&out)
        )));
    }
    Ok(parse_chain(&out.stdout))
}

fn read_chains(
    runner: &dyn CommandRunner,
    chains: &[String],
) -> Result<Vec<(String, ChainCounters)>, CollectError> {
    chains
        .iter()
        .map(|c| read_chain(runner, c).map(|counters| (c.clone(), counters)))
        .collect()
}

/// Counter source over a set of iptables chains.
pub struct FirewallSource {
    descriptor: SourceDescriptor,
    chains: Arc<[String]>,
    runner: Arc<dyn CommandRunner>,
    tracker: CounterTracker,
}

impl FirewallSource {
    pub fn new(chains: Vec<String>, interval: Duration, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            descriptor: SourceDescriptor::new("firewall", SourceKind::Counter, interval),
            chains: chains.into(),
            runner,
            tracker: CounterTracker::new(),
        }
    }
}

#[async_trait]
impl Source for FirewallSource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    async fn collect(&mut self, ctx: &CollectContext) -> Result<Sample, CollectError> {
        if self.chains.is_empty() {
            return Err(CollectError::unavailable("no firewall chains configured"));
        }
        let runner = self.runner.clone();
        let chains = self.chains.clone();
        let readings = tokio::task::spawn_blocking(move || read_chains(runner.as_ref(), &chains))
            .await
            .map_err(|e| CollectError::unavailable(format!("counter read aborted: {e}")))??;

        let mut payload = serde_json::Map::new();
        for (chain, counters) in readings {
            let packets = self.tracker.observe(&format!("{chain}.packets"), counters.packets);
            let bytes = self.tracker.observe(&format!("{chain}.bytes"), counters.bytes);
            debug!(chain = %chain, packets = counters.packets, bytes = counters.bytes, "firewall chain read");
            payload.insert(
                chain,
                json!({ "packets": packets, "bytes": bytes, "rules": counters.rules }),
            );
        }
        Ok(ctx.sample(&self.descriptor, json!({ "chains": payload })))
    }
}

//! Pre-built command scenarios for testing.
//!
//! These produce the exact text `systemctl show` and `iptables -L -v -x`
//! print on a host where bitcoind runs as a systemd service.

use super::runner::{MockResponse, MockRunner};
use crate::collector::accounting::{firewall, systemd};
use crate::collector::traits::CommandOutput;

impl MockRunner {
    /// Queues one `systemctl show` reply with IP accounting enabled.
    pub fn push_ip_accounting(
        &self,
        unit: &str,
        ingress_bytes: u64,
        ingress_packets: u64,
        egress_bytes: u64,
        egress_packets: u64,
    ) {
        self.push_stdout(
            systemd::command_line(unit),
            format!(
                "IPAccounting=yes\n\
                 IPIngressBytes={ingress_bytes}\n\
                 IPIngressPackets={ingress_packets}\n\
                 IPEgressBytes={egress_bytes}\n\
                 IPEgressPackets={egress_packets}\n"
            ),
        );
    }

    /// Queues a `systemctl show` reply for a unit without `IPAccounting=yes`.
    pub fn push_ip_accounting_disabled(&self, unit: &str) {
        self.push_stdout(
            systemd::command_line(unit),
            "IPAccounting=no\n\
             IPIngressBytes=[no data]\n\
             IPIngressPackets=[no data]\n\
             IPEgressBytes=[no data]\n\
             IPEgressPackets=[no data]\n",
        );
    }

    /// Queues an `iptables -L` listing of `chain` with one line per rule.
    ///
    /// Each rule is `(packets, bytes, description)`.
    pub fn push_iptables_chain(&self, chain: &str, rules: &[(u64, u64, &str)]) {
        let mut out = format!(
            "Chain {chain} (1 references)\n    pkts      bytes target     prot opt in     out     source               destination\n"
        );
        for (pkts, bytes, desc) in rules {
            out.push_str(&format!(
                "{pkts:>8} {bytes:>10} ACCEPT     tcp  --  *      *       0.0.0.0/0            0.0.0.0/0            {desc}\n"
            ));
        }
        self.push_stdout(firewall::command_line(chain), out);
    }

    /// Queues the error iptables prints for an unknown chain.
    pub fn push_iptables_missing_chain(&self, chain: &str) {
        self.push(
            firewall::command_line(chain),
            MockResponse::Output(CommandOutput::failure(
                1,
                "iptables: No chain/target/match by that name.\n",
            )),
        );
    }
}

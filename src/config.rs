//! Immutable run configuration.
//!
//! Built once by the binary from command-line flags, validated, then handed
//! to [`RunState::build`](crate::runtime::RunState::build). Nothing reads
//! configuration after startup.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use crate::StartupError;
use crate::collector::RpcMethod;
use crate::collector::tracepoint::DEFAULT_EVENT_BUFFER_CAPACITY;
use crate::scheduler::SchedulerConfig;

/// Every source the daemon knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceId {
    Rpc(RpcMethod),
    IpAccounting,
    Firewall,
    Traffic,
    Net,
    DebugLog,
}

impl SourceId {
    pub const ALL: [SourceId; 10] = [
        SourceId::Rpc(RpcMethod::GetConnectionCount),
        SourceId::Rpc(RpcMethod::GetPeerInfo),
        SourceId::Rpc(RpcMethod::GetTxOutSetInfo),
        SourceId::Rpc(RpcMethod::GetNodeAddresses),
        SourceId::Rpc(RpcMethod::GetRawAddrman),
        SourceId::IpAccounting,
        SourceId::Firewall,
        SourceId::Traffic,
        SourceId::Net,
        SourceId::DebugLog,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SourceId::Rpc(m) => m.name(),
            SourceId::IpAccounting => "ip_accounting",
            SourceId::Firewall => "firewall",
            SourceId::Traffic => "traffic",
            SourceId::Net => "net",
            SourceId::DebugLog => "debug_log",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.name() == name)
    }

    pub fn default_interval(&self) -> Duration {
        match self {
            SourceId::Rpc(m) => m.default_interval(),
            SourceId::IpAccounting
            | SourceId::Firewall
            | SourceId::Traffic
            | SourceId::Net
            | SourceId::DebugLog => Duration::from_secs(5)
        }
    }

    /// Sources needing extra privileges or host setup are opt-in.
    pub fn enabled_by_default(&self) -> bool {
        matches!(self, SourceId::Rpc(_) | SourceId::IpAccounting)
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Parses an `--interval NAME=SECS` override.
pub fn parse_interval_override(s: &str) -> Result<(SourceId, Duration), String> {
    let (name, secs) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=SECS, got '{}'", s))?;
    let source = SourceId::from_name(name.trim())
        .ok_or_else(|| format!("unknown source '{}'", name.trim()))?;
    let secs = secs
        .trim()
        .parse::<u64>()
        .map_err(|e| format!("invalid interval '{}': {}", secs.trim(), e))?;
    if secs == 0 {
        return Err(format!("interval for {} must be positive", source));
    }
    Ok((source, Duration::from_secs(secs)))
}

/// Connection settings for the node's RPC endpoint.
#[derive(Clone)]
pub struct RpcConfig {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub password_file: Option<PathBuf>,
    pub timeout: Duration,
}

impl std::fmt::Debug for RpcConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("password_file", &self.password_file)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8332,
            user: None,
            password: None,
            password_file: None,
            timeout: Duration::from_secs(30),
        }
    }
}

impl RpcConfig {
    pub fn url(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("http://[{}]:{}/", self.host, self.port)
        } else {
            format!("http://{}:{}/", self.host, self.port)
        }
    }

    /// Returns the RPC password from the inline value or the password file.
    ///
    /// Giving both is rejected by [`Config::validate`]; here the file is only
    /// read when no inline value exists. A trailing newline is stripped.
    pub fn resolve_password(&self) -> Result<Option<String>, StartupError> {
        if let Some(password) = &self.password {
            return Ok(Some(password.clone()));
        }
        let Some(path) = &self.password_file else {
            return Ok(None);
        };
        let raw = std::fs::read_to_string(path).map_err(|source| StartupError::Credentials {
            path: path.clone(),
            source,
        })?;
        let password = raw.trim_end_matches(['\n', '\r']).to_string();
        if password.is_empty() {
            return Err(StartupError::Config(format!(
                "password file {} is empty",
                path.display()
            )));
        }
        Ok(Some(password))
    }

    fn validate(&self) -> Result<(), StartupError> {
        if self.host.trim().is_empty() {
            return Err(StartupError::Config("RPC host is empty".into()));
        }
        if self.port == 0 {
            return Err(StartupError::Config("RPC port must be non-zero".into()));
        }
        if self.timeout.is_zero() {
            return Err(StartupError::Config("RPC timeout must be positive".into()));
        }
        if self.password.is_some() && self.password_file.is_some() {
            return Err(StartupError::Config(
                "both --rpc-password and --rpc-password-file given; pass only one".into(),
            ));
        }
        let has_password = self.password.is_some() || self.password_file.is_some();
        match (&self.user, has_password) {
            (Some(_), false) => Err(StartupError::Config(
                "RPC user given without a password or password file".into(),
            )),
            (None, true) => Err(StartupError::Config(
                "RPC password given without --rpc-user".into(),
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the daily partitions.
    pub result_path: PathBuf,
    pub rpc: RpcConfig,
    pub enabled: BTreeSet<SourceId>,
    pub intervals: BTreeMap<SourceId, Duration>,
    pub scheduler: SchedulerConfig,
    pub event_buffer_capacity: usize,
    /// Compiled `p2p_net.bpf.o`.
    pub bpf_object: PathBuf,
    /// `/proc/<pid>/comm` of the node process.
    pub bitcoind_name: String,
    pub systemd_unit: String,
    pub firewall_chains: Vec<String>,
    /// Compiled `traffic.bpf.o`.
    pub traffic_bpf_object: PathBuf,
    /// Parent cgroup of the node's unit (cgroup v2).
    pub cgroup_root: PathBuf,
    pub debug_log_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            result_path: PathBuf::from("results"),
            rpc: RpcConfig::default(),
            enabled: SourceId::ALL
                .into_iter()
                .filter(SourceId::enabled_by_default)
                .collect(),
            intervals: BTreeMap::new(),
            scheduler: SchedulerConfig::default(),
            event_buffer_capacity: DEFAULT_EVENT_BUFFER_CAPACITY,
            bpf_object: PathBuf::from("/usr/lib/btcmon/p2p_net.bpf.o"),
            bitcoind_name: "bitcoind".to_string(),
            systemd_unit: "bitcoind.service".to_string(),
            firewall_chains: Vec::new(),
            traffic_bpf_object: PathBuf::from("/usr/lib/btcmon/traffic.bpf.o"),
            cgroup_root: PathBuf::from("/sys/fs/cgroup/system.slice"),
            debug_log_path: PathBuf::from("/var/lib/bitcoind/debug.log"),
        }
    }
}

impl Config {
    pub fn is_enabled(&self, source: SourceId) -> bool {
        self.enabled.contains(&source)
    }

    pub fn set_enabled(&mut self, source: SourceId, enabled: bool) {
        if enabled {
            self.enabled.insert(source);
        } else {
            self.enabled.remove(&source);
        }
    }

    /// cgroup directory of the node's systemd unit.
    pub fn cgroup_path(&self) -> PathBuf {
        self.cgroup_root.join(&self.systemd_unit)
    }

    /// Configured interval, or the source's default.
    pub fn interval(&self, source: SourceId) -> Duration {
        self.intervals
            .get(&source)
            .copied()
            .unwrap_or_else(|| source.default_interval())
    }

    /// Rejects contradictory or incomplete settings.
    pub fn validate(&self) -> Result<(), StartupError> {
        if self.enabled.is_empty() {
            return Err(StartupError::Config("no sources enabled".into()));
        }
        if self.result_path.as_os_str().is_empty() {
            return Err(StartupError::Config("result path is empty".into()));
        }
        if self.enabled.iter().any(|s| matches!(s, SourceId::Rpc(_))) {
            self.rpc.validate()?;
        }
        if let Some((source, _)) = self.intervals.iter().find(|(_, d)| d.is_zero()) {
            return Err(StartupError::Config(format!(
                "interval for {} must be positive",
                source
            )));
        }
        if self.is_enabled(SourceId::Firewall) && self.firewall_chains.is_empty() {
            return Err(StartupError::Config(
                "firewall source enabled without --firewall-chain".into(),
            ));
        }
        if self.is_enabled(SourceId::Net) && self.event_buffer_capacity == 0 {
            return Err(StartupError::Config(
                "event buffer capacity must be positive".into(),
            ));
        }
        let needs_unit =
            self.is_enabled(SourceId::IpAccounting) || self.is_enabled(SourceId::Traffic);
        if needs_unit && self.systemd_unit.trim().is_empty() {
            return Err(StartupError::Config("systemd unit name is empty".into()));
        }
        Ok(())
    }
}

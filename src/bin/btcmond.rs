//! btcmond - Bitcoin Core node monitor daemon.
//!
//! Samples RPC state, OS traffic counters and (optionally) kernel
//! tracepoints of a local node and appends every sample to one JSON-lines
//! file per UTC day.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

use btcmon::StartupError;
use btcmon::collector::RpcMethod;
use btcmon::config::{Config, RpcConfig, SourceId, parse_interval_override};
use btcmon::fmt::{format_interval, format_size};
use btcmon::runtime::RunState;
use btcmon::scheduler::{SchedulerConfig, SchedulerReport};

/// Bitcoin Core node monitor daemon.
#[derive(Parser, Debug)]
#[command(name = "btcmond", about = "Bitcoin Core node monitor daemon", version)]
struct Args {
    /// Directory for the daily result files.
    #[arg(long, env = "BTCMON_RESULT_PATH", default_value = "results")]
    result_path: PathBuf,

    /// RPC host of the node.
    #[arg(long, env = "BTCMON_RPC_HOST", default_value = "127.0.0.1")]
    rpc_host: String,

    /// RPC port of the node.
    #[arg(long, env = "BTCMON_RPC_PORT", default_value = "8332")]
    rpc_port: u16,

    /// RPC user (rpcauth / rpcuser).
    #[arg(long, env = "BTCMON_RPC_USER")]
    rpc_user: Option<String>,

    /// RPC password. Mutually exclusive with --rpc-password-file.
    #[arg(long, env = "BTCMON_RPC_PASSWORD", hide_env_values = true)]
    rpc_password: Option<String>,

    /// File containing the RPC password.
    #[arg(long, env = "BTCMON_RPC_PASSWORD_FILE")]
    rpc_password_file: Option<PathBuf>,

    /// Per-call RPC timeout in seconds.
    #[arg(long, env = "BTCMON_RPC_TIMEOUT", default_value = "30")]
    rpc_timeout: u64,

    /// Sample `getconnectioncount` (default on).
    #[arg(long, env = "BTCMON_GETCONNECTIONCOUNT", action = clap::ArgAction::Set, value_name = "BOOL")]
    getconnectioncount: Option<bool>,

    /// Sample `getpeerinfo` (default on).
    #[arg(long, env = "BTCMON_GETPEERINFO", action = clap::ArgAction::Set, value_name = "BOOL")]
    getpeerinfo: Option<bool>,

    /// Sample `gettxoutsetinfo` (default on, daily).
    #[arg(long, env = "BTCMON_GETTXOUTSETINFO", action = clap::ArgAction::Set, value_name = "BOOL")]
    gettxoutsetinfo: Option<bool>,

    /// Sample `getnodeaddresses` (default on).
    #[arg(long, env = "BTCMON_GETNODEADDRESSES", action = clap::ArgAction::Set, value_name = "BOOL")]
    getnodeaddresses: Option<bool>,

    /// Sample `getrawaddrman` (default on, daily).
    #[arg(long, env = "BTCMON_GETRAWADDRMAN", action = clap::ArgAction::Set, value_name = "BOOL")]
    getrawaddrman: Option<bool>,

    /// Read systemd IP accounting of the node unit (default on).
    #[arg(long, env = "BTCMON_IP_ACCOUNTING", action = clap::ArgAction::Set, value_name = "BOOL")]
    ip_accounting: Option<bool>,

    /// Read iptables counters of --firewall-chain (default off).
    #[arg(long, env = "BTCMON_FIREWALL", action = clap::ArgAction::Set, value_name = "BOOL")]
    firewall: Option<bool>,

    /// Count the node cgroup's packets with cgroup-skb programs (default off, needs root).
    #[arg(long, env = "BTCMON_TRAFFIC", action = clap::ArgAction::Set, value_name = "BOOL")]
    traffic: Option<bool>,

    /// Trace P2P messages through the node's USDT tracepoints (default off, needs root).
    #[arg(long, env = "BTCMON_NET", action = clap::ArgAction::Set, value_name = "BOOL")]
    net: Option<bool>,

    /// Capture new lines of the node's debug.log.
    #[arg(long, env = "BTCMON_DEBUG_LOG")]
    debug_log: bool,

    /// Path of the node's debug.log.
    #[arg(long, env = "BTCMON_DEBUG_LOG_PATH", default_value = "/var/lib/bitcoind/debug.log")]
    debug_log_path: PathBuf,

    /// Interval override, e.g. `--interval getpeerinfo=30`. Repeatable.
    #[arg(long = "interval", value_name = "NAME=SECS", value_parser = parse_interval_override)]
    intervals: Vec<(SourceId, Duration)>,

    /// Consecutive failures after which a source is reported in backoff.
    #[arg(long, env = "BTCMON_FAILURE_THRESHOLD")]
    failure_threshold: Option<u32>,

    /// Maximum random delay before each source's first tick, in milliseconds.
    #[arg(long, env = "BTCMON_MAX_JITTER_MS", default_value = "2000")]
    max_jitter_ms: u64,

    /// Seconds in-flight collects get to finish on shutdown.
    #[arg(long, env = "BTCMON_SHUTDOWN_GRACE", default_value = "10")]
    shutdown_grace: u64,

    /// Kernel events kept between drains before the oldest are dropped.
    #[arg(long, env = "BTCMON_EVENT_BUFFER_CAPACITY", default_value = "65536")]
    event_buffer_capacity: usize,

    /// Compiled USDT program (bpf/p2p_net.bpf.c).
    #[arg(long, env = "BTCMON_BPF_OBJECT", default_value = "/usr/lib/btcmon/p2p_net.bpf.o")]
    bpf_object: PathBuf,

    /// Compiled cgroup traffic program (bpf/traffic.bpf.c).
    #[arg(long, env = "BTCMON_TRAFFIC_BPF_OBJECT", default_value = "/usr/lib/btcmon/traffic.bpf.o")]
    traffic_bpf_object: PathBuf,

    /// cgroup v2 directory holding the node unit's cgroup.
    #[arg(long, env = "BTCMON_CGROUP_ROOT", default_value = "/sys/fs/cgroup/system.slice")]
    cgroup_root: PathBuf,

    /// Process name of the node.
    #[arg(long, env = "BTCMON_BITCOIND_NAME", default_value = "bitcoind")]
    bitcoind_name: String,

    /// systemd unit of the node.
    #[arg(long, env = "BTCMON_SYSTEMD_UNIT", default_value = "bitcoind.service")]
    systemd_unit: String,

    /// iptables chain with accounting rules. Repeatable.
    #[arg(long = "firewall-chain", value_name = "CHAIN")]
    firewall_chains: Vec<String>,

    /// Explicit log level (error, warn, info, debug, trace). Overrides -v/-q.
    #[arg(long, env = "BTCMON_LOG_LEVEL", value_parser = parse_level)]
    log_level: Option<Level>,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

fn parse_level(s: &str) -> Result<Level, String> {
    s.parse::<Level>()
        .map_err(|_| format!("invalid log level '{}'", s))
}

impl Args {
    fn into_config(self) -> Config {
        let mut config = Config {
            result_path: self.result_path,
            rpc: RpcConfig {
                host: self.rpc_host,
                port: self.rpc_port,
                user: self.rpc_user,
                password: self.rpc_password,
                password_file: self.rpc_password_file,
                timeout: Duration::from_secs(self.rpc_timeout),
            },
            scheduler: SchedulerConfig {
                failure_threshold: self.failure_threshold,
                max_jitter: Duration::from_millis(self.max_jitter_ms),
                shutdown_grace: Duration::from_secs(self.shutdown_grace),
            },
            event_buffer_capacity: self.event_buffer_capacity,
            bpf_object: self.bpf_object,
            traffic_bpf_object: self.traffic_bpf_object,
            cgroup_root: self.cgroup_root,
            bitcoind_name: self.bitcoind_name,
            systemd_unit: self.systemd_unit,
            firewall_chains: self.firewall_chains,
            debug_log_path: self.debug_log_path,
            ..Config::default()
        };

        let toggles = [
            (SourceId::Rpc(RpcMethod::GetConnectionCount), self.getconnectioncount),
            (SourceId::Rpc(RpcMethod::GetPeerInfo), self.getpeerinfo),
            (SourceId::Rpc(RpcMethod::GetTxOutSetInfo), self.gettxoutsetinfo),
            (SourceId::Rpc(RpcMethod::GetNodeAddresses), self.getnodeaddresses),
            (SourceId::Rpc(RpcMethod::GetRawAddrman), self.getrawaddrman),
            (SourceId::IpAccounting, self.ip_accounting),
            (SourceId::Firewall, self.firewall),
            (SourceId::Traffic, self.traffic),
            (SourceId::Net, self.net),
            (SourceId::DebugLog, Some(self.debug_log)),
        ];
        for (source, enabled) in toggles {
            if let Some(enabled) = enabled {
                config.set_enabled(source, enabled);
            }
        }
        config.intervals.extend(self.intervals);
        config
    }
}

/// Initializes the tracing subscriber.
/// Default level is INFO. `--log-level` wins over -v/-q.
fn init_logging(verbose: u8, quiet: bool, explicit: Option<Level>) {
    let level = explicit.unwrap_or(if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    });

    let mut filter = EnvFilter::from_default_env();
    for target in ["btcmond", "btcmon"] {
        if let Ok(directive) = format!("{}={}", target, level).parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn log_config(config: &Config) {
    info!(
        "Config: result={}, rpc={}:{}, user={}",
        config.result_path.display(),
        config.rpc.host,
        config.rpc.port,
        config.rpc.user.as_deref().unwrap_or("<none>")
    );
    for source in &config.enabled {
        info!(
            "Source {}: every {}",
            source,
            format_interval(config.interval(*source))
        );
    }
}

fn log_report(report: &SchedulerReport) {
    for s in &report.sources {
        info!(
            "Source {}: {} ticks, {} collect failures, {} write failures, state={:?}{}",
            s.name,
            s.ticks,
            s.collect_failures,
            s.write_failures,
            s.state,
            if s.abandoned { " (abandoned)" } else { "" }
        );
    }
    info!(
        "Writer: {} records ({}), {} rotations, {} late",
        report.writer.records,
        format_size(report.writer.bytes),
        report.writer.rotations,
        report.writer.late_records
    );
}

fn run(config: Config) -> Result<SchedulerReport, StartupError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("btcmon-worker")
        .build()
        .map_err(|e| StartupError::Runtime(format!("cannot start async runtime: {}", e)))?;

    let state = RunState::build(&config)?;
    info!("Starting {} sources", state.source_names().len());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal_tx = shutdown_tx.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        let _ = signal_tx.send(true);
    }) {
        warn!("Failed to set signal handler: {}", e);
    }

    let report = runtime.block_on(state.run(shutdown_rx));
    drop(shutdown_tx);
    Ok(report)
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet, args.log_level);

    info!("btcmond {} starting", btcmon::VERSION);
    let config = args.into_config();
    log_config(&config);

    match run(config) {
        Ok(report) => {
            log_report(&report);
            info!("Shutdown complete");
        }
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    }
}

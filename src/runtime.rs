//! Process-wide run state.
//!
//! Everything long-lived is built here once from the [`Config`]: the
//! writer, the RPC client, the kernel subscriber and its buffer, and one
//! source per enabled entry. Any failure is a [`StartupError`] and nothing
//! has been scheduled yet.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::StartupError;
use crate::collector::accounting::TrafficConfig;
use crate::collector::tracepoint::SubscriberConfig;
use crate::collector::{
    CommandRunner, DebugLogSource, EventBuffer, FirewallSource, IpAccountingSource,
    NetTracepointSource, RpcClient, RpcSource, Source, SystemRunner, TracepointSubscriber,
    TrafficSource,
};
use crate::config::{Config, SourceId};
use crate::scheduler::{Scheduler, SchedulerReport};
use crate::storage::{PartitionWriter, SharedWriter};

pub struct RunState {
    scheduler: Scheduler,
    subscriber: Option<TracepointSubscriber>,
    source_names: Vec<&'static str>,
}

impl RunState {
    /// Builds the run state with real OS command execution.
    pub fn build(config: &Config) -> Result<Self, StartupError> {
        Self::build_with(config, Arc::new(SystemRunner::new()))
    }

    /// Builds the run state with `runner` executing counter commands.
    pub fn build_with(
        config: &Config,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, StartupError> {
        config.validate()?;

        let writer = SharedWriter::new(PartitionWriter::open(&config.result_path)?);
        info!(path = %config.result_path.display(), "result directory ready");

        let rpc_client = if config.enabled.iter().any(|s| matches!(s, SourceId::Rpc(_))) {
            let password = config.rpc.resolve_password()?;
            let client = RpcClient::new(
                config.rpc.url(),
                config.rpc.user.clone(),
                password,
                config.rpc.timeout,
            )
            .map_err(StartupError::Runtime)?;
            info!(url = %client.url(), authenticated = config.rpc.user.is_some(), "rpc client ready");
            Some(Arc::new(client))
        } else {
            None
        };

        let mut subscriber = None;
        let mut sources: Vec<(SourceId, Box<dyn Source>)> = Vec::new();
        for id in config.enabled.iter().copied() {
            let interval = config.interval(id);
            let source: Box<dyn Source> = match id {
                SourceId::Rpc(method) => {
                    let Some(client) = rpc_client.clone() else {
                        continue;
                    };
                    Box::new(RpcSource::new(method, interval, client))
                }
                SourceId::IpAccounting => Box::new(IpAccountingSource::new(
                    config.systemd_unit.clone(),
                    interval,
                    runner.clone(),
                )),
                SourceId::Firewall => Box::new(FirewallSource::new(
                    config.firewall_chains.clone(),
                    interval,
                    runner.clone(),
                )),
                SourceId::Traffic => Box::new(TrafficSource::new(
                    TrafficConfig {
                        bpf_object: config.traffic_bpf_object.clone(),
                        cgroup_path: config.cgroup_path(),
                    },
                    interval,
                )?),
                SourceId::Net => {
                    let buffer = Arc::new(EventBuffer::new(config.event_buffer_capacity));
                    let sub_config =
                        SubscriberConfig::new(&config.bpf_object, config.bitcoind_name.clone());
                    subscriber = Some(TracepointSubscriber::attach(&sub_config, buffer.clone())?);
                    Box::new(NetTracepointSource::new(interval, buffer))
                }
                SourceId::DebugLog => {
                    if !config.debug_log_path.exists() {
                        warn!(
                            path = %config.debug_log_path.display(),
                            "debug log not found yet; will retry each tick"
                        );
                    }
                    Box::new(DebugLogSource::new(&config.debug_log_path, interval))
                }
            };
            sources.push((id, source));
        }

        let mut scheduler = Scheduler::new(writer, config.scheduler.clone());
        let mut source_names = Vec::with_capacity(sources.len());
        for (id, source) in sources {
            debug!(
                source = source.name(),
                timeout_ms = source.descriptor().timeout.as_millis() as u64,
                "source built"
            );
            source_names.push(id.name());
            scheduler.add_source(source);
        }

        Ok(Self {
            scheduler,
            subscriber,
            source_names,
        })
    }

    /// Names of the sources that will be scheduled.
    pub fn source_names(&self) -> &[&'static str] {
        &self.source_names
    }

    /// Runs until `shutdown` fires, then detaches the kernel subscriber.
    /// The writer is flushed and closed by the scheduler.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> SchedulerReport {
        let RunState {
            scheduler,
            subscriber,
            ..
        } = self;

        let report = scheduler.run(shutdown).await;

        if let Some(mut subscriber) = subscriber {
            let detached = tokio::task::spawn_blocking(move || subscriber.close()).await;
            if detached.is_err() {
                warn!("tracepoint subscriber close task failed");
            }
        }
        report
    }
}

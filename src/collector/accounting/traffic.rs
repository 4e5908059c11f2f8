//! Per-cgroup TCP/IP traffic of the node's systemd unit.
//!
//! Two `cgroup_skb` programs (`bpf/traffic.bpf.c`) attached to the unit's
//! cgroup count every non-loopback packet into a two-slot array map. A
//! reader thread copies the map into [`TrafficCounters`]; the source diffs
//! those cumulative values on each tick like any other counter.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};

use super::CounterTracker;
use crate::StartupError;
use crate::collector::{CollectContext, CollectError, Source, SourceDescriptor, SourceKind};
use crate::storage::Sample;

/// Cumulative packet and byte counts since the programs were attached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficStats {
    pub ingress_packets: u64,
    pub ingress_bytes: u64,
    pub egress_packets: u64,
    pub egress_bytes: u64,
}

impl TrafficStats {
    fn iter(&self) -> [(&'static str, u64); 4] {
        [
            ("ingress_packets", self.ingress_packets),
            ("ingress_bytes", self.ingress_bytes),
            ("egress_packets", self.egress_packets),
            ("egress_bytes", self.egress_bytes),
        ]
    }
}

/// Latest map contents, shared by the reader thread and the source.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    latest: Mutex<Option<TrafficStats>>,
    stopped: Mutex<Option<String>>,
}

impl TrafficCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, stats: TrafficStats) {
        *self.latest.lock().unwrap_or_else(|p| p.into_inner()) = Some(stats);
    }

    /// Most recent read, `None` before the first one.
    pub fn latest(&self) -> Option<TrafficStats> {
        *self.latest.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Records that the reader failed and no further reads will come.
    pub fn mark_stopped(&self, reason: impl Into<String>) {
        let mut stopped = self.stopped.lock().unwrap_or_else(|p| p.into_inner());
        stopped.get_or_insert_with(|| reason.into());
    }

    pub fn stopped_reason(&self) -> Option<String> {
        self.stopped
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

#[derive(Debug, Clone)]
pub struct TrafficConfig {
    /// Compiled `traffic.bpf.o`.
    pub bpf_object: PathBuf,
    /// cgroup v2 directory of the node's unit.
    pub cgroup_path: PathBuf,
}

/// Attached cgroup programs and the thread reading their map.
pub struct TrafficMonitor {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TrafficMonitor {
    /// Loads and attaches the programs, returning once the first map read
    /// succeeded or attachment failed.
    pub fn attach(
        config: &TrafficConfig,
        counters: Arc<TrafficCounters>,
    ) -> Result<Self, StartupError> {
        if !config.cgroup_path.is_dir() {
            return Err(StartupError::Attach(format!(
                "cgroup {} does not exist",
                config.cgroup_path.display()
            )));
        }
        info!(
            cgroup = %config.cgroup_path.display(),
            bpf_object = %config.bpf_object.display(),
            "attaching traffic counters"
        );
        let stop = Arc::new(AtomicBool::new(false));
        let handle = reader::spawn(
            config.bpf_object.clone(),
            config.cgroup_path.clone(),
            counters,
            stop.clone(),
        )?;
        info!(cgroup = %config.cgroup_path.display(), "traffic counters attached");
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stops the reader thread and detaches the programs.
    pub fn close(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("traffic reader thread panicked");
            }
            debug!("traffic counters detached");
        }
    }
}

impl Drop for TrafficMonitor {
    fn drop(&mut self) {
        self.close();
    }
}

enum Attachment {
    /// The cgroup did not exist yet; attach on a later tick.
    Pending,
    Attached(TrafficMonitor),
    /// Counters are fed by the caller.
    External,
}

/// Counter source over the node unit's cgroup traffic.
pub struct TrafficSource {
    descriptor: SourceDescriptor,
    config: TrafficConfig,
    counters: Arc<TrafficCounters>,
    attachment: Attachment,
    tracker: CounterTracker,
}

impl TrafficSource {
    /// Attaches right away when the cgroup exists; an attach failure then
    /// is fatal. A missing cgroup is retried on every tick and reported as
    /// `Unavailable` until it appears.
    pub fn new(config: TrafficConfig, interval: Duration) -> Result<Self, StartupError> {
        let counters = Arc::new(TrafficCounters::new());
        let attachment = if config.cgroup_path.is_dir() {
            Attachment::Attached(TrafficMonitor::attach(&config, counters.clone())?)
        } else {
            warn!(
                cgroup = %config.cgroup_path.display(),
                "node cgroup not found; will retry each tick"
            );
            Attachment::Pending
        };
        Ok(Self::with_attachment(config, interval, counters, attachment))
    }

    /// Source over counters that something else keeps up to date.
    pub fn from_counters(
        config: TrafficConfig,
        interval: Duration,
        counters: Arc<TrafficCounters>,
    ) -> Self {
        Self::with_attachment(config, interval, counters, Attachment::External)
    }

    fn with_attachment(
        config: TrafficConfig,
        interval: Duration,
        counters: Arc<TrafficCounters>,
        attachment: Attachment,
    ) -> Self {
        Self {
            descriptor: SourceDescriptor::new("traffic", SourceKind::Counter, interval),
            config,
            counters,
            attachment,
            tracker: CounterTracker::new(),
        }
    }

    async fn ensure_attached(&mut self) -> Result<(), CollectError> {
        if !matches!(self.attachment, Attachment::Pending) {
            return Ok(());
        }
        if !self.config.cgroup_path.is_dir() {
            return Err(CollectError::unavailable(format!(
                "cgroup {} does not exist",
                self.config.cgroup_path.display()
            )));
        }
        let config = self.config.clone();
        let counters = self.counters.clone();
        let monitor = tokio::task::spawn_blocking(move || TrafficMonitor::attach(&config, counters))
            .await
            .map_err(|e| CollectError::unavailable(format!("traffic attach aborted: {e}")))?
            .map_err(|e| CollectError::unavailable(e.to_string()))?;
        self.attachment = Attachment::Attached(monitor);
        Ok(())
    }
}

#[async_trait]
impl Source for TrafficSource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    async fn collect(&mut self, ctx: &CollectContext) -> Result<Sample, CollectError> {
        self.ensure_attached().await?;
        if let Some(reason) = self.counters.stopped_reason() {
            return Err(CollectError::unavailable(format!(
                "traffic reader stopped: {}",
                reason
            )));
        }
        let stats = self
            .counters
            .latest()
            .ok_or_else(|| CollectError::unavailable("no traffic counters read yet"))?;

        let mut payload = serde_json::Map::new();
        payload.insert(
            "cgroup".into(),
            json!(self.config.cgroup_path.display().to_string()),
        );
        for (key, value) in stats.iter() {
            payload.insert(key.into(), json!(self.tracker.observe(key, value)));
        }
        debug!(
            ingress_bytes = stats.ingress_bytes,
            egress_bytes = stats.egress_bytes,
            "traffic read"
        );
        Ok(ctx.sample(&self.descriptor, payload.into()))
    }
}

/// Decodes one `struct traffic_stats { u64 packets; u64 bytes; }` slot.
#[cfg(any(feature = "bpf", test))]
fn decode_slot(value: &[u8]) -> Option<(u64, u64)> {
    let packets = u64::from_ne_bytes(value.get(0..8)?.try_into().ok()?);
    let bytes = u64::from_ne_bytes(value.get(8..16)?.try_into().ok()?);
    Some((packets, bytes))
}

#[cfg(feature = "bpf")]
mod reader {
    use std::fs::File;
    use std::os::fd::AsRawFd;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::thread::JoinHandle;
    use std::time::Duration;

    use libbpf_rs::{MapCore, MapFlags, ObjectBuilder};
    use tracing::error;

    use super::{TrafficCounters, TrafficStats, decode_slot};
    use crate::StartupError;

    /// Program names in `traffic.bpf.o`.
    const PROGRAMS: [&str; 2] = ["count_ingress", "count_egress"];
    const TRAFFIC_MAP: &str = "traffic_map";
    const INGRESS_KEY: u32 = 0;
    const EGRESS_KEY: u32 = 1;
    const READ_PERIOD: Duration = Duration::from_millis(100);

    pub(super) fn spawn(
        bpf_object: PathBuf,
        cgroup_path: PathBuf,
        counters: Arc<TrafficCounters>,
        stop: Arc<AtomicBool>,
    ) -> Result<JoinHandle<()>, StartupError> {
        // SAFETY: geteuid has no preconditions.
        if unsafe { libc::geteuid() } != 0 {
            return Err(StartupError::Attach(
                "attaching cgroup programs requires root".into(),
            ));
        }

        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), String>>();
        let handle = std::thread::Builder::new()
            .name("btcmon-traffic".into())
            .spawn(move || {
                if let Err(e) = run(&bpf_object, &cgroup_path, &counters, &stop, &ready_tx) {
                    if ready_tx.send(Err(e.clone())).is_err() {
                        error!(error = %e, "traffic reader stopped");
                        counters.mark_stopped(e);
                    }
                }
            })
            .map_err(|e| StartupError::Attach(format!("cannot spawn traffic reader: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(StartupError::Attach(e))
            }
            Err(_) => {
                let _ = handle.join();
                Err(StartupError::Attach("traffic reader exited during attach".into()))
            }
        }
    }

    fn run(
        bpf_object: &Path,
        cgroup_path: &Path,
        counters: &TrafficCounters,
        stop: &AtomicBool,
        ready: &mpsc::Sender<Result<(), String>>,
    ) -> Result<(), String> {
        let open = ObjectBuilder::default()
            .open_file(bpf_object)
            .map_err(|e| format!("open {}: {}", bpf_object.display(), e))?;
        let mut object = open.load().map_err(|e| format!("load BPF object: {}", e))?;
        let cgroup = File::open(cgroup_path)
            .map_err(|e| format!("open cgroup {}: {}", cgroup_path.display(), e))?;

        let mut links = Vec::with_capacity(PROGRAMS.len());
        for prog in object.progs_mut() {
            let name = prog.name().to_string_lossy().into_owned();
            if !PROGRAMS.contains(&name.as_str()) {
                continue;
            }
            let link = prog
                .attach_cgroup(cgroup.as_raw_fd())
                .map_err(|e| format!("attach {} to {}: {}", name, cgroup_path.display(), e))?;
            links.push(link);
        }
        if links.len() != PROGRAMS.len() {
            return Err(format!(
                "BPF object defines {} of {} expected programs",
                links.len(),
                PROGRAMS.len()
            ));
        }

        let map = object
            .maps()
            .find(|m| m.name() == TRAFFIC_MAP)
            .ok_or_else(|| format!("BPF object has no map {}", TRAFFIC_MAP))?;
        counters.store(read_map(&map)?);

        let _ = ready.send(Ok(()));
        while !stop.load(Ordering::Relaxed) {
            std::thread::sleep(READ_PERIOD);
            counters.store(read_map(&map)?);
        }
        drop(links);
        Ok(())
    }

    fn read_map(map: &impl MapCore) -> Result<TrafficStats, String> {
        let (ingress_packets, ingress_bytes) = read_slot(map, INGRESS_KEY)?;
        let (egress_packets, egress_bytes) = read_slot(map, EGRESS_KEY)?;
        Ok(TrafficStats {
            ingress_packets,
            ingress_bytes,
            egress_packets,
            egress_bytes,
        })
    }

    fn read_slot(map: &impl MapCore, key: u32) -> Result<(u64, u64), String> {
        let value = map
            .lookup(&key.to_ne_bytes(), MapFlags::ANY)
            .map_err(|e| format!("{} lookup {}: {}", TRAFFIC_MAP, key, e))?
            .ok_or_else(|| format!("{} has no slot {}", TRAFFIC_MAP, key))?;
        decode_slot(&value).ok_or_else(|| format!("{} slot {} is {} bytes", TRAFFIC_MAP, key, value.len()))
    }
}

#[cfg(not(feature = "bpf"))]
mod reader {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::thread::JoinHandle;

    use super::TrafficCounters;
    use crate::StartupError;

    pub(super) fn spawn(
        _bpf_object: PathBuf,
        _cgroup_path: PathBuf,
        _counters: Arc<TrafficCounters>,
        _stop: Arc<AtomicBool>,
    ) -> Result<JoinHandle<()>, StartupError> {
        Err(StartupError::Attach(
            "built without the `bpf` feature; rebuild with --features bpf".into(),
        ))
    }
}

//! Long-lived USDT subscription on the node process.
//!
//! Attaching happens once at startup on a dedicated thread that owns the
//! loaded BPF object and polls its ring buffer until closed. Every record
//! is decoded and pushed into the shared [`EventBuffer`]; the scheduler
//! only ever drains that buffer.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use tracing::{debug, info, warn};

use super::EventBuffer;
use crate::StartupError;

#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// Compiled BPF object (`p2p_net.bpf.o`).
    pub bpf_object: PathBuf,
    /// Process name (`/proc/<pid>/comm`) of the node.
    pub process_name: String,
    pub proc_root: PathBuf,
}

impl SubscriberConfig {
    pub fn new(bpf_object: impl Into<PathBuf>, process_name: impl Into<String>) -> Self {
        Self {
            bpf_object: bpf_object.into(),
            process_name: process_name.into(),
            proc_root: PathBuf::from("/proc"),
        }
    }
}

/// Finds the single running process named `name`.
///
/// Zero or several matches are both attach failures: tracepoints must go to
/// exactly one node.
pub fn find_pid(proc_root: &Path, name: &str) -> Result<u32, StartupError> {
    let entries = std::fs::read_dir(proc_root).map_err(|e| {
        StartupError::Attach(format!("cannot list {}: {}", proc_root.display(), e))
    })?;

    let mut pids = Vec::new();
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        // Processes can exit between read_dir and read.
        let Ok(comm) = std::fs::read_to_string(entry.path().join("comm")) else {
            continue;
        };
        if comm.trim_end_matches('\n') == name {
            pids.push(pid);
        }
    }

    match pids.as_slice() {
        [pid] => Ok(*pid),
        _ => Err(StartupError::Attach(format!(
            "found {} processes named {}",
            pids.len(),
            name
        ))),
    }
}

/// Handle to the kernel reader thread.
pub struct TracepointSubscriber {
    pid: u32,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TracepointSubscriber {
    /// Attaches to the node's `net` tracepoints and starts feeding `buffer`.
    ///
    /// Returns only once attachment succeeded or failed.
    pub fn attach(config: &SubscriberConfig, buffer: Arc<EventBuffer>) -> Result<Self, StartupError> {
        let pid = find_pid(&config.proc_root, &config.process_name)?;
        info!(pid, process = %config.process_name, bpf_object = %config.bpf_object.display(), "attaching net tracepoints");

        let stop = Arc::new(AtomicBool::new(false));
        let handle = reader::spawn(config.bpf_object.clone(), pid, buffer, stop.clone())?;
        info!(pid, "net tracepoints attached");
        Ok(Self {
            pid,
            stop,
            handle: Some(handle),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Stops polling and detaches. Events already buffered stay drainable.
    pub fn close(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("tracepoint reader thread panicked");
            }
            debug!(pid = self.pid, "net tracepoints detached");
        }
    }
}

impl Drop for TracepointSubscriber {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(feature = "bpf")]
mod reader {
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::thread::JoinHandle;
    use std::time::Duration;

    use chrono::Utc;
    use libbpf_rs::{MapCore, ObjectBuilder, RingBufferBuilder};
    use tracing::{error, warn};

    use crate::StartupError;
    use crate::collector::tracepoint::{EventBuffer, KernelEvent};

    /// USDT provider of the tracepoints we attach to.
    const USDT_PROVIDER: &str = "net";

    /// BPF program name → USDT tracepoint name.
    const TRACEPOINTS: [(&str, &str); 2] = [
        ("trace_inbound_message", "inbound_message"),
        ("trace_outbound_message", "outbound_message"),
    ];

    /// Ring buffer map defined by the BPF object.
    const RING_BUFFER_MAP: &str = "p2p_events";

    const POLL_TIMEOUT: Duration = Duration::from_millis(100);

    pub(super) fn spawn(
        bpf_object: PathBuf,
        pid: u32,
        buffer: Arc<EventBuffer>,
        stop: Arc<AtomicBool>,
    ) -> Result<JoinHandle<()>, StartupError> {
        // SAFETY: geteuid has no preconditions.
        if unsafe { libc::geteuid() } != 0 {
            return Err(StartupError::Attach(
                "attaching USDT tracepoints requires root".into(),
            ));
        }

        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), String>>();
        let handle = std::thread::Builder::new()
            .name("btcmon-usdt".into())
            .spawn(move || {
                if let Err(e) = run(&bpf_object, pid, &buffer, &stop, &ready_tx) {
                    // The receiver is gone once attach has reported.
                    if ready_tx.send(Err(e.clone())).is_err() {
                        error!(error = %e, "tracepoint reader stopped");
                        buffer.mark_stopped(e);
                    }
                }
            })
            .map_err(|e| StartupError::Attach(format!("cannot spawn reader thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(StartupError::Attach(e))
            }
            Err(_) => {
                let _ = handle.join();
                Err(StartupError::Attach("reader thread exited during attach".into()))
            }
        }
    }

    fn run(
        bpf_object: &Path,
        pid: u32,
        buffer: &Arc<EventBuffer>,
        stop: &AtomicBool,
        ready: &mpsc::Sender<Result<(), String>>,
    ) -> Result<(), String> {
        let open = ObjectBuilder::default()
            .open_file(bpf_object)
            .map_err(|e| format!("open {}: {}", bpf_object.display(), e))?;
        let mut object = open.load().map_err(|e| format!("load BPF object: {}", e))?;

        let binary = PathBuf::from(format!("/proc/{}/exe", pid));
        let mut links = Vec::with_capacity(TRACEPOINTS.len());
        for prog in object.progs_mut() {
            let name = prog.name().to_string_lossy().into_owned();
            let Some((_, tracepoint)) = TRACEPOINTS.iter().find(|(p, _)| *p == name) else {
                continue;
            };
            let link = prog
                .attach_usdt(pid as i32, &binary, USDT_PROVIDER, tracepoint)
                .map_err(|e| format!("attach {}:{}: {}", USDT_PROVIDER, tracepoint, e))?;
            links.push(link);
        }
        if links.len() != TRACEPOINTS.len() {
            return Err(format!(
                "BPF object defines {} of {} expected programs",
                links.len(),
                TRACEPOINTS.len()
            ));
        }

        let map = object
            .maps()
            .find(|m| m.name() == RING_BUFFER_MAP)
            .ok_or_else(|| format!("BPF object has no map {}", RING_BUFFER_MAP))?;
        let sink = buffer.clone();
        let mut builder = RingBufferBuilder::new();
        builder
            .add(&map, move |data: &[u8]| {
                match KernelEvent::decode(data, Utc::now()) {
                    Ok(event) => sink.push(event),
                    Err(e) => warn!(error = %e, "skipping undecodable event"),
                }
                0
            })
            .map_err(|e| format!("ring buffer: {}", e))?;
        let ring = builder.build().map_err(|e| format!("ring buffer: {}", e))?;

        let _ = ready.send(Ok(()));
        while !stop.load(Ordering::Relaxed) {
            if let Err(e) = ring.poll(POLL_TIMEOUT) {
                return Err(format!("ring buffer poll: {}", e));
            }
        }
        drop(links);
        Ok(())
    }
}

#[cfg(not(feature = "bpf"))]
mod reader {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::thread::JoinHandle;

    use crate::StartupError;
    use crate::collector::tracepoint::EventBuffer;

    pub(super) fn spawn(
        _bpf_object: PathBuf,
        _pid: u32,
        _buffer: Arc<EventBuffer>,
        _stop: Arc<AtomicBool>,
    ) -> Result<JoinHandle<()>, StartupError> {
        Err(StartupError::Attach(
            "built without the `bpf` feature; rebuild with --features bpf".into(),
        ))
    }
}

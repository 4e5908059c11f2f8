//! Drives every enabled source on its own cadence.
//!
//! Each source runs in its own tokio task:
//!
//! ```text
//!          jittered first delay
//!                  │
//!   ┌──────────▶ Idle ──tick──▶ Running ──ok──────────────┐
//!   │                              │                       │
//!   │                              └─err/timeout─▶ N-th    │
//!   │                                    consecutive? ─no──┤
//!   │                                          │yes        │
//!   │                                          ▼           │
//!   └──────────────── next interval ◀──── Backoff ◀────────┘
//! ```
//!
//! A failing source only produces failure records. Nothing it does can stop
//! the scheduler or delay another source; the writer lock is the only
//! point where sources meet.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::collector::{CollectContext, CollectError, Source};
use crate::storage::{SharedWriter, WriterStats};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Consecutive failures after which a source is reported as `Backoff`.
    /// `None` treats every failure on its own.
    pub failure_threshold: Option<u32>,
    /// Upper bound of the random delay before a source's first tick.
    pub max_jitter: Duration,
    /// Time in-flight collects get to finish after shutdown is requested.
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: None,
            max_jitter: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    Idle,
    Running,
    /// Failed `failure_threshold` times in a row; still retried every interval.
    Backoff,
}

/// Per-source counters, updated as the source runs.
#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub name: String,
    pub state: SourceState,
    pub ticks: u64,
    pub collect_failures: u64,
    pub write_failures: u64,
    pub consecutive_failures: u32,
    /// Still collecting when the shutdown grace period ran out.
    pub abandoned: bool,
}

impl SourceReport {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: SourceState::Idle,
            ticks: 0,
            collect_failures: 0,
            write_failures: 0,
            consecutive_failures: 0,
            abandoned: false,
        }
    }
}

/// Summary returned when the scheduler stops.
#[derive(Debug, Clone)]
pub struct SchedulerReport {
    pub sources: Vec<SourceReport>,
    pub writer: WriterStats,
}

impl SchedulerReport {
    pub fn source(&self, name: &str) -> Option<&SourceReport> {
        self.sources.iter().find(|s| s.name == name)
    }

    pub fn total_ticks(&self) -> u64 {
        self.sources.iter().map(|s| s.ticks).sum()
    }
}

pub struct Scheduler {
    sources: Vec<Box<dyn Source>>,
    writer: SharedWriter,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(writer: SharedWriter, config: SchedulerConfig) -> Self {
        Self {
            sources: Vec::new(),
            writer,
            config,
        }
    }

    /// Registers a source. Disabled descriptors are skipped.
    pub fn add_source(&mut self, source: Box<dyn Source>) {
        if source.descriptor().enabled {
            self.sources.push(source);
        } else {
            debug!(source = source.name(), "source disabled; not scheduled");
        }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Runs until `shutdown` turns true (or its sender is dropped), then
    /// drains in-flight collects within the grace period and closes the
    /// writer.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> SchedulerReport {
        let Scheduler {
            sources,
            writer,
            config,
        } = self;

        let mut reports = Vec::with_capacity(sources.len());
        let mut tasks = JoinSet::new();
        for source in sources {
            let report = Arc::new(Mutex::new(SourceReport::new(source.name())));
            info!(
                source = source.name(),
                kind = %source.descriptor().kind,
                interval = %crate::fmt::format_interval(source.interval()),
                "scheduling source"
            );
            tasks.spawn(run_source(
                source,
                writer.clone(),
                config.clone(),
                shutdown.clone(),
                report.clone(),
            ));
            reports.push(report);
        }

        while !*shutdown.borrow_and_update() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        info!(in_flight = tasks.len(), "shutdown requested; waiting for sources");

        let grace = tokio::time::sleep(config.shutdown_grace);
        tokio::pin!(grace);
        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Err(e)) if e.is_panic() => error!("source task panicked"),
                    Some(_) => {}
                },
                _ = &mut grace => {
                    warn!(
                        remaining = tasks.len(),
                        grace = %crate::fmt::format_interval(config.shutdown_grace),
                        "grace period expired; abandoning in-flight collects"
                    );
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    break;
                }
            }
        }

        let sources: Vec<SourceReport> = reports
            .iter()
            .map(|r| {
                let mut report = lock(r).clone();
                if report.state == SourceState::Running {
                    report.abandoned = true;
                }
                report
            })
            .collect();

        let closer = writer.clone();
        match tokio::task::spawn_blocking(move || closer.close()).await {
            Ok(Ok(())) => debug!("writer closed"),
            Ok(Err(e)) => error!(error = %e, "failed to close active partition"),
            Err(e) => error!(error = %e, "writer close task failed"),
        }

        SchedulerReport {
            sources,
            writer: writer.stats(),
        }
    }
}

fn lock(report: &Mutex<SourceReport>) -> std::sync::MutexGuard<'_, SourceReport> {
    report.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn first_delay(max_jitter: Duration, interval: Duration) -> Duration {
    let max_ms = max_jitter.min(interval).as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

/// Wall-clock stamp strictly after `previous`, so one source's records stay
/// ordered even if the system clock steps back.
fn next_timestamp(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous {
        Some(prev) if now <= prev => prev + chrono::Duration::microseconds(1),
        _ => now,
    }
}

async fn run_source(
    mut source: Box<dyn Source>,
    writer: SharedWriter,
    config: SchedulerConfig,
    mut shutdown: watch::Receiver<bool>,
    report: Arc<Mutex<SourceReport>>,
) {
    let descriptor = source.descriptor().clone();
    let mut next = Instant::now() + first_delay(config.max_jitter, descriptor.interval);
    let mut tick = 0u64;
    let mut last_timestamp = None;

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(next) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }
        if *shutdown.borrow() {
            break;
        }

        tick += 1;
        lock(&report).state = SourceState::Running;

        let timestamp = next_timestamp(last_timestamp);
        last_timestamp = Some(timestamp);
        let ctx = CollectContext::new(tick, timestamp);
        let started = Instant::now();
        let sample = match tokio::time::timeout(descriptor.timeout, source.collect(&ctx)).await {
            Ok(Ok(sample)) => sample,
            Ok(Err(e)) => ctx.failure(&descriptor, e),
            Err(_) => ctx.failure(&descriptor, CollectError::timeout(descriptor.timeout)),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        {
            let mut r = lock(&report);
            r.ticks += 1;
            if sample.is_ok() {
                r.consecutive_failures = 0;
                r.state = SourceState::Idle;
                debug!(source = %descriptor.name, tick, duration_ms = elapsed_ms, "collected");
            } else {
                r.collect_failures += 1;
                r.consecutive_failures += 1;
                let backoff = config
                    .failure_threshold
                    .is_some_and(|n| r.consecutive_failures >= n);
                r.state = if backoff {
                    SourceState::Backoff
                } else {
                    SourceState::Idle
                };
                if let Some(e) = &sample.error {
                    warn!(
                        source = %descriptor.name,
                        tick,
                        consecutive = r.consecutive_failures,
                        backoff,
                        error = %e,
                        "collect failed"
                    );
                }
            }
        }

        if let Err(e) = writer.append(sample).await {
            lock(&report).write_failures += 1;
            error!(source = %descriptor.name, tick, error = %e, "sample lost: write failed");
        }

        next += descriptor.interval;
        let now = Instant::now();
        if next <= now {
            let missed = (now - next).as_nanos() / descriptor.interval.as_nanos().max(1) + 1;
            debug!(source = %descriptor.name, missed = missed as u64, "collect overran interval; skipping ticks");
            next += descriptor.interval * missed as u32;
        }
    }

    debug!(source = %descriptor.name, ticks = tick, "source stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::{ScriptedSource, Step};
    use crate::collector::{CollectErrorKind, SourceDescriptor, SourceKind};
    use crate::storage::{PartitionWriter, SampleRecord, SampleStatus, list_partitions, read_partition};
    use serde_json::json;
    use std::path::Path;
    use std::sync::atomic::Ordering;
    use tempfile::tempdir;

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            failure_threshold: None,
            max_jitter: Duration::ZERO,
            shutdown_grace: Duration::from_secs(2),
        }
    }

    fn records(dir: &Path) -> Vec<SampleRecord> {
        list_partitions(dir)
            .unwrap()
            .into_iter()
            .flat_map(|(_, path)| read_partition(&path).unwrap().records)
            .collect()
    }

    async fn run_for(scheduler: Scheduler, d: Duration) -> SchedulerReport {
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run(rx));
        tokio::time::sleep(d).await;
        tx.send(true).unwrap();
        handle.await.unwrap()
    }

    #[tokio::test]
    async fn test_every_source_ticks_within_two_intervals() {
        let dir = tempdir().unwrap();
        let writer = SharedWriter::new(PartitionWriter::open(dir.path()).unwrap());
        let mut scheduler = Scheduler::new(
            writer,
            SchedulerConfig {
                max_jitter: Duration::from_millis(200),
                ..config()
            },
        );
        let interval = Duration::from_millis(200);
        let counters: Vec<_> = (0..3)
            .map(|i| {
                let src = ScriptedSource::constant(&format!("s{i}"), interval, json!({"i": i}));
                let c = src.call_counter();
                scheduler.add_source(Box::new(src));
                c
            })
            .collect();

        run_for(scheduler, interval * 2).await;
        for c in counters {
            assert!(c.load(Ordering::SeqCst) >= 1);
        }
    }

    #[tokio::test]
    async fn test_failing_source_does_not_stop_others() {
        let dir = tempdir().unwrap();
        let writer = SharedWriter::new(PartitionWriter::open(dir.path()).unwrap());
        let mut scheduler = Scheduler::new(writer, config());
        let interval = Duration::from_millis(100);
        scheduler.add_source(Box::new(ScriptedSource::failing(
            "broken",
            interval,
            CollectError::unavailable("node down"),
        )));
        scheduler.add_source(Box::new(ScriptedSource::constant(
            "healthy",
            interval,
            json!({"connection_count": 8}),
        )));

        let report = run_for(scheduler, Duration::from_millis(550)).await;
        let broken = report.source("broken").unwrap();
        let healthy = report.source("healthy").unwrap();
        assert!(broken.ticks >= 3);
        assert_eq!(broken.collect_failures, broken.ticks);
        assert!(healthy.ticks >= 3);
        assert_eq!(healthy.collect_failures, 0);
        assert_eq!(broken.state, SourceState::Idle);

        let records = records(dir.path());
        let errors: Vec<_> = records.iter().filter(|r| r.source == "broken").collect();
        assert_eq!(errors.len() as u64, broken.ticks);
        assert!(errors.iter().all(|r| r.status == SampleStatus::Error
            && r.error.as_ref().map(|e| e.kind) == Some(CollectErrorKind::Unavailable)));
        assert_eq!(
            records.iter().filter(|r| r.source == "healthy").count() as u64,
            healthy.ticks
        );
    }

    #[tokio::test]
    async fn test_error_then_recovery_on_next_tick() {
        let dir = tempdir().unwrap();
        let writer = SharedWriter::new(PartitionWriter::open(dir.path()).unwrap());
        let mut scheduler = Scheduler::new(writer, config());
        let src = ScriptedSource::constant("flaky", Duration::from_millis(100), json!({"v": 1}))
            .with_script([Step::Err(CollectError::new(CollectErrorKind::Auth, "401"))]);
        scheduler.add_source(Box::new(src));

        run_for(scheduler, Duration::from_millis(350)).await;
        let records = records(dir.path());
        assert!(records.len() >= 2);
        assert_eq!(records[0].status, SampleStatus::Error);
        assert!(records[1..].iter().all(|r| r.status == SampleStatus::Ok));
    }

    #[tokio::test]
    async fn test_slow_collect_becomes_timeout_record() {
        let dir = tempdir().unwrap();
        let writer = SharedWriter::new(PartitionWriter::open(dir.path()).unwrap());
        let mut scheduler = Scheduler::new(writer, config());
        let src = ScriptedSource::constant("slow", Duration::from_millis(500), json!({}))
            .with_script([Step::Slow(Duration::from_secs(5), json!({}))])
            .with_timeout(Duration::from_millis(100));
        scheduler.add_source(Box::new(src));

        run_for(scheduler, Duration::from_millis(300)).await;
        let records = records(dir.path());
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].error.as_ref().map(|e| e.kind),
            Some(CollectErrorKind::Timeout)
        );
    }

    #[tokio::test]
    async fn test_backoff_after_threshold() {
        let dir = tempdir().unwrap();
        let writer = SharedWriter::new(PartitionWriter::open(dir.path()).unwrap());
        let mut scheduler = Scheduler::new(
            writer,
            SchedulerConfig {
                failure_threshold: Some(2),
                ..config()
            },
        );
        let src = ScriptedSource::failing(
            "down",
            Duration::from_millis(100),
            CollectError::unavailable("refused"),
        );
        let calls = src.call_counter();
        scheduler.add_source(Box::new(src));

        let report = run_for(scheduler, Duration::from_millis(450)).await;
        let down = report.source("down").unwrap();
        assert_eq!(down.state, SourceState::Backoff);
        // Still retried at the normal interval while in backoff.
        assert!(calls.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test]
    async fn test_timestamps_strictly_increase_per_source() {
        let dir = tempdir().unwrap();
        let writer = SharedWriter::new(PartitionWriter::open(dir.path()).unwrap());
        let mut scheduler = Scheduler::new(writer, config());
        scheduler.add_source(Box::new(ScriptedSource::constant(
            "fast",
            Duration::from_millis(20),
            json!({}),
        )));

        run_for(scheduler, Duration::from_millis(300)).await;
        let records = records(dir.path());
        assert!(records.len() >= 5);
        assert!(records.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[tokio::test]
    async fn test_shutdown_abandons_collect_after_grace() {
        let dir = tempdir().unwrap();
        let writer = SharedWriter::new(PartitionWriter::open(dir.path()).unwrap());
        let mut scheduler = Scheduler::new(
            writer,
            SchedulerConfig {
                shutdown_grace: Duration::from_millis(100),
                ..config()
            },
        );
        let src = ScriptedSource::constant("stuck", Duration::from_secs(60), json!({}))
            .with_script([Step::Slow(Duration::from_secs(30), json!({}))])
            .with_timeout(Duration::from_secs(60));
        scheduler.add_source(Box::new(src));
        scheduler.add_source(Box::new(ScriptedSource::constant(
            "quick",
            Duration::from_secs(60),
            json!({"ok": true}),
        )));

        let started = std::time::Instant::now();
        let report = run_for(scheduler, Duration::from_millis(100)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(report.source("stuck").unwrap().abandoned);
        assert!(!report.source("quick").unwrap().abandoned);

        let records = records(dir.path());
        assert!(records.iter().all(|r| r.source != "stuck"));
        assert_eq!(records.iter().filter(|r| r.source == "quick").count(), 1);
    }

    #[tokio::test]
    async fn test_write_failures_are_counted_and_ticking_continues() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("results");
        let writer = SharedWriter::new(PartitionWriter::open(&base).unwrap());
        std::fs::remove_dir(&base).unwrap();

        let mut scheduler = Scheduler::new(writer.clone(), config());
        scheduler.add_source(Box::new(ScriptedSource::constant(
            "steady",
            Duration::from_millis(100),
            json!({"connection_count": 8}),
        )));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run(rx));
        tokio::time::sleep(Duration::from_millis(350)).await;
        std::fs::create_dir(&base).unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;
        tx.send(true).unwrap();
        let report = handle.await.unwrap();

        let steady = report.source("steady").unwrap();
        assert!(steady.write_failures >= 1);
        assert_eq!(steady.collect_failures, 0);
        assert_eq!(steady.state, SourceState::Idle);

        let written = records(&base).len() as u64;
        assert!(written >= 1, "no records after the directory came back");
        assert_eq!(written + steady.write_failures, steady.ticks);
        assert_eq!(report.writer.records, written);
    }

    #[tokio::test]
    async fn test_writer_refuses_appends_after_run_returns() {
        let dir = tempdir().unwrap();
        let writer = SharedWriter::new(PartitionWriter::open(dir.path()).unwrap());
        let mut scheduler = Scheduler::new(writer.clone(), config());
        scheduler.add_source(Box::new(ScriptedSource::constant(
            "once",
            Duration::from_secs(60),
            json!({}),
        )));
        run_for(scheduler, Duration::from_millis(100)).await;

        let desc = SourceDescriptor::new("late", SourceKind::Rpc, Duration::from_secs(60));
        let sample = CollectContext::new(1, Utc::now()).sample(&desc, json!({}));
        assert!(matches!(
            writer.append(sample).await,
            Err(crate::storage::WriteError::Closed)
        ));
        assert_eq!(records(dir.path()).len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_source_not_scheduled() {
        let dir = tempdir().unwrap();
        let writer = SharedWriter::new(PartitionWriter::open(dir.path()).unwrap());
        let mut scheduler = Scheduler::new(writer, config());

        struct Off(SourceDescriptor);
        #[async_trait::async_trait]
        impl Source for Off {
            fn descriptor(&self) -> &SourceDescriptor {
                &self.0
            }
            async fn collect(
                &mut self,
                _ctx: &CollectContext,
            ) -> Result<crate::storage::Sample, CollectError> {
                panic!("disabled source collected");
            }
        }
        let mut d = SourceDescriptor::new("off", SourceKind::Counter, Duration::from_millis(10));
        d.enabled = false;
        scheduler.add_source(Box::new(Off(d)));
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_next_timestamp_monotonic() {
        let future = Utc::now() + chrono::Duration::hours(1);
        let ts = next_timestamp(Some(future));
        assert!(ts > future);
        assert!(next_timestamp(None) <= Utc::now());
    }

    #[test]
    fn test_first_delay_bounded() {
        for _ in 0..100 {
            let d = first_delay(Duration::from_millis(50), Duration::from_secs(60));
            assert!(d <= Duration::from_millis(50));
        }
        assert_eq!(
            first_delay(Duration::from_secs(5), Duration::ZERO),
            Duration::ZERO
        );
    }
}

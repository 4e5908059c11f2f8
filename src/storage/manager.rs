use crate::storage::WriteError;
use crate::storage::model::{Sample, SampleRecord};
use chrono::NaiveDate;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

const PARTITION_PREFIX: &str = "btcmon_";
const PARTITION_SUFFIX: &str = ".jsonl";

/// Block size used when scanning a partition backwards for the last newline.
const TAIL_SCAN_BLOCK: u64 = 64 * 1024;

/// Path of the partition file for `date`: `<base>/btcmon_YYYY-MM-DD.jsonl`.
pub fn partition_path(base_path: &Path, date: NaiveDate) -> PathBuf {
    base_path.join(format!(
        "{}{}{}",
        PARTITION_PREFIX,
        date.format("%Y-%m-%d"),
        PARTITION_SUFFIX
    ))
}

/// Parses date from filename format: btcmon_YYYY-MM-DD.jsonl
fn parse_date_from_filename(filename: &str) -> Option<NaiveDate> {
    let date = filename
        .strip_prefix(PARTITION_PREFIX)?
        .strip_suffix(PARTITION_SUFFIX)?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

/// Counters kept by the writer for the shutdown summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub records: u64,
    pub bytes: u64,
    pub rotations: u64,
    /// Records routed to an earlier day than the active partition.
    pub late_records: u64,
}

/// The partition currently open for append.
struct ActivePartition {
    date: NaiveDate,
    path: PathBuf,
    file: File,
    /// File length after the last complete record.
    len: u64,
}

impl ActivePartition {
    fn open(base_path: &Path, date: NaiveDate) -> Result<Self, WriteError> {
        let path = partition_path(base_path, date);
        let discarded = repair_partial_tail(&path)?;
        if discarded > 0 {
            warn!(
                path = %path.display(),
                discarded_bytes = discarded,
                "partition ended in a torn record; truncated to last complete line"
            );
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            date,
            path,
            file,
            len,
        })
    }

    /// Appends one encoded line with a single write, then syncs.
    ///
    /// On failure the file is cut back to the last complete record so the
    /// next append never lands after a fragment.
    fn write_line(&mut self, line: &[u8]) -> Result<(), WriteError> {
        let result = self
            .file
            .write_all(line)
            .and_then(|_| self.file.sync_data());
        match result {
            Ok(()) => {
                self.len += line.len() as u64;
                Ok(())
            }
            Err(e) => {
                if let Err(te) = self.file.set_len(self.len) {
                    warn!(path = %self.path.display(), error = %te, "failed to roll back partial record");
                }
                Err(e.into())
            }
        }
    }

    fn close(mut self) -> Result<(), WriteError> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

/// Truncates bytes after the last newline of `path` (a record torn by a
/// crash). Returns the number of bytes removed; a missing file is not an error.
fn repair_partial_tail(path: &Path) -> io::Result<u64> {
    let mut file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let file_len = file.metadata()?.len();
    if file_len == 0 {
        return Ok(0);
    }

    let mut end = file_len;
    let mut buf = vec![0u8; TAIL_SCAN_BLOCK as usize];
    let mut valid_len = 0u64;
    while end > 0 {
        let start = end.saturating_sub(TAIL_SCAN_BLOCK);
        let chunk = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(chunk)?;
        if let Some(pos) = chunk.iter().rposition(|b| *b == b'\n') {
            valid_len = start + pos as u64 + 1;
            break;
        }
        end = start;
    }

    if valid_len < file_len {
        file.set_len(valid_len)?;
        file.sync_all()?;
    }
    Ok(file_len - valid_len)
}

/// Single-writer persistence of samples into daily partitions.
///
/// Rotation is lazy: the partition changes on the first append whose UTC
/// date differs from the active one, never on a timer, so idle days leave
/// no empty files.
pub struct PartitionWriter {
    base_path: PathBuf,
    active: Option<ActivePartition>,
    stats: WriterStats,
    closed: bool,
}

impl PartitionWriter {
    /// Prepares the result directory. No partition is opened until the
    /// first append.
    pub fn open(base_path: impl Into<PathBuf>) -> Result<Self, WriteError> {
        let base_path = base_path.into();
        std::fs::create_dir_all(&base_path)?;
        if !base_path.is_dir() {
            return Err(WriteError::PathMissing(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is not a directory", base_path.display()),
            )));
        }
        Ok(Self {
            base_path,
            active: None,
            stats: WriterStats::default(),
            closed: false,
        })
    }

    /// Appends `sample` to the partition of its UTC date.
    ///
    /// Refused once the writer is closed; no partition is reopened.
    pub fn append(&mut self, sample: &Sample) -> Result<(), WriteError> {
        if self.closed {
            return Err(WriteError::Closed);
        }
        let line = sample.to_record().to_line()?;
        let date = sample.date();

        match self.active.as_ref().map(|a| a.date) {
            Some(active) if active == date => {}
            Some(active) if date < active => return self.append_late(date, &line),
            _ => self.rotate_to(date)?,
        }

        let Some(active) = self.active.as_mut() else {
            return Err(WriteError::Io(io::Error::other("no active partition")));
        };
        active.write_line(&line)?;
        self.stats.records += 1;
        self.stats.bytes += line.len() as u64;
        Ok(())
    }

    /// Closes the active partition (flush + sync) and opens the one for `date`.
    fn rotate_to(&mut self, date: NaiveDate) -> Result<(), WriteError> {
        if let Some(prev) = self.active.take() {
            let prev_date = prev.date;
            prev.close()?;
            self.stats.rotations += 1;
            info!(from = %prev_date, to = %date, "rotated partition");
        }
        let next = ActivePartition::open(&self.base_path, date)?;
        debug!(path = %next.path.display(), existing_bytes = next.len, "partition opened");
        self.active = Some(next);
        Ok(())
    }

    /// Writes a record captured before the active partition's day into its
    /// own day's file without moving the active partition backwards.
    fn append_late(&mut self, date: NaiveDate, line: &[u8]) -> Result<(), WriteError> {
        let mut partition = ActivePartition::open(&self.base_path, date)?;
        partition.write_line(line)?;
        partition.close()?;
        self.stats.records += 1;
        self.stats.bytes += line.len() as u64;
        self.stats.late_records += 1;
        debug!(date = %date, "late record appended to earlier partition");
        Ok(())
    }

    /// Flushes and syncs the active partition, keeping it open.
    pub fn flush(&mut self) -> Result<(), WriteError> {
        if let Some(active) = self.active.as_mut() {
            active.file.flush()?;
            active.file.sync_all()?;
        }
        Ok(())
    }

    /// Flushes and closes the active partition. Later appends fail with
    /// [`WriteError::Closed`].
    pub fn close(&mut self) -> Result<(), WriteError> {
        self.closed = true;
        match self.active.take() {
            Some(active) => active.close(),
            None => Ok(()),
        }
    }

    /// Date of the partition currently open for append.
    pub fn active_date(&self) -> Option<NaiveDate> {
        self.active.as_ref().map(|a| a.date)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn stats(&self) -> &WriterStats {
        &self.stats
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

/// Cloneable handle serialising concurrent appends onto one writer.
#[derive(Clone)]
pub struct SharedWriter {
    inner: Arc<Mutex<PartitionWriter>>,
}

impl SharedWriter {
    pub fn new(writer: PartitionWriter) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    /// Appends under the writer lock on the calling thread.
    pub fn append_blocking(&self, sample: &Sample) -> Result<(), WriteError> {
        let mut writer = self.inner.lock().map_err(|_| WriteError::Poisoned)?;
        writer.append(sample)
    }

    /// Appends on the blocking pool so file I/O stays off the async workers.
    pub async fn append(&self, sample: Sample) -> Result<(), WriteError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.append_blocking(&sample))
            .await
            .map_err(|e| WriteError::Io(io::Error::other(e)))?
    }

    pub fn flush(&self) -> Result<(), WriteError> {
        self.inner.lock().map_err(|_| WriteError::Poisoned)?.flush()
    }

    pub fn close(&self) -> Result<(), WriteError> {
        self.inner.lock().map_err(|_| WriteError::Poisoned)?.close()
    }

    pub fn stats(&self) -> WriterStats {
        self.inner
            .lock()
            .map(|w| w.stats().clone())
            .unwrap_or_default()
    }

    pub fn active_date(&self) -> Option<NaiveDate> {
        self.inner.lock().ok().and_then(|w| w.active_date())
    }
}

/// Records read back from a partition file.
#[derive(Debug, Default)]
pub struct PartitionContents {
    pub records: Vec<SampleRecord>,
    /// Lines that failed to parse (at most the torn last record after a crash).
    pub corrupt_lines: usize,
}

/// Reads every record of a partition, skipping unparsable lines.
pub fn read_partition(path: &Path) -> io::Result<PartitionContents> {
    let reader = BufReader::new(File::open(path)?);
    let mut contents = PartitionContents::default();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<SampleRecord>(&line) {
            Ok(record) => contents.records.push(record),
            Err(_) => contents.corrupt_lines += 1,
        }
    }
    Ok(contents)
}

/// Lists partition files under `base_path`, oldest first.
pub fn list_partitions(base_path: &Path) -> io::Result<Vec<(NaiveDate, PathBuf)>> {
    let mut partitions = Vec::new();
    for entry in std::fs::read_dir(base_path)? {
        let path = entry?.path();
        let date = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_date_from_filename);
        if let Some(date) = date {
            partitions.push((date, path));
        }
    }
    partitions.sort();
    Ok(partitions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{
        CollectContext, CollectError, CollectErrorKind, SourceDescriptor, SourceKind,
    };
    use chrono::{DateTime, TimeZone, Utc};
    use std::time::Duration;
    use tempfile::tempdir;

    fn sample_at(source: &str, ts: DateTime<Utc>, value: u64) -> Sample {
        let desc = SourceDescriptor::new(source, SourceKind::Rpc, Duration::from_secs(60));
        let ctx = CollectContext::new(1, ts);
        Sample::ok(&desc, &ctx, serde_json::json!({ "connection_count": value }))
    }

    fn day(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, d, h, 30, 0).unwrap()
    }

    #[test]
    fn test_rotation_creates_one_partition_per_day() {
        let dir = tempdir().unwrap();
        let mut writer = PartitionWriter::open(dir.path()).unwrap();

        writer.append(&sample_at("a", day(14, 23), 1)).unwrap();
        writer.append(&sample_at("a", day(15, 0), 2)).unwrap();
        writer.close().unwrap();

        let partitions = list_partitions(dir.path()).unwrap();
        assert_eq!(partitions.len(), 2);
        for (date, path) in &partitions {
            let contents = read_partition(path).unwrap();
            assert_eq!(contents.records.len(), 1);
            assert!(
                contents
                    .records
                    .iter()
                    .all(|r| r.timestamp.date_naive() == *date)
            );
        }
        assert_eq!(writer.stats().rotations, 1);
    }

    #[test]
    fn test_same_day_samples_share_partition() {
        let dir = tempdir().unwrap();
        let mut writer = PartitionWriter::open(dir.path()).unwrap();

        writer.append(&sample_at("a", day(15, 1), 1)).unwrap();
        writer.append(&sample_at("b", day(15, 22), 2)).unwrap();
        writer.close().unwrap();

        let partitions = list_partitions(dir.path()).unwrap();
        assert_eq!(partitions.len(), 1);
        assert_eq!(read_partition(&partitions[0].1).unwrap().records.len(), 2);
    }

    #[test]
    fn test_no_partition_before_first_append() {
        let dir = tempdir().unwrap();
        let writer = PartitionWriter::open(dir.path()).unwrap();
        assert!(writer.active_date().is_none());
        assert!(list_partitions(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_append_after_close_is_refused() {
        let dir = tempdir().unwrap();
        let writer = SharedWriter::new(PartitionWriter::open(dir.path()).unwrap());
        writer.append_blocking(&sample_at("a", day(15, 1), 1)).unwrap();
        writer.close().unwrap();

        let err = writer.append_blocking(&sample_at("a", day(16, 1), 2)).unwrap_err();
        assert!(matches!(err, WriteError::Closed));
        assert_eq!(writer.active_date(), None);
        assert_eq!(list_partitions(dir.path()).unwrap().len(), 1);
        assert_eq!(writer.stats().records, 1);
    }

    #[test]
    fn test_late_sample_goes_to_its_own_day() {
        let dir = tempdir().unwrap();
        let mut writer = PartitionWriter::open(dir.path()).unwrap();

        writer.append(&sample_at("a", day(14, 23), 1)).unwrap();
        writer.append(&sample_at("a", day(15, 0), 2)).unwrap();
        // Captured before midnight by a slow source, appended after rotation.
        writer.append(&sample_at("slow", day(14, 23), 3)).unwrap();
        assert_eq!(writer.active_date(), Some(day(15, 0).date_naive()));
        writer.close().unwrap();

        let d14 = read_partition(&partition_path(dir.path(), day(14, 0).date_naive())).unwrap();
        let d15 = read_partition(&partition_path(dir.path(), day(15, 0).date_naive())).unwrap();
        assert_eq!(d14.records.len(), 2);
        assert_eq!(d15.records.len(), 1);
        assert_eq!(writer.stats().late_records, 1);
    }

    #[test]
    fn test_round_trip_field_equality() {
        let dir = tempdir().unwrap();
        let mut writer = PartitionWriter::open(dir.path()).unwrap();

        let desc = SourceDescriptor::new("getpeerinfo", SourceKind::Rpc, Duration::from_secs(60));
        let ctx = CollectContext::new(2, day(15, 3));
        let ok = Sample::ok(&desc, &ctx, serde_json::json!({"peer_count": 2, "peers": [{"id": 1}, {"id": 2}]}));
        let failed = Sample::failed(
            &desc,
            &ctx,
            CollectError::new(CollectErrorKind::Timeout, "took too long"),
        );
        writer.append(&ok).unwrap();
        writer.append(&failed).unwrap();
        writer.close().unwrap();

        let contents = read_partition(&partition_path(dir.path(), day(15, 0).date_naive())).unwrap();
        assert_eq!(contents.corrupt_lines, 0);
        assert_eq!(contents.records, vec![ok.to_record(), failed.to_record()]);
    }

    #[test]
    fn test_torn_tail_is_repaired_on_reopen() {
        let dir = tempdir().unwrap();
        let date = day(15, 0).date_naive();
        {
            let mut writer = PartitionWriter::open(dir.path()).unwrap();
            writer.append(&sample_at("a", day(15, 1), 1)).unwrap();
            writer.close().unwrap();
        }
        // Simulate a crash mid-write.
        let path = partition_path(dir.path(), date);
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(br#"{"source":"a","kind":"rp"#).unwrap();
        drop(f);
        assert_eq!(read_partition(&path).unwrap().corrupt_lines, 1);

        let mut writer = PartitionWriter::open(dir.path()).unwrap();
        writer.append(&sample_at("a", day(15, 2), 2)).unwrap();
        writer.close().unwrap();

        let contents = read_partition(&path).unwrap();
        assert_eq!(contents.corrupt_lines, 0);
        assert_eq!(contents.records.len(), 2);
    }

    #[test]
    fn test_repair_partial_tail_without_any_newline() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.jsonl");
        std::fs::write(&path, b"garbage-without-newline").unwrap();
        assert_eq!(repair_partial_tail(&path).unwrap(), 23);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
        assert_eq!(repair_partial_tail(&dir.path().join("missing")).unwrap(), 0);
    }

    #[test]
    fn test_concurrent_appends_are_not_interleaved() {
        let dir = tempdir().unwrap();
        let writer = SharedWriter::new(PartitionWriter::open(dir.path()).unwrap());
        let ts = Utc::now();
        let big = "x".repeat(16 * 1024);

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let writer = writer.clone();
                let big = big.clone();
                std::thread::spawn(move || {
                    let desc = SourceDescriptor::new(
                        format!("source-{i}"),
                        SourceKind::Counter,
                        Duration::from_secs(5),
                    );
                    let ctx = CollectContext::new(1, ts);
                    let sample = Sample::ok(&desc, &ctx, serde_json::json!({ "blob": big, "i": i }));
                    writer.append_blocking(&sample).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        writer.close().unwrap();

        let contents = read_partition(&partition_path(dir.path(), ts.date_naive())).unwrap();
        assert_eq!(contents.corrupt_lines, 0);
        assert_eq!(contents.records.len(), 16);
        let mut names: Vec<_> = contents.records.iter().map(|r| r.source.clone()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 16);
    }

    #[test]
    fn test_open_fails_when_base_is_a_file() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("not-a-dir");
        std::fs::write(&file_path, b"").unwrap();
        assert!(PartitionWriter::open(&file_path).is_err());
    }

    #[test]
    fn test_parse_date_from_filename() {
        let date = parse_date_from_filename("btcmon_2026-10-15.jsonl");
        assert_eq!(date.unwrap().to_string(), "2026-10-15");
        assert!(parse_date_from_filename("btcmon_2026-10-15.jsonl.tmp").is_none());
        assert!(parse_date_from_filename("rpglot_2026-02-07_17.zst").is_none());
    }

    #[tokio::test]
    async fn test_shared_writer_async_append() {
        let dir = tempdir().unwrap();
        let writer = SharedWriter::new(PartitionWriter::open(dir.path()).unwrap());
        let ts = Utc::now();
        writer.append(sample_at("a", ts, 8)).await.unwrap();
        writer.flush().unwrap();
        assert_eq!(writer.stats().records, 1);
        assert_eq!(writer.active_date(), Some(ts.date_naive()));
    }
}

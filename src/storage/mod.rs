//! Day-partitioned record store.
//!
//! One JSON object per line, one file per UTC day
//! (`btcmon_YYYY-MM-DD.jsonl`), exactly one partition open for append.

mod error;
pub mod manager;
pub mod model;

pub use error::WriteError;
pub use manager::{
    PartitionContents, PartitionWriter, SharedWriter, WriterStats, list_partitions,
    partition_path, read_partition,
};
pub use model::{Sample, SampleRecord, SampleStatus};

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![warn(clippy::panic)]
#![cfg_attr(test, allow(clippy::panic))]
#![allow(clippy::result_large_err)]

//! Bulk-load write path and background merge engine for partitioned,
//! log-structured storage tablets.
//!
//! Parallel load workers stream rows directly into new, immutable table
//! segments for a tablet, bypassing the row-by-row transaction log; an
//! asynchronous merge job then freezes the accumulated write buffers,
//! verifies csn-range continuity, deduplicates overlapping blocks, and
//! publishes one sorted, checksum-reported durable table.

pub use error::{Error, ErrorKind, LoadError};

pub mod config;

mod checksum;
mod error;
mod load_context;
mod merge_job;
mod meta_tree;
mod redo;
mod registry;
mod scheduler;
mod slice;
mod tablestore;
#[cfg(test)]
mod test_utils;
mod types;
mod utils;
mod write_buffer;

pub use checksum::{ChecksumReport, ChecksumReporter, RecordingChecksumReporter};
pub use config::Settings;
pub use load_context::LoadParams;
pub use meta_tree::BlockMetaTree;
pub use redo::{LocalRedoLog, RedoLogWriter, RedoRecord};
pub use registry::{ExecutionAttempt, LoadRegistry};
pub use scheduler::{MergeJobParams, MergeScheduler, NoopMergeScheduler, TokioMergeScheduler};
pub use slice::{SliceInfo, SliceWriter};
pub use tablestore::{TableStore, TabletMeta};
pub use types::{
    Block, ColumnGroupSpec, Csn, CsnRange, LoadKind, LoadSchema, Row, Table, TableClass, TableKey,
    TableKind, TabletId, TabletLoadKey,
};
pub use write_buffer::{BufferManager, FrozenBuffer};

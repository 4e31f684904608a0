use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::LoadError;
use crate::types::{Block, LoadSchema, TabletId};

/// Running checksum over block content checksums, folded in sorted block
/// order. Used for table-level verification.
pub fn fold_block_checksums(blocks: &[Block]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for block in blocks {
        hasher.update(&block.checksum().to_le_bytes());
    }
    hasher.finalize()
}

/// Per-column checksums over all rows of the given blocks, in block order.
/// `column_count` bounds the vector so short rows surface as mismatches
/// rather than silently shrinking it.
pub fn column_checksums(blocks: &[Block], column_count: usize) -> Vec<u32> {
    let mut hashers: Vec<crc32fast::Hasher> = (0..column_count)
        .map(|_| crc32fast::Hasher::new())
        .collect();
    for block in blocks {
        for row in block.rows() {
            for (idx, hasher) in hashers.iter_mut().enumerate() {
                if let Some(value) = row.columns.get(idx) {
                    hasher.update(value);
                }
            }
        }
    }
    hashers.into_iter().map(|h| h.finalize()).collect()
}

/// Per-column checksums of a column-oriented table, sourced from the group
/// that owns each column. Columns of the rowkey-based group come from that
/// group; every other column comes from the first group containing it.
pub fn column_group_checksums(
    schema: &LoadSchema,
    group_blocks: &[Vec<Block>],
) -> Vec<u32> {
    let mut result = vec![0u32; schema.column_count];
    let mut assigned = vec![false; schema.column_count];
    let rowkey_group = schema.rowkey_group_index();
    let order: Vec<usize> = rowkey_group
        .into_iter()
        .chain((0..schema.column_groups.len()).filter(|i| Some(*i) != rowkey_group))
        .collect();
    for group_idx in order {
        let spec = &schema.column_groups[group_idx];
        let blocks = &group_blocks[group_idx];
        let sums = column_checksums(blocks, spec.columns.len());
        for (pos, &column) in spec.columns.iter().enumerate() {
            if column < schema.column_count && !assigned[column] {
                result[column] = sums[pos];
                assigned[column] = true;
            }
        }
    }
    result
}

/// Report handed to the verification collaborator after a committed merge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChecksumReport {
    pub tablet_id: TabletId,
    pub table_id: u64,
    pub execution_id: u64,
    pub task_id: u64,
    pub column_checksums: Vec<u32>,
}

/// The checksum verification collaborator.
#[async_trait]
pub trait ChecksumReporter: Send + Sync {
    async fn report(&self, report: ChecksumReport) -> Result<(), LoadError>;
}

/// Records reports in memory; can be armed to fail a number of times to
/// exercise the bounded retry path.
#[derive(Default)]
pub struct RecordingChecksumReporter {
    reports: Mutex<Vec<ChecksumReport>>,
    fail_remaining: AtomicU32,
}

impl RecordingChecksumReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` report calls fail with `NeedRetry`.
    pub fn fail_next(&self, count: u32) {
        self.fail_remaining.store(count, Ordering::Release);
    }

    pub fn reports(&self) -> Vec<ChecksumReport> {
        self.reports.lock().clone()
    }
}

#[async_trait]
impl ChecksumReporter for RecordingChecksumReporter {
    async fn report(&self, report: ChecksumReport) -> Result<(), LoadError> {
        let remaining = self.fail_remaining.load(Ordering::Acquire);
        if remaining > 0 {
            self.fail_remaining.store(remaining - 1, Ordering::Release);
            return Err(LoadError::NeedRetry);
        }
        self.reports.lock().push(report);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ColumnGroupSpec, Row};
    use bytes::Bytes;

    fn block(rows: &[(&[u8], &[&[u8]])]) -> Block {
        Block::seal(
            rows.iter()
                .map(|(k, vals)| {
                    Row::new(
                        Bytes::copy_from_slice(k),
                        vals.iter().map(|v| Bytes::copy_from_slice(v)).collect(),
                    )
                })
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_fold_is_order_sensitive() {
        let a = block(&[(b"a", &[b"1"])]);
        let b = block(&[(b"b", &[b"2"])]);
        let ab = fold_block_checksums(&[a.clone(), b.clone()]);
        let ba = fold_block_checksums(&[b, a]);
        assert_ne!(ab, ba);
    }

    #[test]
    fn test_column_checksums_distinguish_columns() {
        let blocks = vec![block(&[(b"a", &[b"x", b"y"]), (b"b", &[b"x", b"z"])])];
        let sums = column_checksums(&blocks, 2);
        assert_eq!(sums.len(), 2);
        assert_ne!(sums[0], sums[1]);
    }

    #[test]
    fn test_column_group_checksums_match_row_major_layout() {
        // two columns split across two groups must checksum identically to
        // the row-major computation per column
        let base = vec![block(&[(b"a", &[b"x", b"y"]), (b"b", &[b"u", b"v"])])];
        let row_major = column_checksums(&base, 2);

        let schema = LoadSchema {
            schema_version: 1,
            column_count: 2,
            rowkey_column_count: 1,
            column_groups: vec![
                ColumnGroupSpec {
                    columns: vec![0],
                    is_rowkey_group: true,
                },
                ColumnGroupSpec {
                    columns: vec![1],
                    is_rowkey_group: false,
                },
            ],
        };
        let group0 = vec![block(&[(b"a", &[b"x"]), (b"b", &[b"u"])])];
        let group1 = vec![block(&[(b"a", &[b"y"]), (b"b", &[b"v"])])];
        let grouped = column_group_checksums(&schema, &[group0, group1]);
        assert_eq!(grouped, row_major);
    }

    #[tokio::test]
    async fn test_recording_reporter_fails_then_succeeds() {
        let reporter = RecordingChecksumReporter::new();
        reporter.fail_next(2);
        let report = ChecksumReport {
            tablet_id: TabletId::new(1),
            table_id: 2,
            execution_id: 3,
            task_id: 4,
            column_checksums: vec![5],
        };
        assert!(reporter.report(report.clone()).await.is_err());
        assert!(reporter.report(report.clone()).await.is_err());
        reporter.report(report.clone()).await.unwrap();
        assert_eq!(reporter.reports(), vec![report]);
    }
}

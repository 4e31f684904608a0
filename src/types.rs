use std::fmt::{Display, Formatter};
use std::sync::Arc;

use bytes::Bytes;

use crate::error::LoadError;

/// Commit sequence number. Totally ordered and monotonically increasing per
/// log stream; every data, start, and commit record carries one.
///
/// `Csn::MIN` is the unset sentinel: a context whose start or commit csn is
/// `MIN` has not yet observed the corresponding record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Csn(u64);

impl Csn {
    pub const MIN: Csn = Csn(0);

    pub fn new(value: u64) -> Self {
        Csn(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    /// Whether this csn carries a real value (anything but the sentinel).
    pub fn is_set(self) -> bool {
        self.0 > 0
    }

    /// The csn immediately before this one. Used for the placeholder range
    /// `[start.prev(), start)` published at campaign start.
    pub fn prev(self) -> Csn {
        Csn(self.0.saturating_sub(1))
    }

    pub fn next(self) -> Csn {
        Csn(self.0 + 1)
    }
}

impl Display for Csn {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Half-open csn interval `[start, end)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct CsnRange {
    pub start: Csn,
    pub end: Csn,
}

impl CsnRange {
    pub fn new(start: Csn, end: Csn) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

impl Display for CsnRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// The unit of partitioned storage this crate operates on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TabletId(u64);

impl TabletId {
    pub fn new(id: u64) -> Self {
        TabletId(id)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl Display for TabletId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a load replaces the tablet's baseline or appends a delta.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LoadKind {
    Full,
    Incremental,
}

impl Display for LoadKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadKind::Full => write!(f, "full"),
            LoadKind::Incremental => write!(f, "incremental"),
        }
    }
}

/// Unique key into the tenant registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TabletLoadKey {
    pub tablet_id: TabletId,
    pub kind: LoadKind,
}

impl TabletLoadKey {
    pub fn new(tablet_id: TabletId, kind: LoadKind) -> Self {
        Self { tablet_id, kind }
    }
}

impl Display for TabletLoadKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.tablet_id, self.kind)
    }
}

/// Physical layout tag of a produced table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TableKind {
    RowMajor,
    ColumnOriented,
    ColumnGroup(u16),
}

/// Identity of the table being built. Immutable once assigned; the csn span
/// a concrete output covers lives on [`Table`], not on the identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TableKey {
    pub tablet_id: TabletId,
    pub kind: TableKind,
    pub snapshot_version: u64,
}

impl Display for TableKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{}:{:?}",
            self.tablet_id, self.snapshot_version, self.kind
        )
    }
}

/// Completeness class of a produced table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableClass {
    /// Final, baseline durable table of a committed full load.
    Major,
    /// Partial merge output; will be folded into later merges.
    Intermediate,
    /// Committed output of an incremental load.
    Delta,
}

/// One row streamed by a load worker: rowkey plus column values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Row {
    pub key: Bytes,
    pub columns: Vec<Bytes>,
}

impl Row {
    pub fn new(key: impl Into<Bytes>, columns: Vec<Bytes>) -> Self {
        Self {
            key: key.into(),
            columns,
        }
    }
}

/// An immutable, sealed run of rows. The end key is the maximum rowkey in
/// the block; the checksum is computed over the encoded content at seal
/// time and never recomputed afterwards.
#[derive(Clone, Debug)]
pub struct Block {
    rows: Arc<[Row]>,
    end_key: Bytes,
    checksum: u32,
}

impl Block {
    /// Seals a non-empty run of rows into a block.
    pub fn seal(rows: Vec<Row>) -> Result<Block, LoadError> {
        let Some(last) = rows.last() else {
            return Err(LoadError::InvalidArgument("cannot seal an empty block"));
        };
        let end_key = last.key.clone();
        let mut hasher = crc32fast::Hasher::new();
        for row in &rows {
            hasher.update(&row.key);
            for column in &row.columns {
                hasher.update(column);
            }
        }
        Ok(Block {
            rows: rows.into(),
            end_key,
            checksum: hasher.finalize(),
        })
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn row_count(&self) -> u64 {
        self.rows.len() as u64
    }

    pub fn end_key(&self) -> &Bytes {
        &self.end_key
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }
}

/// One column-subset of a column-oriented layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnGroupSpec {
    pub columns: Vec<usize>,
    pub is_rowkey_group: bool,
}

/// Schema metadata the load path consumes. Resolved lazily exactly once per
/// context before the first slice writer is admitted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadSchema {
    pub schema_version: u64,
    pub column_count: usize,
    pub rowkey_column_count: usize,
    pub column_groups: Vec<ColumnGroupSpec>,
}

impl LoadSchema {
    pub fn is_column_oriented(&self) -> bool {
        !self.column_groups.is_empty()
    }

    pub fn rowkey_group_index(&self) -> Option<usize> {
        self.column_groups.iter().position(|cg| cg.is_rowkey_group)
    }
}

/// A produced output table: identity, covered csn span, deduplicated sorted
/// blocks, and the checksums reported to the verification collaborator.
///
/// Column-oriented tables additionally carry their per-column-group parts.
#[derive(Clone, Debug)]
pub struct Table {
    pub key: TableKey,
    pub class: TableClass,
    pub csn_range: CsnRange,
    pub blocks: Vec<Block>,
    pub row_count: u64,
    pub checksum: u32,
    pub column_checksums: Vec<u32>,
    pub column_groups: Vec<Table>,
}

impl Table {
    /// The empty placeholder published at campaign start so readers never
    /// observe a window with no entry for the identity.
    pub fn placeholder(key: TableKey, start_csn: Csn) -> Table {
        Table {
            key,
            class: TableClass::Intermediate,
            csn_range: CsnRange::new(start_csn.prev(), start_csn),
            blocks: Vec::new(),
            row_count: 0,
            checksum: 0,
            column_checksums: Vec::new(),
            column_groups: Vec::new(),
        }
    }

    pub fn is_major(&self) -> bool {
        self.class == TableClass::Major
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(key: &[u8], val: &[u8]) -> Row {
        Row::new(Bytes::copy_from_slice(key), vec![Bytes::copy_from_slice(val)])
    }

    #[test]
    fn test_block_seal_sets_end_key_and_checksum() {
        let block = Block::seal(vec![row(b"a", b"1"), row(b"b", b"2")]).unwrap();
        assert_eq!(block.end_key().as_ref(), b"b");
        assert_eq!(block.row_count(), 2);
        assert_ne!(block.checksum(), 0);

        // same content seals to the same checksum
        let again = Block::seal(vec![row(b"a", b"1"), row(b"b", b"2")]).unwrap();
        assert_eq!(block.checksum(), again.checksum());
    }

    #[test]
    fn test_block_seal_rejects_empty_runs() {
        assert!(matches!(
            Block::seal(Vec::new()),
            Err(LoadError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_csn_prev_saturates_at_min() {
        assert_eq!(Csn::MIN.prev(), Csn::MIN);
        assert_eq!(Csn::new(5).prev(), Csn::new(4));
        assert!(!Csn::MIN.is_set());
        assert!(Csn::new(1).is_set());
    }

    #[test]
    fn test_placeholder_covers_the_pre_start_range() {
        let key = TableKey {
            tablet_id: TabletId::new(7),
            kind: TableKind::RowMajor,
            snapshot_version: 3,
        };
        let table = Table::placeholder(key, Csn::new(10));
        assert_eq!(table.csn_range, CsnRange::new(Csn::new(9), Csn::new(10)));
        assert!(table.blocks.is_empty());
        assert!(!table.is_major());
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::LoadError;
use crate::types::{Csn, LoadKind, TableKey, TabletId};
use crate::utils::MonotonicSeq;

/// The redo-log collaborator. Each write returns only after the record is
/// durable, or known to be durably routed elsewhere (signalled by the
/// remote-write flag on commit records).
#[async_trait]
pub trait RedoLogWriter: Send + Sync {
    /// Writes the campaign start record and returns its csn.
    async fn write_start_record(
        &self,
        table_key: &TableKey,
        execution_id: u64,
        format_version: u64,
        kind: LoadKind,
    ) -> Result<Csn, LoadError>;

    /// Writes the campaign commit record. Returns the commit csn and
    /// whether the record was routed to a remote leader (in which case the
    /// local side must not wait for the merge itself).
    async fn write_commit_record(
        &self,
        table_key: &TableKey,
        start_csn: Csn,
    ) -> Result<(Csn, bool), LoadError>;

    /// Stamps one sealed data block with a csn.
    async fn write_data_record(&self, tablet_id: TabletId) -> Result<Csn, LoadError>;
}

/// A durable record as observed by [`LocalRedoLog`]. Retained for replay
/// and test inspection.
#[derive(Clone, Debug)]
pub enum RedoRecord {
    Start {
        table_key: TableKey,
        execution_id: u64,
        format_version: u64,
        kind: LoadKind,
        csn: Csn,
    },
    Data {
        tablet_id: TabletId,
        csn: Csn,
    },
    Commit {
        table_key: TableKey,
        start_csn: Csn,
        csn: Csn,
    },
}

impl RedoRecord {
    pub fn csn(&self) -> Csn {
        match self {
            RedoRecord::Start { csn, .. } => *csn,
            RedoRecord::Data { csn, .. } => *csn,
            RedoRecord::Commit { csn, .. } => *csn,
        }
    }
}

/// In-process redo log: a single monotonically increasing csn stream with a
/// retained record history. Backs tests and single-node deployments; in a
/// replicated deployment the trait is implemented over the log transport.
pub struct LocalRedoLog {
    seq: MonotonicSeq,
    records: Mutex<Vec<RedoRecord>>,
}

impl Default for LocalRedoLog {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalRedoLog {
    pub fn new() -> Self {
        Self {
            seq: MonotonicSeq::new(0),
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// The csn of the most recently written record.
    pub fn latest_csn(&self) -> Csn {
        Csn::new(self.seq.load())
    }

    /// Snapshot of the durable record history.
    pub fn records(&self) -> Vec<RedoRecord> {
        self.records.lock().clone()
    }

    fn push(&self, record: RedoRecord) -> Csn {
        let csn = record.csn();
        self.records.lock().push(record);
        csn
    }
}

#[async_trait]
impl RedoLogWriter for LocalRedoLog {
    async fn write_start_record(
        &self,
        table_key: &TableKey,
        execution_id: u64,
        format_version: u64,
        kind: LoadKind,
    ) -> Result<Csn, LoadError> {
        let csn = Csn::new(self.seq.next());
        Ok(self.push(RedoRecord::Start {
            table_key: *table_key,
            execution_id,
            format_version,
            kind,
            csn,
        }))
    }

    async fn write_commit_record(
        &self,
        table_key: &TableKey,
        start_csn: Csn,
    ) -> Result<(Csn, bool), LoadError> {
        let csn = Csn::new(self.seq.next());
        self.push(RedoRecord::Commit {
            table_key: *table_key,
            start_csn,
            csn,
        });
        Ok((csn, false))
    }

    async fn write_data_record(&self, tablet_id: TabletId) -> Result<Csn, LoadError> {
        let csn = Csn::new(self.seq.next());
        Ok(self.push(RedoRecord::Data { tablet_id, csn }))
    }
}

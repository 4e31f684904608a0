use std::collections::HashMap;

use log::info;
use parking_lot::RwLock;
use tokio::sync::watch;

use crate::error::LoadError;
use crate::types::{Csn, Table, TableClass, TabletId};
use crate::utils::MonotonicSeq;

/// Durable per-tablet view the load path consumes and maintains: the major
/// (baseline) table, the intermediate merge outputs of an in-flight full
/// load, committed incremental deltas, and the handful of load-protocol
/// fields persisted alongside them.
#[derive(Clone, Debug, Default)]
pub struct TabletMeta {
    /// Versioning token; every table-list mutation must present the
    /// current value, and bumps it, so concurrent publishers cannot lose
    /// updates.
    pub rebuild_seq: u64,
    pub major: Option<Table>,
    /// Intermediate outputs of the in-flight full load, covering a
    /// contiguous csn span starting at the placeholder range.
    pub intermediates: Vec<Table>,
    /// Committed incremental (delta) tables, in publish order.
    pub deltas: Vec<Table>,
    pub load_start_csn: Csn,
    pub load_commit_csn: Csn,
    /// Latest persisted execution id; an attempt presenting an older one is
    /// expired.
    pub load_execution_id: u64,
    pub load_snapshot_version: u64,
}

/// The table-store collaborator: an in-memory durable view keyed by tablet,
/// with compare-and-swap publishes guarded by `rebuild_seq` and a watch
/// channel that bounded waits hang off instead of sleeping.
pub struct TableStore {
    tablets: RwLock<HashMap<TabletId, TabletMeta>>,
    update_seq: MonotonicSeq,
    update_tx: watch::Sender<u64>,
}

impl Default for TableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TableStore {
    pub fn new() -> Self {
        let (update_tx, _) = watch::channel(0);
        Self {
            tablets: RwLock::new(HashMap::new()),
            update_seq: MonotonicSeq::new(0),
            update_tx,
        }
    }

    /// Creates an empty entry for the tablet. A no-op when already present.
    pub fn register_tablet(&self, tablet_id: TabletId) {
        self.tablets.write().entry(tablet_id).or_default();
    }

    /// Snapshot of the tablet's durable view.
    pub fn tablet_meta(&self, tablet_id: TabletId) -> Option<TabletMeta> {
        self.tablets.read().get(&tablet_id).cloned()
    }

    pub fn first_major(&self, tablet_id: TabletId) -> Option<Table> {
        self.tablets
            .read()
            .get(&tablet_id)
            .and_then(|meta| meta.major.clone())
    }

    pub fn rebuild_seq(&self, tablet_id: TabletId) -> Result<u64, LoadError> {
        self.tablets
            .read()
            .get(&tablet_id)
            .map(|meta| meta.rebuild_seq)
            .ok_or(LoadError::TabletMissing(tablet_id.value()))
    }

    /// Subscribes to table-store updates. The value is an opaque sequence;
    /// a change means "look again".
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.update_tx.subscribe()
    }

    /// Resets the tablet's load tables to the campaign placeholder and
    /// records the campaign's persisted protocol fields. Rejects a stale
    /// `rebuild_seq`.
    pub fn init_load_tables(
        &self,
        tablet_id: TabletId,
        placeholder: Table,
        start_csn: Csn,
        snapshot_version: u64,
        execution_id: u64,
        rebuild_seq: u64,
    ) -> Result<(), LoadError> {
        {
            let mut tablets = self.tablets.write();
            let meta = tablets
                .get_mut(&tablet_id)
                .ok_or(LoadError::TabletMissing(tablet_id.value()))?;
            if meta.rebuild_seq != rebuild_seq {
                return Err(LoadError::RebuildSeqMismatch {
                    expected: meta.rebuild_seq,
                    actual: rebuild_seq,
                });
            }
            meta.intermediates = vec![placeholder];
            meta.load_start_csn = start_csn;
            meta.load_commit_csn = Csn::MIN;
            meta.load_snapshot_version = snapshot_version;
            meta.load_execution_id = meta.load_execution_id.max(execution_id);
            meta.rebuild_seq += 1;
        }
        info!(
            "initialized load tables [tablet_id={}, start_csn={}, execution_id={}]",
            tablet_id, start_csn, execution_id
        );
        self.notify();
        Ok(())
    }

    /// Persists the commit csn into the tablet meta. A different persisted
    /// commit csn means two commit records claimed the same campaign.
    pub fn set_load_commit_csn(
        &self,
        tablet_id: TabletId,
        commit_csn: Csn,
    ) -> Result<(), LoadError> {
        {
            let mut tablets = self.tablets.write();
            let meta = tablets
                .get_mut(&tablet_id)
                .ok_or(LoadError::TabletMissing(tablet_id.value()))?;
            if meta.load_commit_csn.is_set() && meta.load_commit_csn != commit_csn {
                return Err(LoadError::CommitCsnConflict {
                    persisted: meta.load_commit_csn,
                    proposed: commit_csn,
                });
            }
            meta.load_commit_csn = commit_csn;
        }
        self.notify();
        Ok(())
    }

    /// Atomically swaps the tablet's table list for the merge output.
    ///
    /// A major output replaces the baseline and retires the intermediates;
    /// an intermediate output replaces the intermediates it absorbed (the
    /// merge always consumes all of them, verified contiguous); a delta is
    /// appended. Rejects a stale `rebuild_seq`.
    pub fn publish_table(
        &self,
        tablet_id: TabletId,
        table: Table,
        rebuild_seq: u64,
    ) -> Result<(), LoadError> {
        {
            let mut tablets = self.tablets.write();
            let meta = tablets
                .get_mut(&tablet_id)
                .ok_or(LoadError::TabletMissing(tablet_id.value()))?;
            if meta.rebuild_seq != rebuild_seq {
                return Err(LoadError::RebuildSeqMismatch {
                    expected: meta.rebuild_seq,
                    actual: rebuild_seq,
                });
            }
            match table.class {
                TableClass::Major => {
                    info!(
                        "publishing major table [tablet_id={}, csn_range={}, rows={}]",
                        tablet_id, table.csn_range, table.row_count
                    );
                    meta.major = Some(table);
                    meta.intermediates.clear();
                }
                TableClass::Intermediate => {
                    meta.intermediates = vec![table];
                }
                TableClass::Delta => {
                    meta.deltas.push(table);
                }
            }
            meta.rebuild_seq += 1;
        }
        self.notify();
        Ok(())
    }

    fn notify(&self) {
        self.update_tx.send_replace(self.update_seq.next());
    }
}

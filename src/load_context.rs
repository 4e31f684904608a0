use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_skiplist::SkipMap;
use log::{info, warn};
use tokio::sync::Notify;
use tracing::instrument;

use crate::checksum::{ChecksumReport, ChecksumReporter};
use crate::config::Settings;
use crate::error::LoadError;
use crate::redo::RedoLogWriter;
use crate::scheduler::{MergeJobParams, MergeScheduler};
use crate::slice::SliceWriter;
use crate::tablestore::{TableStore, TabletMeta};
use crate::types::{
    Csn, LoadKind, LoadSchema, Row, Table, TableKey, TableKind, TabletId,
};
use crate::write_buffer::BufferManager;

/// Build parameters bound to a context by [`TabletLoadContext::update`].
#[derive(Clone, Debug)]
pub struct LoadParams {
    pub tablet_id: TabletId,
    pub kind: LoadKind,
    /// Logical table the checksum report is keyed by.
    pub table_id: u64,
    /// Load task id carried through to the checksum report.
    pub task_id: u64,
    pub schema: LoadSchema,
    pub snapshot_version: u64,
    pub format_version: u64,
    /// Number of parallel slice writers feeding this tablet; drives the
    /// finish counters and the column-group barrier.
    pub writer_count: usize,
    /// Companion storage unit for out-of-line large object values. Its
    /// load lifecycle mirrors this tablet's.
    pub lob_tablet_id: Option<TabletId>,
    pub is_replay: bool,
}

impl LoadSchema {
    /// Schema of a lob companion tablet: rowkey plus the out-of-line value.
    pub fn lob_meta(schema_version: u64) -> LoadSchema {
        LoadSchema {
            schema_version,
            column_count: 2,
            rowkey_column_count: 1,
            column_groups: Vec::new(),
        }
    }
}

/// Injected collaborators, threaded explicitly instead of looked up from
/// process-global state.
#[derive(Clone)]
pub(crate) struct Collaborators {
    pub(crate) table_store: Arc<TableStore>,
    pub(crate) redo: Arc<dyn RedoLogWriter>,
    pub(crate) scheduler: Arc<dyn MergeScheduler>,
    pub(crate) checksums: Arc<dyn ChecksumReporter>,
}

struct CtxState {
    execution_id: Option<u64>,
    format_version: u64,
    /// Set once the campaign has fully closed (commit record durable, major
    /// produced, checksums reported). Later `close` calls are no-ops.
    task_end: bool,
}

/// Snapshot of the fields a merge job needs from the context.
#[derive(Clone, Copy, Debug)]
pub(crate) struct MergeSnapshot {
    pub(crate) table_key: TableKey,
    pub(crate) start_csn: Csn,
    pub(crate) commit_csn: Csn,
}

/// Per-tablet load state machine.
///
/// Owns the slice-writer table, the write-buffer chain, and the campaign
/// csns. The registry's shard locks never guard anything in here: the
/// state-machine fields sit behind the context's own lock, the csns are
/// atomics, and the slice table is a concurrent map so row filling is not
/// serialized by state transitions.
pub struct TabletLoadContext {
    tablet_id: TabletId,
    kind: LoadKind,
    settings: Arc<Settings>,
    collab: Collaborators,

    state: tokio::sync::Mutex<CtxState>,
    table_key: parking_lot::RwLock<Option<TableKey>>,
    start_csn: AtomicU64,
    commit_csn: AtomicU64,

    params: parking_lot::RwLock<Option<LoadParams>>,
    schema_ready: AtomicBool,
    schema: parking_lot::RwLock<Option<Arc<LoadSchema>>>,

    slices: SkipMap<u64, Arc<SliceWriter>>,
    sorted_slices: parking_lot::Mutex<Vec<Arc<SliceWriter>>>,
    finish_count: AtomicUsize,
    cg_finish_count: AtomicUsize,
    writer_total: AtomicUsize,
    barrier: Notify,

    buffers: BufferManager,
    lob: parking_lot::RwLock<Option<Arc<TabletLoadContext>>>,
}

impl TabletLoadContext {
    pub(crate) fn new(
        tablet_id: TabletId,
        kind: LoadKind,
        settings: Arc<Settings>,
        collab: Collaborators,
    ) -> Self {
        Self {
            tablet_id,
            kind,
            settings,
            collab,
            state: tokio::sync::Mutex::new(CtxState {
                execution_id: None,
                format_version: 0,
                task_end: false,
            }),
            table_key: parking_lot::RwLock::new(None),
            start_csn: AtomicU64::new(0),
            commit_csn: AtomicU64::new(0),
            params: parking_lot::RwLock::new(None),
            schema_ready: AtomicBool::new(false),
            schema: parking_lot::RwLock::new(None),
            slices: SkipMap::new(),
            sorted_slices: parking_lot::Mutex::new(Vec::new()),
            finish_count: AtomicUsize::new(0),
            cg_finish_count: AtomicUsize::new(0),
            writer_total: AtomicUsize::new(1),
            barrier: Notify::new(),
            buffers: BufferManager::new(),
            lob: parking_lot::RwLock::new(None),
        }
    }

    pub fn start_csn(&self) -> Csn {
        Csn::new(self.start_csn.load(Ordering::Acquire))
    }

    pub fn commit_csn(&self) -> Csn {
        Csn::new(self.commit_csn.load(Ordering::Acquire))
    }

    pub fn is_started(&self) -> bool {
        self.start_csn().is_set()
    }

    pub(crate) fn lob_context(&self) -> Option<Arc<TabletLoadContext>> {
        self.lob.read().clone()
    }

    pub(crate) fn buffers(&self) -> &BufferManager {
        &self.buffers
    }

    pub(crate) fn table_key(&self) -> Option<TableKey> {
        *self.table_key.read()
    }

    pub(crate) fn merge_snapshot(&self) -> Result<MergeSnapshot, LoadError> {
        let table_key = self.table_key().ok_or(LoadError::NotInitialized)?;
        Ok(MergeSnapshot {
            table_key,
            start_csn: self.start_csn(),
            commit_csn: self.commit_csn(),
        })
    }

    /// (Re)binds build parameters. Idempotent; the slice table and counters
    /// are re-armed on the first call of a campaign.
    pub(crate) async fn update(
        &self,
        lob: Option<Arc<TabletLoadContext>>,
        params: LoadParams,
    ) -> Result<(), LoadError> {
        if params.tablet_id != self.tablet_id || params.kind != self.kind {
            return Err(LoadError::InvalidArgument("params bound to a different key"));
        }
        let mut st = self.state.lock().await;
        st.format_version = params.format_version;
        let kind = if params.schema.is_column_oriented() {
            TableKind::ColumnOriented
        } else {
            TableKind::RowMajor
        };
        *self.table_key.write() = Some(TableKey {
            tablet_id: self.tablet_id,
            kind,
            snapshot_version: params.snapshot_version,
        });
        self.writer_total
            .store(params.writer_count.max(1), Ordering::Release);
        if lob.is_some() {
            *self.lob.write() = lob;
        }
        *self.params.write() = Some(params);
        Ok(())
    }

    fn current_commit_csn(&self, meta: &TabletMeta) -> Csn {
        if meta.load_commit_csn.is_set() {
            meta.load_commit_csn
        } else {
            self.commit_csn()
        }
    }

    fn tablet_meta(&self) -> Result<TabletMeta, LoadError> {
        self.collab
            .table_store
            .tablet_meta(self.tablet_id)
            .ok_or(LoadError::TabletMissing(self.tablet_id.value()))
    }

    /// Opens the campaign: issues the start record and publishes the empty
    /// placeholder table. Replay-safe: an already-committed campaign yields
    /// its historical start csn, a stale execution id yields `Expired`.
    #[instrument(level = "debug", skip_all, fields(tablet_id = %self.tablet_id))]
    pub(crate) async fn open(&self, execution_id: u64) -> Result<Csn, LoadError> {
        let mut st = self.state.lock().await;
        let meta = self.tablet_meta()?;
        if execution_id < st.execution_id.unwrap_or(0) || execution_id < meta.load_execution_id {
            info!(
                "stale execution id, not starting [tablet_id={}, execution_id={}, latest={}]",
                self.tablet_id,
                execution_id,
                st.execution_id.unwrap_or(0).max(meta.load_execution_id)
            );
            return Err(LoadError::Expired);
        }
        if self.current_commit_csn(&meta).is_set() {
            // already committed; hand back the historical start csn so the
            // caller can resume replay
            let start = if self.start_csn().is_set() {
                self.start_csn()
            } else {
                meta.load_start_csn
            };
            if !start.is_set() {
                return Err(LoadError::Unexpected("committed load without a start csn"));
            }
            self.start_csn.store(start.value(), Ordering::Release);
            st.execution_id = Some(st.execution_id.unwrap_or(0).max(execution_id));
            return Ok(start);
        }

        let table_key = self.table_key().ok_or(LoadError::NotInitialized)?;
        let start = self
            .collab
            .redo
            .write_start_record(&table_key, execution_id, st.format_version, self.kind)
            .await?;
        self.adopt_start(&mut st, start, execution_id, false)?;

        if self.kind == LoadKind::Full {
            // lob sibling first, so a crash between the two publishes never
            // leaves the lob side behind the parent
            if let Some(lob) = self.lob_context() {
                lob.adopt_start_replay(start, execution_id).await?;
                lob.init_table_store(start, execution_id).await?;
            }
            self.init_table_store(start, execution_id).await?;
        }
        info!(
            "opened tablet load [tablet_id={}, start_csn={}, execution_id={}]",
            self.tablet_id, start, execution_id
        );
        Ok(start)
    }

    /// Monotonic adoption of `(execution_id, start_csn)`. A newer pair
    /// resets campaign-local state; an older pair is expired unless the
    /// caller is replaying from a checkpoint.
    fn adopt_start(
        &self,
        st: &mut CtxState,
        start_csn: Csn,
        execution_id: u64,
        from_checkpoint: bool,
    ) -> Result<(), LoadError> {
        let current = self.start_csn();
        if current.is_set() {
            if execution_id >= st.execution_id.unwrap_or(0) && start_csn >= current {
                info!(
                    "newer attempt, resetting campaign state [tablet_id={}, execution_id={}, start_csn={}]",
                    self.tablet_id, execution_id, start_csn
                );
                self.reset_campaign_state();
            } else if !from_checkpoint {
                return Err(LoadError::Expired);
            } else {
                return Ok(());
            }
        }
        st.execution_id = Some(execution_id);
        st.task_end = false;
        self.start_csn.store(start_csn.value(), Ordering::Release);
        self.buffers.arm(start_csn);
        Ok(())
    }

    fn reset_campaign_state(&self) {
        while let Some(entry) = self.slices.pop_front() {
            entry.value().cancel();
        }
        self.sorted_slices.lock().clear();
        self.finish_count.store(0, Ordering::Release);
        self.cg_finish_count.store(0, Ordering::Release);
        self.commit_csn.store(0, Ordering::Release);
    }

    /// Adoption entry for replay and recovery (leader and follower): used
    /// when the context is rebuilt over persisted campaign state.
    pub(crate) async fn adopt_start_replay(
        &self,
        start_csn: Csn,
        execution_id: u64,
    ) -> Result<(), LoadError> {
        let mut st = self.state.lock().await;
        self.adopt_start(&mut st, start_csn, execution_id, true)
    }

    /// Rebuilds campaign csns from the persisted tablet meta after a
    /// restart.
    pub(crate) async fn recover_from_meta(&self, meta: &TabletMeta) -> Result<(), LoadError> {
        if meta.load_start_csn.is_set() {
            self.adopt_start_replay(meta.load_start_csn, meta.load_execution_id)
                .await?;
        }
        if meta.load_commit_csn.is_set() {
            self.commit_csn
                .store(meta.load_commit_csn.value(), Ordering::Release);
        }
        Ok(())
    }

    async fn init_table_store(&self, start_csn: Csn, execution_id: u64) -> Result<(), LoadError> {
        let table_key = self.table_key().ok_or(LoadError::NotInitialized)?;
        loop {
            let rebuild_seq = self.collab.table_store.rebuild_seq(self.tablet_id)?;
            let placeholder = Table::placeholder(table_key, start_csn);
            match self.collab.table_store.init_load_tables(
                self.tablet_id,
                placeholder,
                start_csn,
                table_key.snapshot_version,
                execution_id,
                rebuild_seq,
            ) {
                Err(LoadError::RebuildSeqMismatch { .. }) => continue,
                other => return other,
            }
        }
    }

    /// Lazily resolves schema metadata exactly once per context
    /// (double-checked: atomic flag, read lock, then write lock).
    pub(crate) fn ensure_schema(&self) -> Result<Arc<LoadSchema>, LoadError> {
        if self.schema_ready.load(Ordering::Acquire) {
            if let Some(schema) = self.schema.read().clone() {
                return Ok(schema);
            }
        }
        {
            let schema = self.schema.read();
            if let Some(schema) = schema.clone() {
                return Ok(schema);
            }
        }
        let mut slot = self.schema.write();
        if let Some(schema) = slot.clone() {
            return Ok(schema);
        }
        let params = self.params.read();
        let params = params.as_ref().ok_or(LoadError::NotInitialized)?;
        let schema = Arc::new(params.schema.clone());
        *slot = Some(schema.clone());
        self.schema_ready.store(true, Ordering::Release);
        Ok(schema)
    }

    /// Admits a slice writer under a fresh process-wide unique id.
    pub(crate) fn open_slice(&self, slice_id: u64, start_seq: u64) -> Result<(), LoadError> {
        self.ensure_schema()?;
        let writer = Arc::new(SliceWriter::new(
            slice_id,
            start_seq,
            self.settings.block_rows,
        ));
        self.slices.insert(slice_id, writer);
        info!(
            "added slice writer [tablet_id={}, slice_id={}, slices={}]",
            self.tablet_id,
            slice_id,
            self.slices.len()
        );
        Ok(())
    }

    pub(crate) fn slice_writer(&self, slice_id: u64) -> Option<Arc<SliceWriter>> {
        self.slices.get(&slice_id).map(|e| e.value().clone())
    }

    /// Checks that this attempt may still write: the tablet has not
    /// committed under it and its start csn is still the active one.
    fn validate_active(&self, attempt_start: Csn) -> Result<(), LoadError> {
        if self.kind != LoadKind::Full {
            return Ok(());
        }
        let meta = self.tablet_meta()?;
        if self.current_commit_csn(&meta).is_set() {
            return Err(LoadError::AlreadyCommitted);
        }
        if attempt_start != self.start_csn() {
            warn!(
                "attempt start csn superseded [tablet_id={}, attempt={}, latest={}]",
                self.tablet_id,
                attempt_start,
                self.start_csn()
            );
            return Err(LoadError::Expired);
        }
        Ok(())
    }

    /// Routes rows into the slice's writer. On a writer error the slice
    /// entry is evicted so a retried attempt starts clean.
    pub(crate) fn fill_slice(
        &self,
        slice_id: u64,
        attempt_start: Csn,
        rows: &mut dyn Iterator<Item = Row>,
    ) -> Result<u64, LoadError> {
        self.validate_active(attempt_start)?;
        let writer = self
            .slice_writer(slice_id)
            .ok_or(LoadError::SliceMissing(slice_id))?;
        match writer.fill(rows) {
            Ok(affected_rows) => Ok(affected_rows),
            Err(err) => {
                self.slices.remove(&slice_id);
                Err(err)
            }
        }
    }

    /// Closes one slice writer. The last of N writers computes the global
    /// row ordering; for column-oriented output early finishers wait on the
    /// barrier, then every writer fills its column groups.
    #[instrument(level = "debug", skip_all, fields(tablet_id = %self.tablet_id, slice_id))]
    pub(crate) async fn close_slice(
        &self,
        slice_id: u64,
        attempt_start: Csn,
    ) -> Result<(), LoadError> {
        self.validate_active(attempt_start)?;
        let writer = self
            .slice_writer(slice_id)
            .ok_or(LoadError::SliceMissing(slice_id))?;
        writer.close()?;
        for block in writer.blocks()? {
            let csn = self.collab.redo.write_data_record(self.tablet_id).await?;
            self.buffers.append(None, csn, block)?;
        }

        let schema = self.ensure_schema()?;
        let total = self.writer_total.load(Ordering::Acquire);
        let finished = self.finish_count.fetch_add(1, Ordering::AcqRel) + 1;
        info!(
            "slice closed [tablet_id={}, slice_id={}, finished={}, total={}]",
            self.tablet_id, slice_id, finished, total
        );

        if !schema.is_column_oriented() {
            self.slices.remove(&slice_id);
            return Ok(());
        }

        if finished < total {
            self.wait_row_offset(&writer, attempt_start).await?;
        } else {
            self.compute_ranges()?;
            self.barrier.notify_waiters();
        }
        self.fill_writer_column_groups(&writer, &schema).await?;
        let cg_done = self.cg_finish_count.fetch_add(1, Ordering::AcqRel) + 1;
        info!(
            "column group fill finished for slice [tablet_id={}, slice_id={}, done={}, total={}]",
            self.tablet_id, slice_id, cg_done, total
        );
        if cg_done >= total {
            self.finish_column_groups();
        }
        Ok(())
    }

    /// Blocks until range computation assigns this writer's row offset.
    /// Re-validates the start csn on every wakeup so a superseded attempt
    /// unblocks with `Expired` instead of waiting out the timeout.
    async fn wait_row_offset(
        &self,
        writer: &Arc<SliceWriter>,
        attempt_start: Csn,
    ) -> Result<(), LoadError> {
        let deadline = Instant::now() + self.settings.wait_timeout();
        loop {
            if self.kind == LoadKind::Full && attempt_start != self.start_csn() {
                return Err(LoadError::Expired);
            }
            if writer.row_offset() >= 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(LoadError::NeedRetry);
            }
            let _ = tokio::time::timeout(self.settings.wait_poll(), self.barrier.notified()).await;
        }
    }

    /// Sorts all writers by end key and assigns each a disjoint row-offset
    /// range. Writers that never contributed rows sort last.
    pub(crate) fn compute_ranges(&self) -> Result<(), LoadError> {
        let mut sorted: Vec<Arc<SliceWriter>> =
            self.slices.iter().map(|e| e.value().clone()).collect();
        sorted.sort_by(|a, b| match (a.end_key(), b.end_key()) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.slice_id().cmp(&b.slice_id()),
        });
        let mut offset: i64 = 0;
        for writer in &sorted {
            writer.set_row_offset(offset);
            offset += writer.row_count() as i64;
        }
        info!(
            "computed row ranges [tablet_id={}, writers={}, total_rows={}]",
            self.tablet_id,
            sorted.len(),
            offset
        );
        *self.sorted_slices.lock() = sorted;
        Ok(())
    }

    async fn fill_writer_column_groups(
        &self,
        writer: &Arc<SliceWriter>,
        schema: &LoadSchema,
    ) -> Result<(), LoadError> {
        if writer.is_empty() {
            return Ok(());
        }
        for (idx, spec) in schema.column_groups.iter().enumerate() {
            for block in writer.project_column_group(spec)? {
                let csn = self.collab.redo.write_data_record(self.tablet_id).await?;
                self.buffers.append(Some(idx as u16), csn, block)?;
            }
        }
        Ok(())
    }

    fn finish_column_groups(&self) {
        self.sorted_slices.lock().clear();
        while self.slices.pop_front().is_some() {}
        info!(
            "all column groups filled, slice writers released [tablet_id={}]",
            self.tablet_id
        );
    }

    /// Partitioned column-group fill for rescan workers: worker `index` of
    /// `count` fills its share of the globally sorted writers.
    pub(crate) async fn fill_column_group(
        &self,
        worker_count: usize,
        worker_index: usize,
    ) -> Result<(), LoadError> {
        if worker_count == 0 || worker_index >= worker_count {
            return Err(LoadError::InvalidArgument("bad rescan worker index"));
        }
        let sorted = self.sorted_slices.lock().clone();
        if sorted.is_empty() {
            return Ok(());
        }
        let schema = self.ensure_schema()?;
        let per_worker = sorted.len() / worker_count;
        let remainder = sorted.len() % worker_count;
        let (start, end) = if worker_index < remainder {
            let start = (per_worker + 1) * worker_index;
            (start, start + per_worker + 1)
        } else {
            let start = remainder * (per_worker + 1) + (worker_index - remainder) * per_worker;
            (start, start + per_worker)
        };
        for writer in &sorted[start..end] {
            self.fill_writer_column_groups(writer, &schema).await?;
            self.cg_finish_count.fetch_add(1, Ordering::AcqRel);
        }
        if self.cg_finish_count.load(Ordering::Acquire) >= sorted.len() {
            self.finish_column_groups();
        }
        Ok(())
    }

    /// Two-phase commit of the campaign.
    ///
    /// Phase one, under the context lock: skip when the campaign already
    /// closed, adopt a persisted commit csn, or write the commit record.
    /// Phase two, outside the lock: apply the commit locally, wait for the
    /// merge to materialize the major table, verify its identity, and
    /// report per-column checksums with a bounded retry budget.
    #[instrument(level = "debug", skip_all, fields(tablet_id = %self.tablet_id))]
    pub(crate) async fn close(&self, execution_id: u64, start_csn: Csn) -> Result<(), LoadError> {
        if !start_csn.is_set() {
            return Err(LoadError::InvalidArgument("close without a start csn"));
        }
        let (commit_csn, is_remote_write) = {
            let st = self.state.lock().await;
            if st.task_end {
                info!("load already closed [tablet_id={}]", self.tablet_id);
                return Ok(());
            }
            let meta = self.tablet_meta()?;
            let persisted = self.current_commit_csn(&meta);
            if persisted.is_set() {
                (persisted, false)
            } else {
                let table_key = self.table_key().ok_or(LoadError::NotInitialized)?;
                self.collab
                    .redo
                    .write_commit_record(&table_key, start_csn)
                    .await?
            }
        };
        if is_remote_write {
            info!(
                "commit record routed to a remote leader, replay completes the close [tablet_id={}, commit_csn={}]",
                self.tablet_id, commit_csn
            );
            return Ok(());
        }
        if !commit_csn.is_set() {
            return Err(LoadError::Unexpected("commit record without a csn"));
        }

        self.commit(start_csn, commit_csn).await?;

        if self.kind == LoadKind::Full {
            let major = self.wait_for_major(start_csn, commit_csn).await?;
            let expected = self.table_key().ok_or(LoadError::NotInitialized)?;
            if major.key != expected {
                warn!(
                    "major table identity mismatch [tablet_id={}, expected={}, found={}]",
                    self.tablet_id, expected, major.key
                );
                return Err(LoadError::SnapshotDiscarded);
            }
            if let Some(lob) = self.lob_context() {
                let lob_major = lob.wait_for_major(start_csn, commit_csn).await?;
                let lob_expected = lob.table_key().ok_or(LoadError::NotInitialized)?;
                if lob_major.key != lob_expected {
                    return Err(LoadError::SnapshotDiscarded);
                }
            }
            self.report_checksums_with_retry(execution_id, &major)
                .await?;
        }

        let mut st = self.state.lock().await;
        st.task_end = true;
        info!(
            "closed tablet load [tablet_id={}, start_csn={}, commit_csn={}]",
            self.tablet_id, start_csn, commit_csn
        );
        Ok(())
    }

    /// Applies the commit locally: records the commit csn (lob sibling
    /// first), freezes the write buffers at the commit boundary, persists
    /// the commit csn, and schedules the merge.
    pub(crate) async fn commit(&self, start_csn: Csn, commit_csn: Csn) -> Result<(), LoadError> {
        if !self.is_started() {
            return Err(LoadError::Unexpected("commit before start"));
        }
        if start_csn < self.start_csn() {
            return Err(LoadError::Expired);
        }
        if let Some(lob) = self.lob_context() {
            Box::pin(lob.commit(start_csn, commit_csn)).await?;
        }
        self.commit_csn.store(commit_csn.value(), Ordering::Release);
        if self.kind == LoadKind::Full {
            self.collab
                .table_store
                .set_load_commit_csn(self.tablet_id, commit_csn)?;
        }
        self.buffers.freeze_up_to(commit_csn)?;
        self.schedule_merge(start_csn, commit_csn)?;
        Ok(())
    }

    fn schedule_merge(&self, start_csn: Csn, commit_csn: Csn) -> Result<(), LoadError> {
        let params = MergeJobParams {
            tablet_id: self.tablet_id,
            kind: self.kind,
            start_csn,
            rec_csn: commit_csn,
            is_commit: true,
        };
        match self.collab.scheduler.schedule(params) {
            Ok(()) => Ok(()),
            Err(LoadError::Again) => {
                // queue full: a merge for this tablet is already pending
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Waits for the merge to publish the major table, re-issuing the
    /// schedule at the logging interval and surfacing `NeedRetry` when the
    /// liveness timeout elapses.
    async fn wait_for_major(&self, start_csn: Csn, commit_csn: Csn) -> Result<Table, LoadError> {
        let mut rx = self.collab.table_store.subscribe();
        let started = Instant::now();
        let deadline = started + self.settings.wait_timeout();
        let mut last_log = started;
        loop {
            if let Some(major) = self.collab.table_store.first_major(self.tablet_id) {
                return Ok(major);
            }
            if Instant::now() >= deadline {
                warn!(
                    "major table did not materialize in time [tablet_id={}, waited={:?}]",
                    self.tablet_id,
                    started.elapsed()
                );
                return Err(LoadError::NeedRetry);
            }
            if last_log.elapsed() >= self.settings.wait_log_interval() {
                info!(
                    "waiting for major table [tablet_id={}, start_csn={}, commit_csn={}, waited={:?}]",
                    self.tablet_id,
                    start_csn,
                    commit_csn,
                    started.elapsed()
                );
                last_log = Instant::now();
                self.schedule_merge(start_csn, commit_csn)?;
            }
            let _ = tokio::time::timeout(self.settings.wait_poll(), rx.changed()).await;
        }
    }

    async fn report_checksums_with_retry(
        &self,
        execution_id: u64,
        major: &Table,
    ) -> Result<(), LoadError> {
        let (table_id, task_id) = {
            let params = self.params.read();
            let params = params.as_ref().ok_or(LoadError::NotInitialized)?;
            (params.table_id, params.task_id)
        };
        let report = ChecksumReport {
            tablet_id: self.tablet_id,
            table_id,
            execution_id,
            task_id,
            column_checksums: major.column_checksums.clone(),
        };
        let attempts = self.settings.checksum_report_attempts;
        for attempt in 1..=attempts {
            match self.collab.checksums.report(report.clone()).await {
                Ok(()) => {
                    info!(
                        "reported load checksums [tablet_id={}, table_id={}, execution_id={}]",
                        self.tablet_id, table_id, execution_id
                    );
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        "checksum report failed [tablet_id={}, attempt={}, error={:?}]",
                        self.tablet_id, attempt, err
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.settings.checksum_report_backoff()).await;
                    }
                }
            }
        }
        Err(LoadError::ChecksumReportFailed(attempts))
    }

    /// Tells every open slice writer to discard. No log record is written;
    /// no partial commit is observable afterwards.
    pub(crate) fn cancel(&self) {
        for entry in self.slices.iter() {
            entry.value().cancel();
        }
        info!("cancelled tablet load [tablet_id={}]", self.tablet_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slice::SliceInfo;
    use crate::test_utils::{keyed_rows, TestHarness};
    use crate::types::TabletLoadKey;
    use std::time::Duration;

    fn slice_info(tablet: u64, context_id: u64, slice_id: u64) -> SliceInfo {
        SliceInfo {
            tablet_id: TabletId::new(tablet),
            kind: LoadKind::Full,
            context_id,
            slice_id,
            is_lob_slice: false,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_writers_get_key_ordered_row_offsets() {
        // given: a column-oriented load with two parallel writers
        let harness = TestHarness::new(&[1]).await;
        let tablet = TabletId::new(1);
        let params = TestHarness::column_oriented_params(1, 2);
        let context_id = harness.registry.alloc_context_id();
        harness
            .registry
            .create_load(context_id, 1, params.clone())
            .await
            .unwrap();
        harness
            .registry
            .open(tablet, LoadKind::Full, context_id)
            .await
            .unwrap();

        let ctx = harness
            .registry
            .context(TabletLoadKey::new(tablet, LoadKind::Full))
            .unwrap();
        let mut info1 = slice_info(1, context_id, 0);
        info1.slice_id = harness.registry.open_slice(&info1, 0).await.unwrap();
        let mut info2 = slice_info(1, context_id, 0);
        info2.slice_id = harness.registry.open_slice(&info2, 1).await.unwrap();

        let mut low = keyed_rows(1, 50).into_iter();
        harness.registry.fill_slice(&info1, &mut low).await.unwrap();
        let mut high = keyed_rows(51, 100).into_iter();
        harness
            .registry
            .fill_slice(&info2, &mut high)
            .await
            .unwrap();

        let writer1 = ctx.slice_writer(info1.slice_id).unwrap();
        let writer2 = ctx.slice_writer(info2.slice_id).unwrap();

        // when: the high-key writer finishes first and must wait on the
        // barrier until the last writer computes the global ordering
        let registry = harness.registry.clone();
        let early_close = tokio::spawn(async move { registry.close_slice(&info2).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        harness.registry.close_slice(&info1).await.unwrap();
        early_close.await.unwrap().unwrap();

        // then: row-offset ranges are assigned in key order regardless of
        // finish order, and the writers are released afterwards
        assert_eq!(writer1.row_offset(), 0);
        assert_eq!(writer2.row_offset(), 50);
        assert!(ctx.slice_writer(info1.slice_id).is_none());
        assert!(ctx.slice_writer(info2.slice_id).is_none());

        // and the committed campaign produces a column-oriented major
        harness
            .registry
            .close_load(
                context_id,
                tablet,
                LoadKind::Full,
                true,
                params.task_id,
                params.table_id,
                1,
            )
            .await
            .unwrap();
        let major = harness.store.first_major(tablet).unwrap();
        assert_eq!(major.key.kind, TableKind::ColumnOriented);
        assert_eq!(major.column_groups.len(), 2);
        assert_eq!(major.column_checksums.len(), 2);
        assert_eq!(major.row_count, 100);
    }

    #[tokio::test]
    async fn test_cancel_discards_open_writers() {
        let harness = TestHarness::new(&[1]).await;
        let tablet = TabletId::new(1);
        let params = TestHarness::row_major_params(1, 1);
        let context_id = harness.registry.alloc_context_id();
        harness
            .registry
            .create_load(context_id, 1, params)
            .await
            .unwrap();
        harness
            .registry
            .open(tablet, LoadKind::Full, context_id)
            .await
            .unwrap();
        let mut info = slice_info(1, context_id, 0);
        info.slice_id = harness.registry.open_slice(&info, 0).await.unwrap();
        let mut rows = keyed_rows(1, 10).into_iter();
        harness.registry.fill_slice(&info, &mut rows).await.unwrap();

        harness
            .registry
            .cancel(tablet, LoadKind::Full)
            .unwrap();

        // a cancelled writer rejects further work; no commit is observable
        let err = harness.registry.close_slice(&info).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Invalid);
        assert!(harness.store.first_major(tablet).is_none());
        assert!(!harness
            .store
            .tablet_meta(tablet)
            .unwrap()
            .load_commit_csn
            .is_set());
    }
}

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info};
use parking_lot::RwLock;

use crate::checksum::{ChecksumReport, ChecksumReporter};
use crate::config::Settings;
use crate::error::LoadError;
use crate::load_context::{Collaborators, LoadParams, TabletLoadContext};
use crate::redo::RedoLogWriter;
use crate::scheduler::MergeScheduler;
use crate::slice::SliceInfo;
use crate::tablestore::TableStore;
use crate::types::{Csn, LoadKind, Row, TabletId, TabletLoadKey};
use crate::utils::MonotonicSeq;
use crate::Error;

/// Per-attempt metadata, visible to concurrent `open` calls before the
/// context itself records a start csn. The execution id increases
/// monotonically per (re)start; the sequence-interval counter backs
/// per-attempt interval handout.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExecutionAttempt {
    pub execution_id: u64,
    pub start_csn: Csn,
    pub seq_interval_task_id: u64,
}

#[derive(Default)]
struct Shard {
    contexts: HashMap<TabletLoadKey, Arc<TabletLoadContext>>,
    attempts: HashMap<(TabletId, u64), ExecutionAttempt>,
}

/// Tenant-wide factory, lookup, and eviction for tablet load contexts.
///
/// A fixed array of read/write lock shards, indexed by a hash of the tablet
/// id, guards the maps; the locks are never held across log or store I/O,
/// and never guard the content of a context.
pub struct LoadRegistry {
    settings: Arc<Settings>,
    shards: Vec<RwLock<Shard>>,
    slice_ids: MonotonicSeq,
    context_ids: MonotonicSeq,
    table_store: Arc<TableStore>,
    redo: Arc<dyn RedoLogWriter>,
    scheduler: Arc<dyn MergeScheduler>,
    checksums: Arc<dyn ChecksumReporter>,
}

impl LoadRegistry {
    pub fn new(
        settings: Settings,
        table_store: Arc<TableStore>,
        redo: Arc<dyn RedoLogWriter>,
        scheduler: Arc<dyn MergeScheduler>,
        checksums: Arc<dyn ChecksumReporter>,
    ) -> Arc<Self> {
        let shard_count = settings.registry_shards.max(1);
        let shards = (0..shard_count).map(|_| RwLock::new(Shard::default())).collect();
        Arc::new(Self {
            settings: Arc::new(settings),
            shards,
            slice_ids: MonotonicSeq::new(0),
            context_ids: MonotonicSeq::new(0),
            table_store,
            redo,
            scheduler,
            checksums,
        })
    }

    pub fn table_store(&self) -> Arc<TableStore> {
        self.table_store.clone()
    }

    /// Allocates a process-wide unique context id for a new load attempt.
    pub fn alloc_context_id(&self) -> u64 {
        self.context_ids.next()
    }

    fn shard(&self, tablet_id: TabletId) -> &RwLock<Shard> {
        let mut hasher = DefaultHasher::new();
        tablet_id.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        &self.shards[index]
    }

    fn collaborators(&self) -> Collaborators {
        Collaborators {
            table_store: self.table_store.clone(),
            redo: self.redo.clone(),
            scheduler: self.scheduler.clone(),
            checksums: self.checksums.clone(),
        }
    }

    pub(crate) fn context(&self, key: TabletLoadKey) -> Option<Arc<TabletLoadContext>> {
        self.shard(key.tablet_id).read().contexts.get(&key).cloned()
    }

    pub(crate) fn attempt(&self, tablet_id: TabletId, context_id: u64) -> Option<ExecutionAttempt> {
        self.shard(tablet_id)
            .read()
            .attempts
            .get(&(tablet_id, context_id))
            .copied()
    }

    fn set_attempt_start(&self, tablet_id: TabletId, context_id: u64, start_csn: Csn) {
        let mut shard = self.shard(tablet_id).write();
        if let Some(attempt) = shard.attempts.get_mut(&(tablet_id, context_id)) {
            attempt.start_csn = start_csn;
        }
    }

    fn remove_attempt(&self, tablet_id: TabletId, context_id: u64) {
        let mut shard = self.shard(tablet_id).write();
        if shard.attempts.remove(&(tablet_id, context_id)).is_some() {
            info!(
                "erased execution attempt [tablet_id={}, context_id={}]",
                tablet_id, context_id
            );
        }
    }

    /// Hands out the next per-attempt sequence-interval task id.
    pub fn next_seq_interval(
        &self,
        tablet_id: TabletId,
        context_id: u64,
    ) -> Result<u64, Error> {
        let mut shard = self.shard(tablet_id).write();
        let attempt = shard
            .attempts
            .get_mut(&(tablet_id, context_id))
            .ok_or(LoadError::AttemptMissing(context_id))?;
        attempt.seq_interval_task_id += 1;
        Ok(attempt.seq_interval_task_id)
    }

    /// The `Expired`/`ContextMissing` distinction for a vanished context:
    /// a durable major table means the load already finished ("expired"),
    /// anything else means it never started here.
    fn missing_context_error(&self, tablet_id: TabletId) -> LoadError {
        if self.table_store.first_major(tablet_id).is_some() {
            LoadError::Expired
        } else {
            LoadError::ContextMissing
        }
    }

    /// Creates (or fetches) the tablet's load context and upserts the
    /// execution attempt. Exactly-once per key under the shard write lock;
    /// a context is never created once the tablet already carries a major
    /// table. The lob sibling, when configured, is created first.
    pub async fn create_load(
        &self,
        context_id: u64,
        execution_id: u64,
        params: LoadParams,
    ) -> Result<(), Error> {
        let tablet_id = params.tablet_id;
        let key = TabletLoadKey::new(tablet_id, params.kind);

        let lob_ctx = if let Some(lob_tablet_id) = params.lob_tablet_id {
            let lob_key = TabletLoadKey::new(lob_tablet_id, params.kind);
            let ctx = self.try_create_context(lob_key, None, execution_id)?;
            if let Some(ctx) = &ctx {
                let lob_params = LoadParams {
                    tablet_id: lob_tablet_id,
                    kind: params.kind,
                    table_id: 0,
                    task_id: 0,
                    schema: crate::types::LoadSchema::lob_meta(params.schema.schema_version),
                    snapshot_version: params.snapshot_version,
                    format_version: params.format_version,
                    writer_count: params.writer_count,
                    lob_tablet_id: None,
                    is_replay: params.is_replay,
                };
                ctx.update(None, lob_params).await?;
            }
            ctx
        } else {
            None
        };

        let ctx = self.try_create_context(key, Some(context_id), execution_id)?;
        if let Some(ctx) = ctx {
            ctx.update(lob_ctx, params).await?;
            // rebuild campaign csns from persisted state after a restart
            if let Some(meta) = self.table_store.tablet_meta(tablet_id) {
                if meta.load_start_csn.is_set() {
                    ctx.recover_from_meta(&meta).await?;
                    if let Some(lob) = ctx.lob_context() {
                        lob.recover_from_meta(&meta).await?;
                    }
                }
            }
        }
        Ok(())
    }

    fn try_create_context(
        &self,
        key: TabletLoadKey,
        attempt_context_id: Option<u64>,
        execution_id: u64,
    ) -> Result<Option<Arc<TabletLoadContext>>, LoadError> {
        let major_exists = self.table_store.first_major(key.tablet_id).is_some();
        let mut shard = self.shard(key.tablet_id).write();
        let ctx = match shard.contexts.get(&key) {
            Some(existing) => Some(existing.clone()),
            None if !major_exists => {
                let ctx = Arc::new(TabletLoadContext::new(
                    key.tablet_id,
                    key.kind,
                    self.settings.clone(),
                    self.collaborators(),
                ));
                shard.contexts.insert(key, ctx.clone());
                info!(
                    "created tablet load context [key={}, execution_id={}]",
                    key, execution_id
                );
                Some(ctx)
            }
            None => {
                info!(
                    "major table exists, not creating load context [key={}]",
                    key
                );
                None
            }
        };
        // the attempt entry is upserted even when no context was created,
        // so concurrent opens observe the execution id immediately
        if let Some(context_id) = attempt_context_id {
            shard.attempts.insert(
                (key.tablet_id, context_id),
                ExecutionAttempt {
                    execution_id,
                    start_csn: Csn::MIN,
                    seq_interval_task_id: 0,
                },
            );
        }
        Ok(ctx)
    }

    /// Opens the load for one attempt, returning the start csn and
    /// recording it into the execution attempt.
    pub async fn open(
        &self,
        tablet_id: TabletId,
        kind: LoadKind,
        context_id: u64,
    ) -> Result<Csn, Error> {
        let key = TabletLoadKey::new(tablet_id, kind);
        let ctx = self
            .context(key)
            .ok_or_else(|| self.missing_context_error(tablet_id))?;
        let attempt = self
            .attempt(tablet_id, context_id)
            .ok_or(LoadError::AttemptMissing(context_id))?;
        let start_csn = ctx.open(attempt.execution_id).await?;
        self.set_attempt_start(tablet_id, context_id, start_csn);
        Ok(start_csn)
    }

    /// Admits a slice writer, returning its process-wide unique id.
    pub async fn open_slice(&self, slice_info: &SliceInfo, start_seq: u64) -> Result<u64, Error> {
        let key = TabletLoadKey::new(slice_info.tablet_id, slice_info.kind);
        let ctx = self
            .context(key)
            .ok_or_else(|| self.missing_context_error(slice_info.tablet_id))?;
        let target = if slice_info.is_lob_slice {
            ctx.lob_context()
                .ok_or(LoadError::Unexpected("load has no lob sibling"))?
        } else {
            ctx
        };
        let slice_id = self.slice_ids.next();
        target.open_slice(slice_id, start_seq)?;
        Ok(slice_id)
    }

    /// Routes rows into the slice's writer.
    ///
    /// A vanished context on a Full load means the campaign already
    /// finished: the rows are drained for side effects only, not applied,
    /// because a late-arriving writer may race a just-committed load.
    pub async fn fill_slice(
        &self,
        slice_info: &SliceInfo,
        rows: &mut (dyn Iterator<Item = Row> + Send),
    ) -> Result<u64, Error> {
        let key = TabletLoadKey::new(slice_info.tablet_id, slice_info.kind);
        let Some(ctx) = self.context(key) else {
            if slice_info.kind == LoadKind::Full {
                self.process_finished_tablet(slice_info.tablet_id, Some(rows), 0, 0, 0)
                    .await?;
                return Ok(0);
            }
            return Err(LoadError::ContextMissing.into());
        };
        let attempt = self
            .attempt(slice_info.tablet_id, slice_info.context_id)
            .ok_or(LoadError::AttemptMissing(slice_info.context_id))?;
        let target = if slice_info.is_lob_slice {
            ctx.lob_context()
                .ok_or(LoadError::Unexpected("load has no lob sibling"))?
        } else {
            ctx
        };
        match target.fill_slice(slice_info.slice_id, attempt.start_csn, rows) {
            Ok(affected_rows) => Ok(affected_rows),
            Err(LoadError::AlreadyCommitted) if slice_info.kind == LoadKind::Full => {
                self.process_finished_tablet(slice_info.tablet_id, Some(rows), 0, 0, 0)
                    .await?;
                Ok(0)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Closes one slice writer; see the context for the range computation
    /// and column-group barrier this may trigger.
    pub async fn close_slice(&self, slice_info: &SliceInfo) -> Result<(), Error> {
        let key = TabletLoadKey::new(slice_info.tablet_id, slice_info.kind);
        let ctx = self
            .context(key)
            .ok_or_else(|| self.missing_context_error(slice_info.tablet_id))?;
        let attempt = self
            .attempt(slice_info.tablet_id, slice_info.context_id)
            .ok_or(LoadError::AttemptMissing(slice_info.context_id))?;
        let target = if slice_info.is_lob_slice {
            ctx.lob_context()
                .ok_or(LoadError::Unexpected("load has no lob sibling"))?
        } else {
            ctx
        };
        target
            .close_slice(slice_info.slice_id, attempt.start_csn)
            .await?;
        Ok(())
    }

    /// Explicit range-computation entry for the column-store rescan path.
    pub fn compute_ranges(&self, tablet_id: TabletId, kind: LoadKind) -> Result<(), Error> {
        let ctx = self
            .context(TabletLoadKey::new(tablet_id, kind))
            .ok_or_else(|| self.missing_context_error(tablet_id))?;
        ctx.compute_ranges()?;
        Ok(())
    }

    /// Partitioned column-group fill across rescan workers.
    pub async fn fill_column_group(
        &self,
        tablet_id: TabletId,
        kind: LoadKind,
        worker_count: usize,
        worker_index: usize,
    ) -> Result<(), Error> {
        let ctx = self
            .context(TabletLoadKey::new(tablet_id, kind))
            .ok_or_else(|| self.missing_context_error(tablet_id))?;
        ctx.fill_column_group(worker_count, worker_index).await?;
        Ok(())
    }

    /// Two-phase commit (or abandon) of a load attempt. A vanished Full
    /// context re-reports checksums for the finished tablet when the caller
    /// supplies its reporting identity.
    #[allow(clippy::too_many_arguments)]
    pub async fn close_load(
        &self,
        context_id: u64,
        tablet_id: TabletId,
        kind: LoadKind,
        need_commit: bool,
        task_id: u64,
        table_id: u64,
        execution_id: u64,
    ) -> Result<(), Error> {
        let key = TabletLoadKey::new(tablet_id, kind);
        let Some(ctx) = self.context(key) else {
            if kind == LoadKind::Full {
                self.process_finished_tablet(tablet_id, None, task_id, table_id, execution_id)
                    .await?;
                self.remove_attempt(tablet_id, context_id);
                return Ok(());
            }
            return Err(LoadError::ContextMissing.into());
        };
        if need_commit {
            let attempt = self
                .attempt(tablet_id, context_id)
                .ok_or(LoadError::AttemptMissing(context_id))?;
            ctx.close(attempt.execution_id, attempt.start_csn).await?;
        }
        // an abandoned load (need_commit = false) leaves the context for
        // cancel/GC; no partial commit is observable
        self.remove_attempt(tablet_id, context_id);
        Ok(())
    }

    /// Cooperative cancel: in-flight slice writers are told to discard.
    pub fn cancel(&self, tablet_id: TabletId, kind: LoadKind) -> Result<(), Error> {
        let ctx = self
            .context(TabletLoadKey::new(tablet_id, kind))
            .ok_or_else(|| self.missing_context_error(tablet_id))?;
        ctx.cancel();
        Ok(())
    }

    /// Drops the registry's strong handle; the context is freed when the
    /// last in-flight holder releases it. Returns whether an entry existed.
    pub fn remove(&self, key: TabletLoadKey) -> bool {
        let mut shard = self.shard(key.tablet_id).write();
        let removed = shard.contexts.remove(&key).is_some();
        if removed {
            info!("removed tablet load context [key={}]", key);
        }
        removed
    }

    pub(crate) fn remove_context(&self, key: TabletLoadKey) {
        self.remove(key);
    }

    /// Handles calls that reached a tablet whose Full-load context is gone:
    /// waits (bounded, woken by table-store updates) for the major table
    /// when a checksum report is still owed, re-reports its column
    /// checksums unless the persisted execution id is newer, then drains
    /// any supplied row iterator for side effects only.
    async fn process_finished_tablet(
        &self,
        tablet_id: TabletId,
        rows: Option<&mut (dyn Iterator<Item = Row> + Send)>,
        task_id: u64,
        table_id: u64,
        execution_id: u64,
    ) -> Result<(), LoadError> {
        let mut rx = self.table_store.subscribe();
        let deadline = Instant::now() + self.settings.wait_timeout();
        loop {
            let meta = self
                .table_store
                .tablet_meta(tablet_id)
                .ok_or(LoadError::TabletMissing(tablet_id.value()))?;
            if task_id == 0 || table_id == 0 || meta.load_execution_id > execution_id {
                debug!(
                    "no checksum report needed for finished tablet [tablet_id={}, execution_id={}]",
                    tablet_id, execution_id
                );
                break;
            }
            if let Some(major) = meta.major {
                self.checksums
                    .report(ChecksumReport {
                        tablet_id,
                        table_id,
                        execution_id,
                        task_id,
                        column_checksums: major.column_checksums.clone(),
                    })
                    .await?;
                info!(
                    "re-reported checksums for finished tablet [tablet_id={}, execution_id={}]",
                    tablet_id, execution_id
                );
                break;
            }
            if Instant::now() >= deadline {
                return Err(LoadError::NeedRetry);
            }
            let _ = tokio::time::timeout(self.settings.wait_poll(), rx.changed()).await;
        }
        if let Some(rows) = rows {
            let drained = rows.count();
            debug!(
                "drained rows for finished tablet [tablet_id={}, rows={}]",
                tablet_id, drained
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge_job;
    use crate::scheduler::MergeJobParams;
    use crate::test_utils::{keyed_rows, TestHarness};
    use crate::types::TableKind;
    use crate::ErrorKind;
    use std::time::Duration;

    fn slice_info(tablet: u64, context_id: u64) -> SliceInfo {
        SliceInfo {
            tablet_id: TabletId::new(tablet),
            kind: LoadKind::Full,
            context_id,
            slice_id: 0,
            is_lob_slice: false,
        }
    }

    async fn run_full_campaign(harness: &TestHarness, tablet: u64, execution_id: u64) -> Csn {
        let params = TestHarness::row_major_params(tablet, 2);
        let tablet_id = TabletId::new(tablet);
        let context_id = harness.registry.alloc_context_id();
        harness
            .registry
            .create_load(context_id, execution_id, params.clone())
            .await
            .unwrap();
        let start = harness
            .registry
            .open(tablet_id, LoadKind::Full, context_id)
            .await
            .unwrap();

        let mut info1 = slice_info(tablet, context_id);
        info1.slice_id = harness.registry.open_slice(&info1, 0).await.unwrap();
        let mut info2 = slice_info(tablet, context_id);
        info2.slice_id = harness.registry.open_slice(&info2, 1).await.unwrap();

        let mut low = keyed_rows(1, 50).into_iter();
        assert_eq!(
            harness.registry.fill_slice(&info1, &mut low).await.unwrap(),
            50
        );
        let mut high = keyed_rows(51, 100).into_iter();
        assert_eq!(
            harness
                .registry
                .fill_slice(&info2, &mut high)
                .await
                .unwrap(),
            50
        );
        harness.registry.close_slice(&info1).await.unwrap();
        harness.registry.close_slice(&info2).await.unwrap();
        harness
            .registry
            .close_load(
                context_id,
                tablet_id,
                LoadKind::Full,
                true,
                params.task_id,
                params.table_id,
                execution_id,
            )
            .await
            .unwrap();
        start
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_create_resolves_one_context() {
        // given:
        let harness = TestHarness::new(&[1]).await;
        let key = TabletLoadKey::new(TabletId::new(1), LoadKind::Full);

        // when: many attempts race to create the same context
        let mut handles = Vec::new();
        for i in 0..8u64 {
            let registry = harness.registry.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .create_load(i + 1, 1, TestHarness::row_major_params(1, 1))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // then: all callers observe the same instance
        let ctx = harness.registry.context(key).unwrap();
        harness
            .registry
            .create_load(99, 1, TestHarness::row_major_params(1, 1))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&ctx, &harness.registry.context(key).unwrap()));
    }

    #[tokio::test]
    async fn test_open_without_create_is_invalid() {
        let harness = TestHarness::new(&[1]).await;
        let err = harness
            .registry
            .open(TabletId::new(1), LoadKind::Full, 1)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
    }

    #[tokio::test]
    async fn test_start_csns_are_monotonic_and_stale_execution_ids_expire() {
        let harness = TestHarness::new(&[1]).await;
        let tablet = TabletId::new(1);

        harness
            .registry
            .create_load(1, 2, TestHarness::row_major_params(1, 1))
            .await
            .unwrap();
        let first = harness
            .registry
            .open(tablet, LoadKind::Full, 1)
            .await
            .unwrap();

        harness
            .registry
            .create_load(2, 3, TestHarness::row_major_params(1, 1))
            .await
            .unwrap();
        let second = harness
            .registry
            .open(tablet, LoadKind::Full, 2)
            .await
            .unwrap();
        assert!(second >= first);

        // an attempt presenting an older execution id always expires
        harness
            .registry
            .create_load(3, 1, TestHarness::row_major_params(1, 1))
            .await
            .unwrap();
        let err = harness
            .registry
            .open(tablet, LoadKind::Full, 3)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Expired);
    }

    #[tokio::test]
    async fn test_fill_from_superseded_attempt_applies_no_rows() {
        // given: an opened attempt with one slice
        let harness = TestHarness::new(&[1]).await;
        let tablet = TabletId::new(1);
        harness
            .registry
            .create_load(1, 1, TestHarness::row_major_params(1, 1))
            .await
            .unwrap();
        harness
            .registry
            .open(tablet, LoadKind::Full, 1)
            .await
            .unwrap();
        let mut info = slice_info(1, 1);
        info.slice_id = harness.registry.open_slice(&info, 0).await.unwrap();

        // when: a newer execution supersedes it
        harness
            .registry
            .create_load(2, 2, TestHarness::row_major_params(1, 1))
            .await
            .unwrap();
        harness
            .registry
            .open(tablet, LoadKind::Full, 2)
            .await
            .unwrap();

        // then: the stale attempt's fill expires with zero rows applied
        let mut rows = keyed_rows(1, 10).into_iter();
        let err = harness
            .registry
            .fill_slice(&info, &mut rows)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Expired);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_full_campaign_produces_major_and_close_is_idempotent() {
        let harness = TestHarness::new(&[1]).await;
        let tablet = TabletId::new(1);
        let start = run_full_campaign(&harness, 1, 1).await;

        // the merge produced the major table and retired the campaign
        let meta = harness.store.tablet_meta(tablet).unwrap();
        let major = meta.major.clone().unwrap();
        assert_eq!(major.key.kind, TableKind::RowMajor);
        assert_eq!(major.row_count, 100);
        assert_eq!(major.csn_range.start, start.prev());
        assert_eq!(major.csn_range.end, meta.load_commit_csn);
        assert!(meta.intermediates.is_empty());
        assert!(harness
            .registry
            .context(TabletLoadKey::new(tablet, LoadKind::Full))
            .is_none());
        assert_eq!(harness.checksums.reports().len(), 1);

        // re-issuing close for the same identity is a no-op success
        let seq_before = harness.store.rebuild_seq(tablet).unwrap();
        harness
            .registry
            .close_load(77, tablet, LoadKind::Full, true, 901, 501, 1)
            .await
            .unwrap();
        assert_eq!(harness.store.rebuild_seq(tablet).unwrap(), seq_before);

        // re-invoking the merge job leaves the table store unchanged
        merge_job::execute(
            &harness.registry,
            MergeJobParams {
                tablet_id: tablet,
                kind: LoadKind::Full,
                start_csn: start,
                rec_csn: meta.load_commit_csn,
                is_commit: true,
            },
        )
        .await
        .unwrap();
        assert_eq!(harness.store.rebuild_seq(tablet).unwrap(), seq_before);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fill_after_commit_drains_rows_without_applying() {
        let harness = TestHarness::new(&[1]).await;
        run_full_campaign(&harness, 1, 1).await;
        let before = harness.store.tablet_meta(TabletId::new(1)).unwrap();

        // a late-arriving writer races the finished load: rows are drained
        // for side effects only
        let info = slice_info(1, 42);
        let mut rows = keyed_rows(1, 25).into_iter();
        let applied = harness.registry.fill_slice(&info, &mut rows).await.unwrap();
        assert_eq!(applied, 0);
        assert!(rows.next().is_none());
        let after = harness.store.tablet_meta(TabletId::new(1)).unwrap();
        assert_eq!(after.rebuild_seq, before.rebuild_seq);
        assert_eq!(after.major.unwrap().row_count, 100);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_restart_retries_checksum_report_not_the_redo_write() {
        // given: a campaign whose commit became durable but whose checksum
        // report kept failing
        let harness = TestHarness::new(&[1]).await;
        let tablet = TabletId::new(1);
        harness.checksums.fail_next(u32::MAX);
        let params = TestHarness::row_major_params(1, 1);
        harness
            .registry
            .create_load(1, 1, params.clone())
            .await
            .unwrap();
        harness
            .registry
            .open(tablet, LoadKind::Full, 1)
            .await
            .unwrap();
        let mut info = slice_info(1, 1);
        info.slice_id = harness.registry.open_slice(&info, 0).await.unwrap();
        let mut rows = keyed_rows(1, 20).into_iter();
        harness.registry.fill_slice(&info, &mut rows).await.unwrap();
        harness.registry.close_slice(&info).await.unwrap();
        let err = harness
            .registry
            .close_load(
                1,
                tablet,
                LoadKind::Full,
                true,
                params.task_id,
                params.table_id,
                1,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Data);
        assert!(harness.store.first_major(tablet).is_some());
        assert!(harness.checksums.reports().is_empty());

        // when: the process restarts over the same durable state
        harness.checksums.fail_next(0);
        let restarted = harness.restart().await;
        let redo_records_before = harness.redo.records().len();
        restarted
            .registry
            .create_load(2, 1, params.clone())
            .await
            .unwrap();
        restarted
            .registry
            .close_load(
                2,
                tablet,
                LoadKind::Full,
                true,
                params.task_id,
                params.table_id,
                1,
            )
            .await
            .unwrap();

        // then: the checksum report is retried, the redo log is not
        assert_eq!(restarted.checksums.reports().len(), 1);
        assert_eq!(harness.redo.records().len(), redo_records_before);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_incremental_campaign_publishes_a_delta() {
        let harness = TestHarness::new(&[1]).await;
        let tablet = TabletId::new(1);
        let mut params = TestHarness::row_major_params(1, 1);
        params.kind = LoadKind::Incremental;
        harness
            .registry
            .create_load(1, 1, params.clone())
            .await
            .unwrap();
        let start = harness
            .registry
            .open(tablet, LoadKind::Incremental, 1)
            .await
            .unwrap();

        let mut info = slice_info(1, 1);
        info.kind = LoadKind::Incremental;
        info.slice_id = harness.registry.open_slice(&info, 0).await.unwrap();
        let mut rows = keyed_rows(1, 30).into_iter();
        harness.registry.fill_slice(&info, &mut rows).await.unwrap();
        harness.registry.close_slice(&info).await.unwrap();
        harness
            .registry
            .close_load(
                1,
                tablet,
                LoadKind::Incremental,
                true,
                params.task_id,
                params.table_id,
                1,
            )
            .await
            .unwrap();

        // the delta is published asynchronously
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            let meta = harness.store.tablet_meta(tablet).unwrap();
            if !meta.deltas.is_empty() {
                let delta = &meta.deltas[0];
                assert_eq!(delta.row_count, 30);
                assert_eq!(delta.csn_range.start, start);
                assert!(meta.major.is_none());
                break;
            }
            assert!(Instant::now() < deadline, "delta never published");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_lob_sibling_mirrors_the_parent_lifecycle() {
        let harness = TestHarness::new(&[1, 2]).await;
        let tablet = TabletId::new(1);
        let lob_tablet = TabletId::new(2);
        let mut params = TestHarness::row_major_params(1, 1);
        params.lob_tablet_id = Some(lob_tablet);
        harness
            .registry
            .create_load(1, 1, params.clone())
            .await
            .unwrap();
        let start = harness
            .registry
            .open(tablet, LoadKind::Full, 1)
            .await
            .unwrap();

        // the lob side observed the same campaign start
        let lob_meta = harness.store.tablet_meta(lob_tablet).unwrap();
        assert_eq!(lob_meta.load_start_csn, start);

        let mut info = slice_info(1, 1);
        info.slice_id = harness.registry.open_slice(&info, 0).await.unwrap();
        let mut lob_info = slice_info(1, 1);
        lob_info.is_lob_slice = true;
        lob_info.slice_id = harness.registry.open_slice(&lob_info, 0).await.unwrap();

        let mut rows = keyed_rows(1, 20).into_iter();
        harness.registry.fill_slice(&info, &mut rows).await.unwrap();
        let mut lob_rows = keyed_rows(1, 5).into_iter();
        harness
            .registry
            .fill_slice(&lob_info, &mut lob_rows)
            .await
            .unwrap();
        harness.registry.close_slice(&lob_info).await.unwrap();
        harness.registry.close_slice(&info).await.unwrap();
        harness
            .registry
            .close_load(
                1,
                tablet,
                LoadKind::Full,
                true,
                params.task_id,
                params.table_id,
                1,
            )
            .await
            .unwrap();

        // both sides carry a major covering the same commit
        let major = harness.store.first_major(tablet).unwrap();
        let lob_major = harness.store.first_major(lob_tablet).unwrap();
        assert_eq!(major.csn_range.end, lob_major.csn_range.end);
        assert_eq!(lob_major.row_count, 5);
        assert!(harness
            .registry
            .context(TabletLoadKey::new(lob_tablet, LoadKind::Full))
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_open_after_finished_campaign_is_expired() {
        let harness = TestHarness::new(&[1]).await;
        run_full_campaign(&harness, 1, 1).await;

        // context is gone but the durable table exists: expired, not
        // missing
        let err = harness
            .registry
            .open(TabletId::new(1), LoadKind::Full, 64)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Expired);
    }
}

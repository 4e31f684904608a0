use std::sync::Arc;

use bytes::Bytes;

use crate::checksum::RecordingChecksumReporter;
use crate::config::Settings;
use crate::load_context::LoadParams;
use crate::redo::LocalRedoLog;
use crate::registry::LoadRegistry;
use crate::scheduler::{MergeScheduler, TokioMergeScheduler};
use crate::tablestore::TableStore;
use crate::types::{ColumnGroupSpec, LoadKind, LoadSchema, Row, TabletId};

/// A fully wired engine over in-memory collaborators, with the merge
/// orchestrator running.
pub(crate) struct TestHarness {
    pub(crate) registry: Arc<LoadRegistry>,
    pub(crate) store: Arc<TableStore>,
    pub(crate) redo: Arc<LocalRedoLog>,
    pub(crate) checksums: Arc<RecordingChecksumReporter>,
    #[allow(dead_code)]
    pub(crate) scheduler: Arc<TokioMergeScheduler>,
}

impl TestHarness {
    pub(crate) fn fast_settings() -> Settings {
        Settings {
            registry_shards: 8,
            block_rows: 4,
            merge_queue_depth: 16,
            wait_timeout_ms: 3_000,
            wait_poll_ms: 5,
            wait_log_interval_ms: 50,
            checksum_report_attempts: 3,
            checksum_report_backoff_ms: 5,
        }
    }

    pub(crate) async fn new(tablet_ids: &[u64]) -> TestHarness {
        let store = Arc::new(TableStore::new());
        for id in tablet_ids {
            store.register_tablet(TabletId::new(*id));
        }
        let redo = LocalRedoLog::new_shared();
        let checksums = Arc::new(RecordingChecksumReporter::new());
        let scheduler = TokioMergeScheduler::new(16);
        let registry = LoadRegistry::new(
            Self::fast_settings(),
            store.clone(),
            redo.clone(),
            scheduler.clone() as Arc<dyn MergeScheduler>,
            checksums.clone(),
        );
        scheduler.start(registry.clone()).unwrap();
        TestHarness {
            registry,
            store,
            redo,
            checksums,
            scheduler,
        }
    }

    /// Restarts the engine over the same durable collaborators, as after a
    /// process crash: fresh registry, fresh orchestrator, same store/log.
    pub(crate) async fn restart(&self) -> TestHarness {
        let scheduler = TokioMergeScheduler::new(16);
        let registry = LoadRegistry::new(
            Self::fast_settings(),
            self.store.clone(),
            self.redo.clone(),
            scheduler.clone() as Arc<dyn MergeScheduler>,
            self.checksums.clone(),
        );
        scheduler.start(registry.clone()).unwrap();
        TestHarness {
            registry,
            store: self.store.clone(),
            redo: self.redo.clone(),
            checksums: self.checksums.clone(),
            scheduler,
        }
    }

    pub(crate) fn row_major_params(tablet_id: u64, writer_count: usize) -> LoadParams {
        LoadParams {
            tablet_id: TabletId::new(tablet_id),
            kind: LoadKind::Full,
            table_id: 500 + tablet_id,
            task_id: 900 + tablet_id,
            schema: LoadSchema {
                schema_version: 1,
                column_count: 2,
                rowkey_column_count: 1,
                column_groups: Vec::new(),
            },
            snapshot_version: 42,
            format_version: 1,
            writer_count,
            lob_tablet_id: None,
            is_replay: false,
        }
    }

    pub(crate) fn column_oriented_params(tablet_id: u64, writer_count: usize) -> LoadParams {
        let mut params = Self::row_major_params(tablet_id, writer_count);
        params.schema.column_groups = vec![
            ColumnGroupSpec {
                columns: vec![0],
                is_rowkey_group: true,
            },
            ColumnGroupSpec {
                columns: vec![1],
                is_rowkey_group: false,
            },
        ];
        params
    }
}

/// Rows with zero-padded numeric keys so lexicographic order matches
/// numeric order.
pub(crate) fn keyed_rows(from: u64, to_inclusive: u64) -> Vec<Row> {
    (from..=to_inclusive)
        .map(|i| {
            let key = format!("{i:06}");
            Row::new(
                Bytes::from(key.clone().into_bytes()),
                vec![
                    Bytes::from(key.into_bytes()),
                    Bytes::from(format!("value-{i}").into_bytes()),
                ],
            )
        })
        .collect()
}

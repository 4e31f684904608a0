use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::error::LoadError;
use crate::merge_job;
use crate::registry::LoadRegistry;
use crate::types::{Csn, LoadKind, TabletId};

/// One scheduled unit of merge work for a tablet.
#[derive(Clone, Copy, Debug)]
pub struct MergeJobParams {
    pub tablet_id: TabletId,
    pub kind: LoadKind,
    /// Start csn of the attempt that scheduled the job; a job carrying an
    /// older start csn than the context's is expired.
    pub start_csn: Csn,
    /// Target boundary of the merge; the commit csn for commit-time jobs.
    pub rec_csn: Csn,
    pub is_commit: bool,
}

/// The scheduler collaborator. `Again` means the queue is full and the
/// caller should treat the request as deferred, not failed.
pub trait MergeScheduler: Send + Sync {
    fn schedule(&self, params: MergeJobParams) -> Result<(), LoadError>;
}

/// Drops every request. Useful when a test drives merges by hand.
#[derive(Default)]
pub struct NoopMergeScheduler;

impl MergeScheduler for NoopMergeScheduler {
    fn schedule(&self, _params: MergeJobParams) -> Result<(), LoadError> {
        Ok(())
    }
}

/// Runs merge jobs on an orchestrator task fed by a bounded queue.
///
/// The orchestrator loop mirrors the usual compactor shape: it selects over
/// the job channel and a cancellation token, drains the queue on shutdown,
/// and treats job-level `Expired` as routine (a newer attempt owns the
/// tablet).
pub struct TokioMergeScheduler {
    tx: mpsc::Sender<MergeJobParams>,
    rx: Mutex<Option<mpsc::Receiver<MergeJobParams>>>,
    cancellation_token: CancellationToken,
    started: AtomicBool,
}

impl TokioMergeScheduler {
    pub fn new(queue_depth: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        Arc::new(Self {
            tx,
            rx: Mutex::new(Some(rx)),
            cancellation_token: CancellationToken::new(),
            started: AtomicBool::new(false),
        })
    }

    /// Starts the orchestrator task. Must be called exactly once, after the
    /// registry is wired up.
    pub fn start(
        self: &Arc<Self>,
        registry: Arc<LoadRegistry>,
    ) -> Result<tokio::task::JoinHandle<()>, LoadError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(LoadError::Unexpected("merge orchestrator already started"));
        }
        let mut rx = self
            .rx
            .lock()
            .take()
            .ok_or(LoadError::Unexpected("merge orchestrator receiver taken"))?;
        let token = self.cancellation_token.clone();
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    // check the token first so shutdown does not start new jobs
                    _ = token.cancelled() => {
                        rx.close();
                        while let Ok(params) = rx.try_recv() {
                            info!(
                                "dropping merge job on shutdown [tablet_id={}]",
                                params.tablet_id
                            );
                        }
                        break;
                    }
                    maybe_params = rx.recv() => {
                        let Some(params) = maybe_params else { break };
                        Self::run_job(&registry, params).await;
                    }
                }
            }
            info!("merge orchestrator exiting");
        }))
    }

    async fn run_job(registry: &Arc<LoadRegistry>, params: MergeJobParams) {
        let job_id = Ulid::new();
        match merge_job::execute(registry, params).await {
            Ok(()) => {}
            Err(LoadError::Expired) => {
                info!(
                    "merge job expired, a newer attempt owns the tablet [job_id={}, tablet_id={}]",
                    job_id, params.tablet_id
                );
            }
            Err(err) => {
                error!(
                    "merge job failed [job_id={}, tablet_id={}, error={:?}]",
                    job_id, params.tablet_id, err
                );
            }
        }
    }

    /// Requests orchestrator shutdown; queued jobs are dropped.
    pub fn shutdown(&self) {
        self.cancellation_token.cancel();
    }
}

impl MergeScheduler for TokioMergeScheduler {
    fn schedule(&self, params: MergeJobParams) -> Result<(), LoadError> {
        match self.tx.try_send(params) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(LoadError::Again),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(LoadError::SchedulerClosed),
        }
    }
}

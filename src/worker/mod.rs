//! Loop workers: the cooperative schedulers that advance runs.
//!
//! A worker owns a [`RunCursor`] and ticks against the run store:
//! `pick_and_set_status` hands it one locked run, the actuator for that
//! run's status decides the next state (submitting jobs, observing them,
//! finalizing or tearing down outputs along the way), and the store
//! applies the transition. Exactly one actuator exists per source state;
//! dispatch is a match on the status tag. An actuator error leaves the
//! run untouched and the next tick retries.
//!
//! There is no shared work queue: the store is the queue, and workers on
//! different replicas coordinate purely through its row locks, the cursor
//! debounce, and `updated_at` ordering.

pub mod gc;
pub mod metasource;

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::{
    cluster::{Cluster, JobPhase},
    config::KnitClusterConfig,
    domain::run::{KnitRunStatus, Run},
    errors::KnitError,
    store::{RunCursor, RunStore},
    worker::metasource::WorkerSource,
};

/// How many fresh names to try when job submission collides.
const SUBMIT_NAME_RETRIES: usize = 3;

/// Configuration of one run-management loop worker.
#[derive(Debug, Clone)]
pub struct WorkerLoopConfig {
    /// Sleep between ticks when no run qualified.
    pub idle_interval: Duration,
    /// Cursor debounce; keeps replicas from re-picking a freshly touched
    /// run.
    pub debounce: Duration,
}

impl Default for WorkerLoopConfig {
    fn default() -> Self {
        Self {
            idle_interval: Duration::from_secs(3),
            debounce: Duration::from_secs(1),
        }
    }
}

/// A run-management loop worker.
pub struct WorkerLoop {
    runs: Arc<dyn RunStore>,
    cluster: Arc<dyn Cluster>,
    config: Arc<KnitClusterConfig>,
    cursor: RunCursor,
    loop_config: WorkerLoopConfig,
}

impl WorkerLoop {
    pub fn new(
        runs: Arc<dyn RunStore>,
        cluster: Arc<dyn Cluster>,
        config: Arc<KnitClusterConfig>,
        loop_config: WorkerLoopConfig,
    ) -> Self {
        let cursor = RunCursor {
            status: vec![
                KnitRunStatus::Ready,
                KnitRunStatus::Starting,
                KnitRunStatus::Running,
                KnitRunStatus::Completing,
                KnitRunStatus::Aborting,
            ],
            pseudo: vec![],
            pseudo_only: false,
            head: None,
            debounce: loop_config.debounce,
        };
        Self {
            runs,
            cluster,
            config,
            cursor,
            loop_config,
        }
    }

    /// One tick: pick a run, actuate it, finish it if it went terminal.
    /// Returns whether a run was picked.
    pub async fn tick(&mut self) -> Result<bool, KnitError> {
        let runs = self.runs.clone();
        let cluster = self.cluster.clone();
        let config = self.config.clone();

        let (cursor, picked) = self
            .runs
            .pick_and_set_status(
                self.cursor.clone(),
                Box::new(move |run| {
                    Box::pin(async move { actuate(run, runs, cluster, config).await })
                }),
            )
            .await?;
        self.cursor = cursor;

        if picked {
            if let Some(head) = self.cursor.head.clone() {
                let run = self.runs.get(&[head.clone()]).await?;
                if let Some(run) = run.get(&head) {
                    let status = run.run_body.status;
                    if matches!(status, KnitRunStatus::Done | KnitRunStatus::Failed) {
                        self.runs.finish(&head).await?;
                        tracing::info!(run_id = %head, status = %status, "run finished");
                    }
                }
            }
        }
        Ok(picked)
    }

    /// Tick until cancelled, sleeping `idle_interval` between empty
    /// ticks.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let picked = match self.tick().await {
                Ok(picked) => picked,
                Err(e) => {
                    tracing::warn!(error = %e, "worker tick failed; will retry");
                    false
                }
            };
            if picked {
                continue;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.loop_config.idle_interval) => {}
            }
        }
    }
}

/// Dispatch to the actuator for the run's current status.
async fn actuate(
    run: Run,
    runs: Arc<dyn RunStore>,
    cluster: Arc<dyn Cluster>,
    config: Arc<KnitClusterConfig>,
) -> Result<KnitRunStatus, KnitError> {
    match run.run_body.status {
        KnitRunStatus::Ready => advance_ready(run, runs, cluster, config).await,
        KnitRunStatus::Starting => advance_starting(run, cluster, config).await,
        KnitRunStatus::Running => advance_running(run, cluster).await,
        KnitRunStatus::Completing => advance_completing(run, cluster).await,
        KnitRunStatus::Aborting => advance_aborting(run, cluster).await,
        other => Err(KnitError::internal(format!(
            "no actuator for runs in status {other}"
        ))),
    }
}

/// `Ready → Starting`: bind output volumes, create their PVCs, submit the
/// worker job. Name collisions retry with a suffixed name a few times,
/// then give up into `Aborting`.
async fn advance_ready(
    run: Run,
    runs: Arc<dyn RunStore>,
    cluster: Arc<dyn Cluster>,
    config: Arc<KnitClusterConfig>,
) -> Result<KnitRunStatus, KnitError> {
    let run = runs.bind_output_volumes(&run.run_body.id).await?;
    for body in run.produced_data() {
        cluster.ensure_pvc(&body.volume_ref).await?;
    }

    let source = WorkerSource::new(&run)?;
    let mut job = source.build(&config);
    let mut name = source.instance();

    for attempt in 0..=SUBMIT_NAME_RETRIES {
        job.metadata.name = Some(name.clone());
        match cluster.submit_worker(&job).await {
            Ok(()) => {
                runs.set_worker_name(&run.run_body.id, &name).await?;
                return Ok(KnitRunStatus::Starting);
            }
            Err(e) if e.is_conflict() && attempt < SUBMIT_NAME_RETRIES => {
                let nonce = uuid::Uuid::new_v4().simple().to_string();
                name = format!("{}-{}", source.instance(), &nonce[..6]);
                tracing::debug!(run_id = %run.run_body.id, retry = %name, "job name collided");
            }
            Err(e) if e.is_conflict() => {
                tracing::warn!(run_id = %run.run_body.id, "job name kept colliding; aborting run");
                return Ok(KnitRunStatus::Aborting);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(KnitRunStatus::Aborting)
}

/// `Starting → Running | Aborting`: wait for the main container. A job
/// pending past the configured deadline, failed, or gone is aborted.
async fn advance_starting(
    run: Run,
    cluster: Arc<dyn Cluster>,
    config: Arc<KnitClusterConfig>,
) -> Result<KnitRunStatus, KnitError> {
    let Some(name) = run.run_body.worker_name.as_deref() else {
        return Ok(KnitRunStatus::Aborting);
    };
    match cluster.worker_status(name).await {
        Ok(JobPhase::Running | JobPhase::Succeeded) => Ok(KnitRunStatus::Running),
        Ok(JobPhase::Failed { message }) => {
            tracing::warn!(run_id = %run.run_body.id, %message, "worker failed while starting");
            Ok(KnitRunStatus::Aborting)
        }
        Ok(JobPhase::Pending { since }) => {
            let deadline = config.worker.pending_deadline;
            let pending_for = Utc::now().signed_duration_since(since).to_std().ok();
            if pending_for.map(|aged| aged > deadline).unwrap_or(false) {
                tracing::warn!(run_id = %run.run_body.id, "worker pending past deadline");
                Ok(KnitRunStatus::Aborting)
            } else {
                Ok(KnitRunStatus::Starting)
            }
        }
        Err(e) if e.is_missing() => Ok(KnitRunStatus::Aborting),
        Err(e) => Err(e),
    }
}

/// `Running → Completing | Aborting`.
async fn advance_running(run: Run, cluster: Arc<dyn Cluster>) -> Result<KnitRunStatus, KnitError> {
    let Some(name) = run.run_body.worker_name.as_deref() else {
        return Ok(KnitRunStatus::Aborting);
    };
    match cluster.worker_status(name).await {
        Ok(JobPhase::Succeeded) => Ok(KnitRunStatus::Completing),
        Ok(JobPhase::Failed { message }) => {
            tracing::warn!(run_id = %run.run_body.id, %message, "worker failed");
            Ok(KnitRunStatus::Aborting)
        }
        Ok(JobPhase::Running | JobPhase::Pending { .. }) => Ok(KnitRunStatus::Running),
        Err(e) if e.is_missing() => Ok(KnitRunStatus::Aborting),
        Err(e) => Err(e),
    }
}

/// `Completing → Done | Aborting`: every produced PVC must be bound
/// before the outputs are promoted.
async fn advance_completing(
    run: Run,
    cluster: Arc<dyn Cluster>,
) -> Result<KnitRunStatus, KnitError> {
    for body in run.produced_data() {
        match cluster.pvc_is_bound(&body.volume_ref).await {
            Ok(true) => {}
            Ok(false) | Err(KnitError::Missing(_)) => {
                tracing::warn!(
                    run_id = %run.run_body.id,
                    volume_ref = %body.volume_ref,
                    "output volume not bound; aborting run"
                );
                return Ok(KnitRunStatus::Aborting);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(KnitRunStatus::Done)
}

/// `Aborting → Failed`: delete the worker job; a job that is already
/// gone is fine. Output invalidation and garbage enqueueing happened
/// when the run entered `Aborting`.
async fn advance_aborting(
    run: Run,
    cluster: Arc<dyn Cluster>,
) -> Result<KnitRunStatus, KnitError> {
    if let Some(name) = run.run_body.worker_name.as_deref() {
        match cluster.delete_worker(name).await {
            Ok(()) | Err(KnitError::Missing(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(KnitRunStatus::Failed)
}

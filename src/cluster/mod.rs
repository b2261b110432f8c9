//! Cluster access seam.
//!
//! Everything the engine asks of Kubernetes goes through the [`Cluster`]
//! trait: worker job submission and observation, PVC management, and the
//! data-agent sidecars. The kube-client implementation lives in
//! [`kube`]; tests drive the engine with scripted implementations.

pub mod kube;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;

use crate::{domain::data::DataAgent, errors::KnitError};

/// Observed condition of a worker job's main container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobPhase {
    /// Submitted but the main container has not started.
    Pending { since: DateTime<Utc> },
    /// Main container running.
    Running,
    /// Main container terminated successfully.
    Succeeded,
    /// Job or main container failed.
    Failed { message: String },
}

/// Cluster operations the engine depends on.
///
/// Implementations map their client's errors onto [`KnitError`]:
/// not-found becomes `Missing`, name collisions become `Conflict`,
/// anything else `Internal`.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Submit a worker job. `Conflict` when the job name is taken.
    async fn submit_worker(&self, job: &Job) -> Result<(), KnitError>;

    /// Observe a worker job by name. `Missing` when the job is gone.
    async fn worker_status(&self, name: &str) -> Result<JobPhase, KnitError>;

    /// Delete a worker job. `Missing` when it is already gone.
    async fn delete_worker(&self, name: &str) -> Result<(), KnitError>;

    /// Create the PVC for a volume ref if it does not exist yet.
    async fn ensure_pvc(&self, volume_ref: &str) -> Result<(), KnitError>;

    /// Whether the PVC is bound. `Missing` when there is no such PVC.
    async fn pvc_is_bound(&self, volume_ref: &str) -> Result<bool, KnitError>;

    /// Delete the PVC. `Missing` when there is no such PVC.
    async fn delete_pvc(&self, volume_ref: &str) -> Result<(), KnitError>;

    /// Deploy the sidecar pod + service for a data agent and wait for it
    /// to accept connections. `DeadlineExceeded` when it is not ready by
    /// `deadline`; `Conflict` when the generated resource names collide.
    async fn spawn_data_agent(
        &self,
        agent: &DataAgent,
        deadline: DateTime<Utc>,
    ) -> Result<Box<dyn DataAgentHandle>, KnitError>;
}

/// Handle on a running data-agent sidecar. Owned by the request that
/// spawned it; [`DataAgentHandle::close`] must run on every exit path.
#[async_trait]
pub trait DataAgentHandle: Send + Sync {
    /// Base URL of the sidecar's byte API.
    fn url(&self) -> Result<http::Uri, KnitError>;

    /// Tear the sidecar down (pod and service). Idempotent; `Missing`
    /// from the cluster is not an error.
    async fn close(&self) -> Result<(), KnitError>;
}

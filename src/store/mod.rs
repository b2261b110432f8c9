//! Storage seams of the engine.
//!
//! The relational driver is an external collaborator; this module only
//! states the contracts the engine depends on, as async traits consumed
//! through `Arc<dyn …>`. The crate ships one implementation,
//! [`memory::MemoryStore`], an embedded store with per-row locking that
//! honors every contract below and backs the tests and single-node
//! deployments.
//!
//! Two operations are callback transactions: the store performs the pick
//! (or pop), holds the row lock while the caller-supplied callback runs,
//! and applies or discards the result depending on the callback outcome.
//! This is how loop workers coordinate: the database is the queue, and
//! row locks plus the cursor debounce provide fairness across replicas.

pub mod memory;

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::{
    domain::{
        data::{DataAgent, DataAgentMode, Garbage, KnitData},
        plan::{Plan, PlanSpec, PseudoPlanName},
        run::{Assignment, KnitRunStatus, Run},
        tag::TagSet,
    },
    errors::KnitError,
};

/// Scheduler cursor of a loop worker.
///
/// A worker repeatedly asks the run store for "the next run after `head`
/// (cyclic, ordered by `updated_at` then run id) whose status is in
/// `status`, whose plan passes the pseudo filter, and which nobody has
/// touched within `debounce`".
#[derive(Debug, Clone, Default)]
pub struct RunCursor {
    /// Statuses the worker is interested in.
    pub status: Vec<KnitRunStatus>,
    /// Pseudo plans to include. Runs of unlisted pseudo plans are
    /// skipped.
    pub pseudo: Vec<PseudoPlanName>,
    /// When set, only runs of pseudo plans qualify.
    pub pseudo_only: bool,
    /// Run id the last pick returned; the next pick starts after it.
    pub head: Option<String>,
    /// Minimum time a run must stay untouched before it can be picked
    /// again.
    pub debounce: Duration,
}

impl RunCursor {
    /// Whether a run of the given pseudo plan (or `None` for an image
    /// plan) passes this cursor's plan filter.
    pub fn admits_plan(&self, pseudo: Option<PseudoPlanName>) -> bool {
        match pseudo {
            Some(name) => self.pseudo.contains(&name),
            None => !self.pseudo_only,
        }
    }
}

/// Decision callback of [`RunStore::pick_and_set_status`]. Receives the
/// picked run (row lock held) and resolves to the status to move it to;
/// an `Err` leaves the run untouched.
pub type PickCallback =
    Box<dyn FnOnce(Run) -> BoxFuture<'static, Result<KnitRunStatus, KnitError>> + Send>;

/// Callback of [`GarbageStore::pop`]. An `Err` keeps the tombstone.
pub type GarbageCallback =
    Box<dyn FnOnce(Garbage) -> BoxFuture<'static, Result<(), KnitError>> + Send>;

/// Tag & data store (bodies, tag index, data agents).
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Fetch data with lineage views by knit id. Unknown ids are simply
    /// absent from the result.
    async fn get(&self, knit_ids: &[String]) -> Result<HashMap<String, KnitData>, KnitError>;

    /// Data whose tags are a superset of `predicate`, whose producing run
    /// is done, and which is not invalidated; ordered by `knit#timestamp`
    /// then knit id.
    async fn find(&self, predicate: &TagSet) -> Result<Vec<KnitData>, KnitError>;

    /// Attach user tags to existing data (system keys rejected).
    async fn add_tags(&self, knit_id: &str, tags: TagSet) -> Result<(), KnitError>;

    /// Register a data agent for the knit id. Fails with
    /// [`KnitError::Conflict`] when a write agent already exists.
    async fn new_agent(
        &self,
        knit_id: &str,
        mode: DataAgentMode,
        lifecycle_suspend: Duration,
    ) -> Result<DataAgent, KnitError>;

    /// Drop a data agent record.
    async fn remove_agent(&self, name: &str) -> Result<(), KnitError>;

    /// Agent records whose lease expired before `now`; input for the
    /// background sweep.
    async fn expired_agents(&self, now: DateTime<Utc>) -> Result<Vec<DataAgent>, KnitError>;

    /// Invalidate a data artifact, tombstoning its volume for the GC
    /// loop. Fails with [`KnitError::Conflict`] while a live run still
    /// references the data.
    async fn invalidate(&self, knit_id: &str) -> Result<(), KnitError>;
}

/// Plan store and the lineage graph around plans.
#[async_trait]
pub trait PlanStore: Send + Sync {
    /// Register a plan, deduplicated on its content hash. Returns the
    /// plan id (existing one when the definition was already known).
    async fn upsert(&self, spec: PlanSpec) -> Result<String, KnitError>;

    /// Fetch plans by id.
    async fn get(&self, plan_ids: &[String]) -> Result<HashMap<String, Plan>, KnitError>;

    /// Activate or deactivate a plan. Deactivation parks the plan's
    /// waiting runs; reactivation releases them.
    async fn set_active(&self, plan_id: &str, active: bool) -> Result<(), KnitError>;

    /// All currently active plans.
    async fn active_plans(&self) -> Result<Vec<Plan>, KnitError>;
}

/// Run store: the state machine rows and the scheduler queue.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Fetch runs by id. Unknown ids are absent from the result.
    async fn get(&self, run_ids: &[String]) -> Result<HashMap<String, Run>, KnitError>;

    /// Insert a `Waiting` run of the plan with the given input bindings,
    /// allocating output knit ids (but not volume refs). Idempotent on
    /// `(plan id, sorted input knit ids)`: a duplicate returns `None`.
    async fn new_waiting(
        &self,
        plan_id: &str,
        inputs: Vec<Assignment>,
    ) -> Result<Option<String>, KnitError>;

    /// Create a single-output run of a pseudo plan for direct ingress.
    /// The run starts `Running`; its output has both knit id and volume
    /// ref allocated.
    async fn new_pseudo(
        &self,
        plan: PseudoPlanName,
        lifecycle_suspend: Duration,
    ) -> Result<String, KnitError>;

    /// Transition a run, enforcing the transition table. Locks the run
    /// row and every referenced data row, refreshes `updated_at`, and on
    /// entry into `Aborting` invalidates produced data and enqueues their
    /// volume refs as garbage.
    async fn set_status(&self, run_id: &str, new: KnitRunStatus) -> Result<(), KnitError>;

    /// Record the cluster job owning the run.
    async fn set_worker_name(&self, run_id: &str, worker: &str) -> Result<(), KnitError>;

    /// Allocate volume refs for the run's outputs and log (fresh PVC
    /// names, never reused). Returns the refreshed run. Already-bound
    /// outputs keep their refs.
    async fn bind_output_volumes(&self, run_id: &str) -> Result<Run, KnitError>;

    /// Terminal step. Drives `Completing → Done` and `Aborting → Failed`,
    /// releases the lease, and for successful runs promotes the outputs:
    /// their `knit#id`/`knit#timestamp` system tags are attached and the
    /// transient marker dropped. Idempotent on already-finished runs.
    async fn finish(&self, run_id: &str) -> Result<(), KnitError>;

    /// Move `Waiting` runs whose inputs are all produced to `Ready`, and
    /// runs of inactive plans to `Deactivated` (and back). Returns how
    /// many runs moved.
    async fn promote_ready(&self) -> Result<usize, KnitError>;

    /// Pick the next run matching the cursor, hold its row lock across
    /// `f`, and apply the returned transition. Returns the advanced
    /// cursor and whether a run was picked. When `f` fails the run is
    /// left untouched (`updated_at` unchanged).
    async fn pick_and_set_status(
        &self,
        cursor: RunCursor,
        f: PickCallback,
    ) -> Result<(RunCursor, bool), KnitError>;
}

/// Garbage store: tombstoned volume refs awaiting collection.
#[async_trait]
pub trait GarbageStore: Send + Sync {
    /// Pop one tombstone and run `f` on it. The row is removed only when
    /// `f` succeeds. Returns whether a tombstone existed.
    async fn pop(&self, f: GarbageCallback) -> Result<bool, KnitError>;

    /// Enqueue a tombstone directly (used when data is invalidated
    /// outside the run state machine).
    async fn push(&self, garbage: Garbage) -> Result<(), KnitError>;
}

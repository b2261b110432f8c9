//! Embedded store with per-row locking.
//!
//! One [`MemoryStore`] implements every seam in [`crate::store`]. An
//! index-level mutex guards the tables; each run additionally owns a row
//! mutex that is held across callback transactions, so two loop workers
//! can never advance the same run concurrently while workers on other
//! runs proceed. Data mutations ride inside the index lock, which is the
//! embedded equivalent of taking row locks on every referenced data row.
//!
//! The authoritative copy of every data body lives in the data table;
//! run rows hold snapshots that are refreshed on read, so a promotion or
//! volume binding is visible everywhere at once.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::{
    domain::{
        data::{
            self, DataAgent, DataAgentMode, DataSink, DataSource, Garbage, KnitData, KnitDataBody,
            new_knit_id, new_volume_ref,
        },
        plan::{LogPoint, MountPoint, Plan, PlanBody, PlanSpec, PseudoPlanName},
        run::{Assignment, KnitRunStatus, LogAssignment, Run, RunBody},
        tag::{self, Tag, TagSet},
    },
    errors::KnitError,
    store::{
        DataStore, GarbageCallback, GarbageStore, PickCallback, PlanStore, RunCursor, RunStore,
    },
};

/// One data artifact row. `upstream_mount` is the producing mountpoint
/// id, or `None` when the artifact is the run's log.
#[derive(Debug, Clone)]
struct DataRow {
    body: KnitDataBody,
    upstream_run: String,
    upstream_mount: Option<i32>,
    invalidated: bool,
}

#[derive(Default)]
struct State {
    plans: HashMap<String, Plan>,
    plan_hash_index: HashMap<String, String>,
    runs: HashMap<String, Run>,
    run_suspensions: HashMap<String, DateTime<Utc>>,
    finished: HashSet<String>,
    data: HashMap<String, DataRow>,
    agents: HashMap<String, DataAgent>,
    garbage: VecDeque<Garbage>,
    projected: HashSet<String>,
}

/// The embedded store.
pub struct MemoryStore {
    state: Mutex<State>,
    row_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            row_locks: DashMap::new(),
        }
    }

    fn row_lock(&self, run_id: &str) -> Arc<Mutex<()>> {
        self.row_locks
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

impl State {
    /// Clone a run with its snapshots refreshed from the authoritative
    /// tables.
    fn run_view(&self, run: &Run) -> Run {
        let mut view = run.clone();
        if let Some(plan) = self.plans.get(&view.run_body.plan.plan_id) {
            view.run_body.plan = plan.plan_body.clone();
        }
        for assignment in view.inputs.iter_mut().chain(view.outputs.iter_mut()) {
            if let Some(row) = self.data.get(&assignment.knit_data_body.knit_id) {
                assignment.knit_data_body = row.body.clone();
            }
        }
        if let Some(log) = view.log.as_mut() {
            if let Some(row) = self.data.get(&log.knit_data_body.knit_id) {
                log.knit_data_body = row.body.clone();
            }
        }
        view
    }

    fn run_body_view(&self, run: &Run) -> RunBody {
        let mut body = run.run_body.clone();
        if let Some(plan) = self.plans.get(&body.plan.plan_id) {
            body.plan = plan.plan_body.clone();
        }
        body
    }

    fn assemble(&self, knit_id: &str) -> Option<KnitData> {
        let row = self.data.get(knit_id)?;
        let producer = self.runs.get(&row.upstream_run)?;

        let upstream = DataSource {
            run_body: self.run_body_view(producer),
            mount_point: row.upstream_mount.and_then(|id| {
                producer
                    .outputs
                    .iter()
                    .find(|a| a.mount_point.id == id)
                    .map(|a| a.mount_point.clone())
            }),
            log_point: match row.upstream_mount {
                None => producer.log.as_ref().map(|l| l.log_point.clone()),
                Some(_) => None,
            },
        };

        let mut downstreams: Vec<DataSink> = self
            .runs
            .values()
            .flat_map(|run| {
                run.inputs
                    .iter()
                    .filter(|a| a.knit_data_body.knit_id == *knit_id)
                    .map(|a| DataSink {
                        run_body: self.run_body_view(run),
                        mount_point: a.mount_point.clone(),
                    })
            })
            .collect();
        downstreams.sort_by(|a, b| a.run_body.id.cmp(&b.run_body.id));

        let mut nominated_by: Vec<_> = self
            .plans
            .values()
            .filter(|p| p.plan_body.active && p.plan_body.pseudo.is_none())
            .flat_map(|p| {
                p.inputs
                    .iter()
                    .filter(|mp| row.body.tags.is_superset_of(&mp.tags))
                    .map(|mp| crate::domain::data::Nomination {
                        plan_body: p.plan_body.clone(),
                        mount_point: mp.clone(),
                    })
            })
            .collect();
        nominated_by.sort_by(|a, b| {
            (&a.plan_body.plan_id, a.mount_point.id).cmp(&(&b.plan_body.plan_id, b.mount_point.id))
        });

        Some(KnitData {
            knit_data_body: row.body.clone(),
            upstream,
            downstreams,
            nominated_by,
        })
    }

    /// Apply one status transition. The caller holds the run's row lock.
    fn apply_transition(&mut self, run_id: &str, new: KnitRunStatus) -> Result<(), KnitError> {
        let run = self
            .runs
            .get_mut(run_id)
            .ok_or_else(|| KnitError::missing(format!("run {run_id}")))?;
        let from = run.run_body.status;
        if !from.can_transit_to(new) {
            return Err(KnitError::InvalidRunStateChanging {
                run_id: run_id.to_string(),
                from,
                to: new,
            });
        }
        run.run_body.status = new;
        run.run_body.updated_at = Utc::now();

        if new == KnitRunStatus::Aborting && from != KnitRunStatus::Aborting {
            let produced: Vec<String> = run.produced_data().map(|d| d.knit_id.clone()).collect();
            for knit_id in produced {
                if let Some(row) = self.data.get_mut(&knit_id) {
                    row.invalidated = true;
                    row.body.tags.remove_key(tag::KEY_TRANSIENT);
                    row.body
                        .tags
                        .insert(Tag::new(tag::KEY_TRANSIENT, tag::VALUE_TRANSIENT_FAILED));
                    if !row.body.volume_ref.is_empty() {
                        self.garbage.push_back(Garbage {
                            knit_id: knit_id.clone(),
                            volume_ref: row.body.volume_ref.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn new_data_row(
        &mut self,
        upstream_run: &str,
        mount: Option<i32>,
        tags: TagSet,
        with_volume: bool,
    ) -> KnitDataBody {
        let knit_id = new_knit_id();
        let volume_ref = if with_volume {
            new_volume_ref(&knit_id)
        } else {
            String::new()
        };
        let mut tags = tags;
        tags.insert(Tag::new(tag::KEY_TRANSIENT, tag::VALUE_TRANSIENT_PROCESSING));
        let body = KnitDataBody {
            knit_id: knit_id.clone(),
            volume_ref,
            tags,
        };
        self.data.insert(
            knit_id,
            DataRow {
                body: body.clone(),
                upstream_run: upstream_run.to_string(),
                upstream_mount: mount,
                invalidated: false,
            },
        );
        body
    }

    fn ensure_pseudo_plan(&mut self, name: PseudoPlanName) -> Plan {
        let plan_id = name.as_str().to_string();
        if let Some(plan) = self.plans.get(&plan_id) {
            return plan.clone();
        }
        let plan = Plan {
            plan_body: PlanBody {
                plan_id: plan_id.clone(),
                hash: format!("#pseudo-{name}"),
                active: true,
                image: None,
                pseudo: Some(name),
                resources: Default::default(),
                on_node: vec![],
            },
            inputs: vec![],
            outputs: vec![MountPoint {
                id: 1,
                path: "/out".to_string(),
                tags: TagSet::default(),
            }],
            log: None,
            consistency: vec![],
        };
        self.plans.insert(plan_id, plan.clone());
        plan
    }

    fn projection_key(plan_id: &str, inputs: &[Assignment]) -> String {
        let mut ids: Vec<&str> = inputs
            .iter()
            .map(|a| a.knit_data_body.knit_id.as_str())
            .collect();
        ids.sort_unstable();
        format!("{plan_id}|{}", ids.join(","))
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn get(&self, knit_ids: &[String]) -> Result<HashMap<String, KnitData>, KnitError> {
        let st = self.state.lock().await;
        let mut found = HashMap::new();
        for id in knit_ids {
            if let Some(d) = st.assemble(id) {
                found.insert(id.clone(), d);
            }
        }
        Ok(found)
    }

    async fn find(&self, predicate: &TagSet) -> Result<Vec<KnitData>, KnitError> {
        let st = self.state.lock().await;
        let mut hit: Vec<KnitData> = st
            .data
            .values()
            .filter(|row| !row.invalidated && row.body.tags.is_superset_of(predicate))
            .filter(|row| {
                st.runs
                    .get(&row.upstream_run)
                    .map(|r| r.run_body.status == KnitRunStatus::Done)
                    .unwrap_or(false)
            })
            .filter_map(|row| st.assemble(&row.body.knit_id))
            .collect();
        hit.sort_by(|a, b| {
            let ta = a.knit_data_body.tags.timestamp();
            let tb = b.knit_data_body.tags.timestamp();
            ta.cmp(&tb)
                .then_with(|| a.knit_data_body.knit_id.cmp(&b.knit_data_body.knit_id))
        });
        Ok(hit)
    }

    async fn add_tags(&self, knit_id: &str, tags: TagSet) -> Result<(), KnitError> {
        data::reject_system_tags(&tags)?;
        let mut st = self.state.lock().await;
        let row = st
            .data
            .get_mut(knit_id)
            .ok_or_else(|| KnitError::missing(format!("data {knit_id}")))?;
        for t in tags {
            row.body.tags.insert(t);
        }
        Ok(())
    }

    async fn new_agent(
        &self,
        knit_id: &str,
        mode: DataAgentMode,
        lifecycle_suspend: Duration,
    ) -> Result<DataAgent, KnitError> {
        let mut st = self.state.lock().await;
        let row = st
            .data
            .get(knit_id)
            .ok_or_else(|| KnitError::missing(format!("data {knit_id}")))?;
        let body = row.body.clone();

        if st
            .agents
            .values()
            .any(|a| a.knit_id() == knit_id && a.mode == DataAgentMode::Write)
        {
            return Err(KnitError::conflict(format!(
                "a write agent already exists for data {knit_id}"
            )));
        }

        let name = match mode {
            DataAgentMode::Write => format!("dataagt-write-{knit_id}"),
            DataAgentMode::Read => {
                let nonce = uuid::Uuid::new_v4().simple().to_string();
                format!("dataagt-read-{knit_id}-{}", &nonce[..8])
            }
        };
        let deadline = Utc::now()
            + chrono::Duration::from_std(lifecycle_suspend)
                .unwrap_or_else(|_| chrono::Duration::zero());
        let agent = DataAgent {
            name: name.clone(),
            mode,
            knit_data_body: body,
            lifecycle_suspend_until: deadline,
        };
        st.agents.insert(name, agent.clone());
        Ok(agent)
    }

    async fn remove_agent(&self, name: &str) -> Result<(), KnitError> {
        let mut st = self.state.lock().await;
        st.agents.remove(name);
        Ok(())
    }

    async fn expired_agents(&self, now: DateTime<Utc>) -> Result<Vec<DataAgent>, KnitError> {
        let st = self.state.lock().await;
        Ok(st
            .agents
            .values()
            .filter(|a| a.expired_at(now))
            .cloned()
            .collect())
    }

    async fn invalidate(&self, knit_id: &str) -> Result<(), KnitError> {
        let mut st = self.state.lock().await;
        if !st.data.contains_key(knit_id) {
            return Err(KnitError::missing(format!("data {knit_id}")));
        }

        let held_by = st.runs.values().find(|run| {
            !run.run_body.status.is_terminal()
                && run.bound_data().any(|d| d.knit_id == knit_id)
        });
        if let Some(run) = held_by {
            return Err(KnitError::conflict(format!(
                "data {knit_id} is still referenced by run {}",
                run.run_body.id
            )));
        }

        let volume_ref = {
            let row = st
                .data
                .get_mut(knit_id)
                .ok_or_else(|| KnitError::missing(format!("data {knit_id}")))?;
            if row.invalidated {
                return Ok(());
            }
            row.invalidated = true;
            row.body.tags.remove_key(tag::KEY_TRANSIENT);
            row.body
                .tags
                .insert(Tag::new(tag::KEY_TRANSIENT, tag::VALUE_TRANSIENT_FAILED));
            row.body.volume_ref.clone()
        };
        if !volume_ref.is_empty() {
            st.garbage.push_back(Garbage {
                knit_id: knit_id.to_string(),
                volume_ref,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PlanStore for MemoryStore {
    async fn upsert(&self, spec: PlanSpec) -> Result<String, KnitError> {
        spec.validate()?;
        let hash = spec.content_hash()?;

        let mut st = self.state.lock().await;
        if let Some(existing) = st.plan_hash_index.get(&hash) {
            return Ok(existing.clone());
        }

        let plan_id = uuid::Uuid::new_v4().to_string();
        let mut next_id = 1i32;
        let mut take_id = || {
            let id = next_id;
            next_id += 1;
            id
        };
        let inputs = spec
            .inputs
            .iter()
            .map(|mp| MountPoint {
                id: take_id(),
                path: mp.path.clone(),
                tags: mp.tags.clone(),
            })
            .collect();
        let outputs = spec
            .outputs
            .iter()
            .map(|mp| MountPoint {
                id: take_id(),
                path: mp.path.clone(),
                tags: mp.tags.clone(),
            })
            .collect();
        let log = spec.log.as_ref().map(|l| LogPoint {
            id: take_id(),
            tags: l.tags.clone(),
        });

        let plan = Plan {
            plan_body: PlanBody {
                plan_id: plan_id.clone(),
                hash: hash.clone(),
                active: spec.active,
                image: Some(spec.image.clone()),
                pseudo: None,
                resources: spec.resources.clone(),
                on_node: spec.on_node.clone(),
            },
            inputs,
            outputs,
            log,
            consistency: spec.consistency.clone(),
        };
        st.plans.insert(plan_id.clone(), plan);
        st.plan_hash_index.insert(hash, plan_id.clone());
        Ok(plan_id)
    }

    async fn get(&self, plan_ids: &[String]) -> Result<HashMap<String, Plan>, KnitError> {
        let st = self.state.lock().await;
        Ok(plan_ids
            .iter()
            .filter_map(|id| st.plans.get(id).map(|p| (id.clone(), p.clone())))
            .collect())
    }

    async fn set_active(&self, plan_id: &str, active: bool) -> Result<(), KnitError> {
        let mut st = self.state.lock().await;
        let plan = st
            .plans
            .get_mut(plan_id)
            .ok_or_else(|| KnitError::missing(format!("plan {plan_id}")))?;
        plan.plan_body.active = active;
        Ok(())
    }

    async fn active_plans(&self) -> Result<Vec<Plan>, KnitError> {
        let st = self.state.lock().await;
        let mut plans: Vec<Plan> = st
            .plans
            .values()
            .filter(|p| p.plan_body.active)
            .cloned()
            .collect();
        plans.sort_by(|a, b| a.plan_body.plan_id.cmp(&b.plan_body.plan_id));
        Ok(plans)
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn get(&self, run_ids: &[String]) -> Result<HashMap<String, Run>, KnitError> {
        let st = self.state.lock().await;
        Ok(run_ids
            .iter()
            .filter_map(|id| st.runs.get(id).map(|r| (id.clone(), st.run_view(r))))
            .collect())
    }

    async fn new_waiting(
        &self,
        plan_id: &str,
        inputs: Vec<Assignment>,
    ) -> Result<Option<String>, KnitError> {
        let mut st = self.state.lock().await;
        let plan = st
            .plans
            .get(plan_id)
            .ok_or_else(|| KnitError::missing(format!("plan {plan_id}")))?
            .clone();

        let key = State::projection_key(plan_id, &inputs);
        if st.projected.contains(&key) {
            return Ok(None);
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        let outputs = plan
            .outputs
            .iter()
            .map(|mp| Assignment {
                mount_point: mp.clone(),
                knit_data_body: st.new_data_row(&run_id, Some(mp.id), mp.tags.clone(), false),
            })
            .collect();
        let log = plan.log.as_ref().map(|lp| LogAssignment {
            log_point: lp.clone(),
            knit_data_body: st.new_data_row(&run_id, None, lp.tags.clone(), false),
        });

        let run = Run {
            run_body: RunBody {
                id: run_id.clone(),
                status: KnitRunStatus::Waiting,
                worker_name: None,
                updated_at: Utc::now(),
                plan: plan.plan_body.clone(),
            },
            inputs,
            outputs,
            log,
        };
        st.runs.insert(run_id.clone(), run);
        st.projected.insert(key);
        Ok(Some(run_id))
    }

    async fn new_pseudo(
        &self,
        plan: PseudoPlanName,
        lifecycle_suspend: Duration,
    ) -> Result<String, KnitError> {
        let mut st = self.state.lock().await;
        let plan = st.ensure_pseudo_plan(plan);
        let mount = plan.outputs[0].clone();

        let run_id = uuid::Uuid::new_v4().to_string();
        let body = st.new_data_row(&run_id, Some(mount.id), mount.tags.clone(), true);

        let run = Run {
            run_body: RunBody {
                id: run_id.clone(),
                status: KnitRunStatus::Running,
                worker_name: None,
                updated_at: Utc::now(),
                plan: plan.plan_body.clone(),
            },
            inputs: vec![],
            outputs: vec![Assignment {
                mount_point: mount,
                knit_data_body: body,
            }],
            log: None,
        };
        st.runs.insert(run_id.clone(), run);
        if !lifecycle_suspend.is_zero() {
            let until = Utc::now()
                + chrono::Duration::from_std(lifecycle_suspend)
                    .unwrap_or_else(|_| chrono::Duration::zero());
            st.run_suspensions.insert(run_id.clone(), until);
        }
        Ok(run_id)
    }

    async fn set_status(&self, run_id: &str, new: KnitRunStatus) -> Result<(), KnitError> {
        let row = self.row_lock(run_id);
        let _guard = row.lock().await;
        let mut st = self.state.lock().await;
        st.apply_transition(run_id, new)
    }

    async fn set_worker_name(&self, run_id: &str, worker: &str) -> Result<(), KnitError> {
        let mut st = self.state.lock().await;
        let run = st
            .runs
            .get_mut(run_id)
            .ok_or_else(|| KnitError::missing(format!("run {run_id}")))?;
        run.run_body.worker_name = Some(worker.to_string());
        Ok(())
    }

    // No row lock here: the caller is the pick callback, which already
    // holds it.
    async fn bind_output_volumes(&self, run_id: &str) -> Result<Run, KnitError> {
        let mut st = self.state.lock().await;
        let run = st
            .runs
            .get(run_id)
            .ok_or_else(|| KnitError::missing(format!("run {run_id}")))?
            .clone();
        for body in run.produced_data() {
            if let Some(data_row) = st.data.get_mut(&body.knit_id) {
                if data_row.body.volume_ref.is_empty() {
                    data_row.body.volume_ref = new_volume_ref(&body.knit_id);
                }
            }
        }
        Ok(st.run_view(&run))
    }

    async fn finish(&self, run_id: &str) -> Result<(), KnitError> {
        let row = self.row_lock(run_id);
        let _guard = row.lock().await;
        let mut st = self.state.lock().await;

        let status = st
            .runs
            .get(run_id)
            .ok_or_else(|| KnitError::missing(format!("run {run_id}")))?
            .run_body
            .status;
        match status {
            KnitRunStatus::Completing => st.apply_transition(run_id, KnitRunStatus::Done)?,
            KnitRunStatus::Aborting => st.apply_transition(run_id, KnitRunStatus::Failed)?,
            KnitRunStatus::Done | KnitRunStatus::Failed => {}
            other => {
                return Err(KnitError::InvalidRunStateChanging {
                    run_id: run_id.to_string(),
                    from: other,
                    to: KnitRunStatus::Done,
                });
            }
        }

        if st.finished.contains(run_id) {
            return Ok(());
        }

        let run = st
            .runs
            .get_mut(run_id)
            .ok_or_else(|| KnitError::missing(format!("run {run_id}")))?;
        run.run_body.worker_name = None;
        let final_status = run.run_body.status;
        let produced: Vec<String> = run.produced_data().map(|d| d.knit_id.clone()).collect();

        if final_status == KnitRunStatus::Done {
            let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
            for knit_id in produced {
                if let Some(data_row) = st.data.get_mut(&knit_id) {
                    data_row.body.tags.remove_key(tag::KEY_TRANSIENT);
                    data_row
                        .body
                        .tags
                        .insert(Tag::new(tag::KEY_KNIT_ID, knit_id.clone()));
                    if data_row.body.tags.get(tag::KEY_TIMESTAMP).is_none() {
                        data_row
                            .body
                            .tags
                            .insert(Tag::new(tag::KEY_TIMESTAMP, stamp.clone()));
                    }
                }
            }
        }

        st.finished.insert(run_id.to_string());
        st.run_suspensions.remove(run_id);
        Ok(())
    }

    async fn promote_ready(&self) -> Result<usize, KnitError> {
        let mut st = self.state.lock().await;

        let mut moves: Vec<(String, KnitRunStatus)> = Vec::new();
        for run in st.runs.values() {
            let plan_active = st
                .plans
                .get(&run.run_body.plan.plan_id)
                .map(|p| p.plan_body.active)
                .unwrap_or(false);
            match run.run_body.status {
                KnitRunStatus::Waiting if !plan_active => {
                    moves.push((run.run_body.id.clone(), KnitRunStatus::Deactivated));
                }
                KnitRunStatus::Waiting => {
                    let all_produced = run.inputs.iter().all(|a| {
                        st.data
                            .get(&a.knit_data_body.knit_id)
                            .filter(|row| !row.invalidated)
                            .and_then(|row| st.runs.get(&row.upstream_run))
                            .map(|up| up.run_body.status == KnitRunStatus::Done)
                            .unwrap_or(false)
                    });
                    if all_produced {
                        moves.push((run.run_body.id.clone(), KnitRunStatus::Ready));
                    }
                }
                KnitRunStatus::Deactivated if plan_active => {
                    moves.push((run.run_body.id.clone(), KnitRunStatus::Waiting));
                }
                _ => {}
            }
        }

        let moved = moves.len();
        for (run_id, status) in moves {
            st.apply_transition(&run_id, status)?;
        }
        Ok(moved)
    }

    async fn pick_and_set_status(
        &self,
        cursor: RunCursor,
        f: PickCallback,
    ) -> Result<(RunCursor, bool), KnitError> {
        let picked = {
            let st = self.state.lock().await;
            let now = Utc::now();

            let mut candidates: Vec<(DateTime<Utc>, String)> = st
                .runs
                .values()
                .filter(|run| cursor.status.contains(&run.run_body.status))
                .filter(|run| cursor.admits_plan(run.run_body.plan.pseudo))
                .filter(|run| {
                    now.signed_duration_since(run.run_body.updated_at)
                        .to_std()
                        .map(|aged| aged >= cursor.debounce)
                        .unwrap_or(false)
                })
                .filter(|run| {
                    st.run_suspensions
                        .get(&run.run_body.id)
                        .map(|until| *until <= now)
                        .unwrap_or(true)
                })
                .map(|run| (run.run_body.updated_at, run.run_body.id.clone()))
                .collect();
            candidates.sort();

            // Cyclic fairness: prefer a run other than the one picked
            // last; fall back to the head itself when it is the only
            // candidate left (the debounce already spaced it out).
            match cursor.head.as_deref() {
                Some(head) => candidates
                    .iter()
                    .find(|(_, id)| id != head)
                    .or_else(|| candidates.first())
                    .map(|(_, id)| id.clone()),
                None => candidates.first().map(|(_, id)| id.clone()),
            }
        };

        let Some(run_id) = picked else {
            return Ok((cursor, false));
        };

        let row = self.row_lock(&run_id);
        let _guard = row.lock().await;

        // Re-check under the row lock: another worker may have advanced
        // the run between selection and locking.
        let run = {
            let st = self.state.lock().await;
            match st.runs.get(&run_id) {
                Some(run)
                    if cursor.status.contains(&run.run_body.status)
                        && Utc::now()
                            .signed_duration_since(run.run_body.updated_at)
                            .to_std()
                            .map(|aged| aged >= cursor.debounce)
                            .unwrap_or(false) =>
                {
                    st.run_view(run)
                }
                _ => return Ok((cursor, false)),
            }
        };

        let next = f(run).await?;

        let mut st = self.state.lock().await;
        st.apply_transition(&run_id, next)?;
        let mut cursor = cursor;
        cursor.head = Some(run_id);
        Ok((cursor, true))
    }
}

#[async_trait]
impl crate::graph::LineageView for MemoryStore {
    async fn plan(&self, plan_id: &str) -> Result<Plan, KnitError> {
        let st = self.state.lock().await;
        st.plans
            .get(plan_id)
            .cloned()
            .ok_or_else(|| KnitError::missing(format!("plan {plan_id}")))
    }

    async fn adjacent(
        &self,
        plan_id: &str,
        side: crate::graph::Side,
    ) -> Result<Vec<(KnitDataBody, Vec<String>)>, KnitError> {
        let st = self.state.lock().await;
        let mut adjacent: Vec<(KnitDataBody, Vec<String>)> = Vec::new();

        for run in st
            .runs
            .values()
            .filter(|r| r.run_body.plan.plan_id == plan_id)
        {
            match side {
                crate::graph::Side::Downstream => {
                    for body in run.produced_data() {
                        let mut consumers: Vec<String> = st
                            .runs
                            .values()
                            .filter(|r| {
                                r.inputs
                                    .iter()
                                    .any(|a| a.knit_data_body.knit_id == body.knit_id)
                            })
                            .map(|r| r.run_body.plan.plan_id.clone())
                            .collect();
                        consumers.sort();
                        consumers.dedup();
                        let fresh = st
                            .data
                            .get(&body.knit_id)
                            .map(|row| row.body.clone())
                            .unwrap_or_else(|| body.clone());
                        adjacent.push((fresh, consumers));
                    }
                }
                crate::graph::Side::Upstream => {
                    for assignment in &run.inputs {
                        let knit_id = &assignment.knit_data_body.knit_id;
                        let producer = st
                            .data
                            .get(knit_id)
                            .and_then(|row| st.runs.get(&row.upstream_run))
                            .map(|r| r.run_body.plan.plan_id.clone());
                        let fresh = st
                            .data
                            .get(knit_id)
                            .map(|row| row.body.clone())
                            .unwrap_or_else(|| assignment.knit_data_body.clone());
                        adjacent.push((fresh, producer.into_iter().collect()));
                    }
                }
            }
        }

        adjacent.sort_by(|a, b| a.0.knit_id.cmp(&b.0.knit_id));
        adjacent.dedup_by(|a, b| a.0.knit_id == b.0.knit_id);
        Ok(adjacent)
    }
}

#[async_trait]
impl GarbageStore for MemoryStore {
    async fn pop(&self, f: GarbageCallback) -> Result<bool, KnitError> {
        let garbage = {
            let mut st = self.state.lock().await;
            st.garbage.pop_front()
        };
        let Some(garbage) = garbage else {
            return Ok(false);
        };

        match f(garbage.clone()).await {
            Ok(()) => Ok(true),
            Err(e) => {
                let mut st = self.state.lock().await;
                st.garbage.push_front(garbage);
                Err(e)
            }
        }
    }

    async fn push(&self, garbage: Garbage) -> Result<(), KnitError> {
        let mut st = self.state.lock().await;
        st.garbage.push_back(garbage);
        Ok(())
    }
}

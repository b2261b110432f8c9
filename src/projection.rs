//! The projection engine.
//!
//! For every active plan, projection enumerates the combinations of
//! currently matching data over the plan's input predicates and creates a
//! `Waiting` run per combination. The store's idempotence key (plan id +
//! sorted input knit ids) makes repeated projection a no-op, and
//! candidate tuples are visited in lexicographic knit-id order so every
//! replica derives the same runs from the same data.
//!
//! Output-data appearance happens-before any projection that observes it:
//! [`DataStore::find`] only returns data whose producing run is done.

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::{
    domain::{
        data::KnitData,
        plan::Plan,
        run::Assignment,
    },
    errors::KnitError,
    store::{DataStore, PlanStore, RunStore},
};

pub struct Projector {
    plans: Arc<dyn PlanStore>,
    data: Arc<dyn DataStore>,
    runs: Arc<dyn RunStore>,
}

impl Projector {
    pub fn new(
        plans: Arc<dyn PlanStore>,
        data: Arc<dyn DataStore>,
        runs: Arc<dyn RunStore>,
    ) -> Self {
        Self { plans, data, runs }
    }

    /// One projection pass over every active plan. Returns how many runs
    /// were created.
    pub async fn project_once(&self) -> Result<usize, KnitError> {
        let mut created = 0;
        for plan in self.plans.active_plans().await? {
            if plan.plan_body.pseudo.is_some() || plan.inputs.is_empty() {
                continue;
            }
            created += self.project_plan(&plan).await?;
        }
        // Newly produced data may also unblock runs projected earlier.
        self.runs.promote_ready().await?;
        Ok(created)
    }

    async fn project_plan(&self, plan: &Plan) -> Result<usize, KnitError> {
        let mut candidates: Vec<Vec<KnitData>> = Vec::with_capacity(plan.inputs.len());
        for input in &plan.inputs {
            let mut found = self.data.find(&input.tags).await?;
            found.sort_by(|a, b| a.knit_data_body.knit_id.cmp(&b.knit_data_body.knit_id));
            if found.is_empty() {
                return Ok(0);
            }
            candidates.push(found);
        }

        let mut created = 0;
        for tuple in CartesianTuples::new(&candidates) {
            if !tuple_is_consistent(plan, &tuple) {
                continue;
            }
            let inputs: Vec<Assignment> = plan
                .inputs
                .iter()
                .zip(tuple.iter())
                .map(|(mp, data)| Assignment {
                    mount_point: mp.clone(),
                    knit_data_body: data.knit_data_body.clone(),
                })
                .collect();
            if let Some(run_id) = self
                .runs
                .new_waiting(&plan.plan_body.plan_id, inputs)
                .await?
            {
                tracing::debug!(
                    plan_id = %plan.plan_body.plan_id,
                    run_id = %run_id,
                    "projected new run"
                );
                created += 1;
            }
        }
        Ok(created)
    }

    /// Run projection on an interval until cancelled.
    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        loop {
            match self.project_once().await {
                Ok(0) => {}
                Ok(n) => tracing::info!(created = n, "projection created runs"),
                Err(e) => tracing::warn!(error = %e, "projection pass failed"),
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}

/// Whether the tuple satisfies the plan's shared-tag constraints: for
/// each listed key, every input that carries the key must carry the same
/// value.
fn tuple_is_consistent(plan: &Plan, tuple: &[&KnitData]) -> bool {
    plan.consistency.iter().all(|key| {
        let mut values = tuple
            .iter()
            .filter_map(|d| d.knit_data_body.tags.get(key));
        match values.next() {
            None => true,
            Some(first) => values.all(|v| v == first),
        }
    })
}

/// Iterator over the cartesian product of the candidate lists, rightmost
/// index advancing fastest. With each list sorted by knit id, tuples come
/// out in lexicographic knit-id order.
struct CartesianTuples<'a> {
    lists: &'a [Vec<KnitData>],
    index: Vec<usize>,
    done: bool,
}

impl<'a> CartesianTuples<'a> {
    fn new(lists: &'a [Vec<KnitData>]) -> Self {
        let done = lists.iter().any(|l| l.is_empty());
        Self {
            lists,
            index: vec![0; lists.len()],
            done,
        }
    }
}

impl<'a> Iterator for CartesianTuples<'a> {
    type Item = Vec<&'a KnitData>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let tuple: Vec<&KnitData> = self
            .lists
            .iter()
            .zip(self.index.iter())
            .map(|(list, &i)| &list[i])
            .collect();

        // advance, rightmost fastest
        let mut pos = self.lists.len();
        loop {
            if pos == 0 {
                self.done = true;
                break;
            }
            pos -= 1;
            self.index[pos] += 1;
            if self.index[pos] < self.lists[pos].len() {
                break;
            }
            self.index[pos] = 0;
        }
        Some(tuple)
    }
}

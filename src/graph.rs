//! Lineage neighborhood queries and DOT rendering.
//!
//! The lineage graph is bipartite: plans and data alternate, connected
//! through runs (a run's plan produced its outputs; a run's plan consumed
//! its inputs). Traversal is breadth-first with a visited set per node
//! kind, so the cyclic-looking pipeline graphs users build (retraining
//! loops and the like) terminate cleanly. `max_depth` counts plan hops;
//! `None` walks to the leaves.

use std::collections::{HashSet, VecDeque};

use async_trait::async_trait;

use crate::{
    domain::{data::KnitDataBody, plan::Plan},
    errors::KnitError,
};

/// Which way a neighborhood query walks from a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Upstream,
    Downstream,
}

/// Direction selection of a neighborhood query. The default traces both
/// ways.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Direction {
    pub upstream: bool,
    pub downstream: bool,
}

impl Default for Direction {
    fn default() -> Self {
        Self {
            upstream: true,
            downstream: true,
        }
    }
}

impl Direction {
    pub fn upstream_only() -> Self {
        Self {
            upstream: true,
            downstream: false,
        }
    }

    pub fn downstream_only() -> Self {
        Self {
            upstream: false,
            downstream: true,
        }
    }

    fn sides(&self) -> Vec<Side> {
        let mut sides = Vec::new();
        if self.upstream {
            sides.push(Side::Upstream);
        }
        if self.downstream {
            sides.push(Side::Downstream);
        }
        sides
    }
}

/// Read access the traversal needs. Implemented by the store.
#[async_trait]
pub trait LineageView: Send + Sync {
    async fn plan(&self, plan_id: &str) -> Result<Plan, KnitError>;

    /// Data adjacent to the plan on the given side, each paired with the
    /// plan ids on the far side of that data. Downstream: data produced
    /// by the plan's runs and the plans consuming it. Upstream: data
    /// consumed by the plan's runs and the plans that produced it.
    async fn adjacent(
        &self,
        plan_id: &str,
        side: Side,
    ) -> Result<Vec<(KnitDataBody, Vec<String>)>, KnitError>;
}

/// An edge of the rendered subgraph, always oriented producer → consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Edge {
    PlanToData { plan_id: String, knit_id: String },
    DataToPlan { knit_id: String, plan_id: String },
}

/// The neighborhood of a plan: discovered plans (root first), the data
/// between them, and the connecting edges.
#[derive(Debug, Clone, Default)]
pub struct Subgraph {
    pub plans: Vec<Plan>,
    pub data: Vec<KnitDataBody>,
    pub edges: Vec<Edge>,
}

impl Subgraph {
    fn add_edge(&mut self, edge: Edge) {
        if !self.edges.contains(&edge) {
            self.edges.push(edge);
        }
    }

    /// Render the subgraph as a DOT document. The first plan (the query
    /// root) is emphasized.
    pub fn write_dot<W: std::io::Write>(&self, out: &mut W) -> Result<(), KnitError> {
        writeln!(out, "digraph knit {{")?;
        writeln!(out, "    rankdir=LR;")?;
        for (nth, plan) in self.plans.iter().enumerate() {
            let extra = if nth == 0 { ", penwidth=3" } else { "" };
            writeln!(
                out,
                "    \"plan:{}\" [shape=box, label=\"{}\"{extra}];",
                plan.plan_body.plan_id,
                plan.plan_body.name(),
            )?;
        }
        for data in &self.data {
            writeln!(
                out,
                "    \"data:{}\" [shape=ellipse, label=\"{}\"];",
                data.knit_id, data.knit_id,
            )?;
        }
        for edge in &self.edges {
            match edge {
                Edge::PlanToData { plan_id, knit_id } => {
                    writeln!(out, "    \"plan:{plan_id}\" -> \"data:{knit_id}\";")?
                }
                Edge::DataToPlan { knit_id, plan_id } => {
                    writeln!(out, "    \"data:{knit_id}\" -> \"plan:{plan_id}\";")?
                }
            }
        }
        writeln!(out, "}}")?;
        Ok(())
    }
}

/// Breadth-first neighborhood of `plan_id`. `max_depth` counts plan hops
/// away from the root; `None` means "to the leaves".
pub async fn neighbors(
    view: &dyn LineageView,
    plan_id: &str,
    direction: Direction,
    max_depth: Option<u32>,
) -> Result<Subgraph, KnitError> {
    let mut subgraph = Subgraph::default();
    let mut seen_plans: HashSet<String> = HashSet::new();
    let mut seen_data: HashSet<String> = HashSet::new();

    let root = view.plan(plan_id).await?;
    seen_plans.insert(plan_id.to_string());
    subgraph.plans.push(root);

    for side in direction.sides() {
        let mut frontier: VecDeque<String> = VecDeque::from([plan_id.to_string()]);
        let mut depth = 0u32;

        while !frontier.is_empty() {
            if let Some(limit) = max_depth {
                if depth >= limit {
                    break;
                }
            }
            depth += 1;

            let mut next_frontier = VecDeque::new();
            while let Some(current) = frontier.pop_front() {
                for (data, far_plans) in view.adjacent(&current, side).await? {
                    if seen_data.insert(data.knit_id.clone()) {
                        subgraph.data.push(data.clone());
                    }
                    let (near, far_edge) = match side {
                        Side::Downstream => (
                            Edge::PlanToData {
                                plan_id: current.clone(),
                                knit_id: data.knit_id.clone(),
                            },
                            Side::Downstream,
                        ),
                        Side::Upstream => (
                            Edge::DataToPlan {
                                knit_id: data.knit_id.clone(),
                                plan_id: current.clone(),
                            },
                            Side::Upstream,
                        ),
                    };
                    subgraph.add_edge(near);

                    for far_id in far_plans {
                        match far_edge {
                            Side::Downstream => subgraph.add_edge(Edge::DataToPlan {
                                knit_id: data.knit_id.clone(),
                                plan_id: far_id.clone(),
                            }),
                            Side::Upstream => subgraph.add_edge(Edge::PlanToData {
                                plan_id: far_id.clone(),
                                knit_id: data.knit_id.clone(),
                            }),
                        }
                        if seen_plans.insert(far_id.clone()) {
                            let plan = view.plan(&far_id).await?;
                            subgraph.plans.push(plan);
                            next_frontier.push_back(far_id);
                        }
                    }
                }
            }
            frontier = next_frontier;
        }
    }

    Ok(subgraph)
}

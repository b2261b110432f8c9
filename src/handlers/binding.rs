//! Wire shapes of the data detail JSON and their composition from
//! domain entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    data::{DataSink, DataSource, KnitData, Nomination},
    run::{KnitRunStatus, RunBody},
    tag::Tag,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataDetail {
    pub knit_id: String,
    pub tags: Vec<Tag>,
    pub upstream: CreatedFrom,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub downstreams: Vec<AssignedTo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nomination: Vec<NominatedBy>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedFrom {
    pub run: RunSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mountpoint: Option<MountpointSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<LogSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: String,
    pub status: String,
    pub updated_at: DateTime<Utc>,
    pub plan: PlanSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSummary {
    pub plan_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountpointSummary {
    pub path: String,
}

/// Marker object: the artifact is a run's log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogSummary {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignedTo {
    pub run: RunSummary,
    pub mountpoint: MountpointSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NominatedBy {
    pub plan: PlanSummary,
    pub mountpoint: MountpointSummary,
}

fn compose_run_summary(body: &RunBody) -> RunSummary {
    RunSummary {
        run_id: body.id.clone(),
        status: body.status.to_string(),
        updated_at: body.updated_at,
        plan: PlanSummary {
            plan_id: body.plan.plan_id.clone(),
            name: body.plan.name(),
        },
    }
}

fn compose_created_from(source: &DataSource) -> CreatedFrom {
    CreatedFrom {
        run: compose_run_summary(&source.run_body),
        mountpoint: source.mount_point.as_ref().map(|mp| MountpointSummary {
            path: mp.path.clone(),
        }),
        log: source.log_point.as_ref().map(|_| LogSummary {}),
    }
}

fn compose_assigned_to(sink: &DataSink) -> AssignedTo {
    AssignedTo {
        run: compose_run_summary(&sink.run_body),
        mountpoint: MountpointSummary {
            path: sink.mount_point.path.clone(),
        },
    }
}

fn compose_nominated_by(nomination: &Nomination) -> NominatedBy {
    NominatedBy {
        plan: PlanSummary {
            plan_id: nomination.plan_body.plan_id.clone(),
            name: nomination.plan_body.name(),
        },
        mountpoint: MountpointSummary {
            path: nomination.mount_point.path.clone(),
        },
    }
}

/// The data detail document. Downstream runs that were invalidated are
/// omitted.
pub fn compose_detail(data: &KnitData) -> DataDetail {
    DataDetail {
        knit_id: data.knit_data_body.knit_id.clone(),
        tags: data.knit_data_body.tags.iter().cloned().collect(),
        upstream: compose_created_from(&data.upstream),
        downstreams: data
            .downstreams
            .iter()
            .filter(|sink| sink.status() != KnitRunStatus::Invalidated)
            .map(compose_assigned_to)
            .collect(),
        nomination: data.nominated_by.iter().map(compose_nominated_by).collect(),
    }
}

//! Runs and the run status state machine.
//!
//! A Run is the unit of execution: one concrete instantiation of a plan
//! with every input mountpoint bound to a specific data artifact. Runs are
//! generated by projection, never authored. Their status advances along a
//! fixed transition table; any other move is rejected with
//! [`KnitError::InvalidRunStateChanging`].
//!
//! # Status Transitions
//!
//! ```text
//! Waiting ----> Deactivated
//!    |  ^            |
//!    v  '------------'
//!  Ready --> Starting --> Running --> Completing --> Done
//!    |           |           |            |
//!    '-----------+-----------+------------+--> Aborting --> Failed
//! ```
//!
//! `Waiting`, `Deactivated`, `Starting`, `Running`, `Completing` and
//! `Aborting` may also re-enter themselves (a worker refreshing
//! `updated_at` without making progress). `Done`, `Failed` and
//! `Invalidated` are terminal.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        data::KnitDataBody,
        plan::{LogPoint, MountPoint, PlanBody},
    },
    errors::KnitError,
};

/// Lifecycle status of a [`Run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnitRunStatus {
    /// Created by projection; inputs bound but not yet schedulable.
    Waiting,
    /// Held because the plan is inactive.
    Deactivated,
    /// All inputs ready; eligible for the scheduler.
    Ready,
    /// Worker job submitted to the cluster.
    Starting,
    /// Main container observed running.
    Running,
    /// Main container succeeded; outputs being finalized.
    Completing,
    /// Failure path; outputs being torn down.
    Aborting,
    /// Terminal success.
    Done,
    /// Terminal failure.
    Failed,
    /// Terminal; the run was abandoned before completion.
    Invalidated,
}

impl KnitRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KnitRunStatus::Waiting => "waiting",
            KnitRunStatus::Deactivated => "deactivated",
            KnitRunStatus::Ready => "ready",
            KnitRunStatus::Starting => "starting",
            KnitRunStatus::Running => "running",
            KnitRunStatus::Completing => "completing",
            KnitRunStatus::Aborting => "aborting",
            KnitRunStatus::Done => "done",
            KnitRunStatus::Failed => "failed",
            KnitRunStatus::Invalidated => "invalidated",
        }
    }

    /// Whether a run in this status can never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            KnitRunStatus::Done | KnitRunStatus::Failed | KnitRunStatus::Invalidated
        )
    }

    /// The transition table. Self-transitions are allowed for every
    /// non-terminal status that a worker may touch without advancing.
    pub fn can_transit_to(&self, next: KnitRunStatus) -> bool {
        use KnitRunStatus::*;
        match self {
            Waiting => matches!(next, Waiting | Deactivated | Ready | Aborting),
            Deactivated => matches!(next, Waiting | Deactivated | Aborting),
            Ready => matches!(next, Starting | Aborting),
            Starting => matches!(next, Starting | Running | Aborting),
            Running => matches!(next, Running | Completing | Aborting),
            Completing => matches!(next, Completing | Done | Aborting),
            Aborting => matches!(next, Aborting | Failed),
            Done | Failed | Invalidated => false,
        }
    }
}

impl fmt::Display for KnitRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for KnitRunStatus {
    type Err = KnitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use KnitRunStatus::*;
        match s {
            "waiting" => Ok(Waiting),
            "deactivated" => Ok(Deactivated),
            "ready" => Ok(Ready),
            "starting" => Ok(Starting),
            "running" => Ok(Running),
            "completing" => Ok(Completing),
            "aborting" => Ok(Aborting),
            "done" => Ok(Done),
            "failed" => Ok(Failed),
            "invalidated" => Ok(Invalidated),
            _ => Err(KnitError::bad_request(format!(
                "`{s}` is not a run status"
            ))),
        }
    }
}

/// Binding of a data artifact to an input or output mountpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub mount_point: MountPoint,
    pub knit_data_body: KnitDataBody,
}

/// Binding of the log artifact to a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogAssignment {
    pub log_point: LogPoint,
    pub knit_data_body: KnitDataBody,
}

/// Identity and status of a run, without its assignments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunBody {
    pub id: String,
    pub status: KnitRunStatus,
    /// Opaque lease holder name, set while a worker job owns the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_name: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub plan: PlanBody,
}

/// A run: body plus input/output/log assignments.
///
/// Inputs never change after creation. Output knit ids are allocated at
/// run creation; their volume refs are allocated at run start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    #[serde(flatten)]
    pub run_body: RunBody,
    #[serde(default)]
    pub inputs: Vec<Assignment>,
    #[serde(default)]
    pub outputs: Vec<Assignment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<LogAssignment>,
}

impl Run {
    /// Every data body the run references: inputs, outputs, and log.
    pub fn bound_data(&self) -> impl Iterator<Item = &KnitDataBody> {
        self.inputs
            .iter()
            .chain(self.outputs.iter())
            .map(|a| &a.knit_data_body)
            .chain(self.log.iter().map(|l| &l.knit_data_body))
    }

    /// Output and log data bodies, the artifacts this run produces.
    pub fn produced_data(&self) -> impl Iterator<Item = &KnitDataBody> {
        self.outputs
            .iter()
            .map(|a| &a.knit_data_body)
            .chain(self.log.iter().map(|l| &l.knit_data_body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [KnitRunStatus; 10] = [
        KnitRunStatus::Waiting,
        KnitRunStatus::Deactivated,
        KnitRunStatus::Ready,
        KnitRunStatus::Starting,
        KnitRunStatus::Running,
        KnitRunStatus::Completing,
        KnitRunStatus::Aborting,
        KnitRunStatus::Done,
        KnitRunStatus::Failed,
        KnitRunStatus::Invalidated,
    ];

    fn allowed(from: KnitRunStatus) -> Vec<KnitRunStatus> {
        use KnitRunStatus::*;
        match from {
            Waiting => vec![Waiting, Deactivated, Ready, Aborting],
            Deactivated => vec![Waiting, Deactivated, Aborting],
            Ready => vec![Starting, Aborting],
            Starting => vec![Starting, Running, Aborting],
            Running => vec![Running, Completing, Aborting],
            Completing => vec![Completing, Done, Aborting],
            Aborting => vec![Aborting, Failed],
            Done | Failed | Invalidated => vec![],
        }
    }

    #[test]
    fn test_transition_table_is_exhaustive() {
        for from in ALL {
            let legal = allowed(from);
            for to in ALL {
                assert_eq!(
                    from.can_transit_to(to),
                    legal.contains(&to),
                    "transition {} -> {}",
                    from,
                    to,
                );
            }
        }
    }

    #[test]
    fn test_terminal_statuses_never_move() {
        for from in [
            KnitRunStatus::Done,
            KnitRunStatus::Failed,
            KnitRunStatus::Invalidated,
        ] {
            assert!(from.is_terminal());
            for to in ALL {
                assert!(!from.can_transit_to(to));
            }
        }
    }

    #[test]
    fn test_status_round_trips_through_strings() {
        for status in ALL {
            let parsed: KnitRunStatus = status.as_str().parse().expect("parse");
            assert_eq!(parsed, status);
        }
        assert!("unknown".parse::<KnitRunStatus>().is_err());
    }
}

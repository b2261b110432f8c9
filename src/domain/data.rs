//! Data artifacts and their lineage views.
//!
//! A [`KnitData`] is an immutable artifact backed by exactly one
//! persistent volume claim. Its identity (`knit_id`) is server-issued and
//! stable for the life of the row; the volume ref is never reused. The
//! lineage views (`upstream`, `downstreams`, `nominated_by`) are derived
//! from the run and plan tables when the data is read.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        plan::{LogPoint, MountPoint, PlanBody},
        run::{KnitRunStatus, RunBody},
        tag::TagSet,
    },
    errors::KnitError,
};

/// Identity of a data artifact: knit id, backing volume, and tags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnitDataBody {
    pub knit_id: String,
    pub volume_ref: String,
    #[serde(default)]
    pub tags: TagSet,
}

/// Where a data artifact came from: the run and the mountpoint (or log
/// point) that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSource {
    pub run_body: RunBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_point: Option<MountPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_point: Option<LogPoint>,
}

/// A downstream consumer of a data artifact: a run that has the data
/// bound to one of its inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSink {
    pub run_body: RunBody,
    pub mount_point: MountPoint,
}

impl DataSink {
    pub fn status(&self) -> KnitRunStatus {
        self.run_body.status
    }
}

/// A plan whose input predicate the data currently satisfies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nomination {
    pub plan_body: PlanBody,
    pub mount_point: MountPoint,
}

/// A data artifact with its lineage views attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnitData {
    #[serde(flatten)]
    pub knit_data_body: KnitDataBody,
    pub upstream: DataSource,
    #[serde(default)]
    pub downstreams: Vec<DataSink>,
    #[serde(default)]
    pub nominated_by: Vec<Nomination>,
}

/// Access mode of a data agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataAgentMode {
    Read,
    Write,
}

impl DataAgentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataAgentMode::Read => "read",
            DataAgentMode::Write => "write",
        }
    }
}

impl fmt::Display for DataAgentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A short-lived sidecar binding of a data artifact to a read or write
/// channel. At most one write agent may exist per knit id; readers may
/// coexist. The lease deadline is advisory: stale records are reaped by a
/// background sweep, and bytes written after expiry are not promoted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataAgent {
    pub name: String,
    pub mode: DataAgentMode,
    pub knit_data_body: KnitDataBody,
    pub lifecycle_suspend_until: DateTime<Utc>,
}

impl DataAgent {
    pub fn knit_id(&self) -> &str {
        &self.knit_data_body.knit_id
    }

    pub fn volume_ref(&self) -> &str {
        &self.knit_data_body.volume_ref
    }

    pub fn expired_at(&self, now: DateTime<Utc>) -> bool {
        self.lifecycle_suspend_until <= now
    }
}

/// Tombstone for a volume ref detached from any live run or data,
/// consumed by the garbage-collection loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Garbage {
    pub knit_id: String,
    pub volume_ref: String,
}

impl KnitData {
    /// Whether the artifact is queryable: produced by a finished run and
    /// not invalidated.
    pub fn is_queryable(&self) -> bool {
        self.upstream.run_body.status == KnitRunStatus::Done
    }
}

/// Mint a fresh server-issued knit id.
pub fn new_knit_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Mint a fresh volume ref for a knit id. Volume refs are unique per
/// allocation and never reused, so a suffix is always appended.
pub fn new_volume_ref(knit_id: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("data-{}-{}", knit_id, &suffix[..8])
}

/// Validate that a user-supplied tag does not squat the reserved
/// namespace.
pub fn reject_system_tags(tags: &TagSet) -> Result<(), KnitError> {
    if let Some(tag) = tags.iter().find(|t| t.is_system()) {
        return Err(KnitError::bad_request(format!(
            "tag key `{}` is reserved",
            tag.key
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::tag::{Tag, TagSet};

    #[test]
    fn test_volume_refs_are_never_reused() {
        let a = new_volume_ref("some-knit-id");
        let b = new_volume_ref("some-knit-id");
        assert_ne!(a, b);
        assert!(a.starts_with("data-some-knit-id-"));
    }

    #[test]
    fn test_reject_system_tags() {
        let user = TagSet::new([Tag::new("project", "example")]);
        assert!(reject_system_tags(&user).is_ok());

        let squatting = TagSet::new([Tag::new("knit#id", "forged")]);
        assert!(reject_system_tags(&squatting).is_err());
    }
}

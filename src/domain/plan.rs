//! Plan definitions.
//!
//! A Plan is the declarative template runs are generated from: a container
//! image, typed input/output mountpoints with tag predicates, resource
//! requests and node placement rules. Pseudo plans (`uploaded`,
//! `imported`) are system-managed sources that front direct data ingress;
//! they have no image and exactly one output.
//!
//! Plans are deduplicated by a content hash over their canonical JSON
//! form, so registering the same definition twice yields the same plan.

use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{domain::tag::TagSet, errors::KnitError};

/// Names of the system-managed pseudo plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PseudoPlanName {
    /// Source plan for data uploaded through the backend API.
    Uploaded,
    /// Source plan for data imported from a pre-provisioned volume.
    Imported,
}

impl PseudoPlanName {
    pub fn as_str(&self) -> &'static str {
        match self {
            PseudoPlanName::Uploaded => "uploaded",
            PseudoPlanName::Imported => "imported",
        }
    }
}

impl fmt::Display for PseudoPlanName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PseudoPlanName {
    type Err = KnitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploaded" => Ok(PseudoPlanName::Uploaded),
            "imported" => Ok(PseudoPlanName::Imported),
            _ => Err(KnitError::bad_request(format!(
                "`{s}` is not a pseudo plan name"
            ))),
        }
    }
}

/// Container image reference of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageIdentifier {
    pub image: String,
    pub version: String,
}

impl fmt::Display for ImageIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.image, self.version)
    }
}

/// How strongly a plan is drawn to nodes labelled `key=value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnNodeMode {
    /// Tolerate the label but do not steer towards it.
    May,
    /// Prefer nodes with the label.
    Prefer,
    /// Run only on nodes with the label.
    Must,
}

/// A node placement rule of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnNode {
    pub mode: OnNodeMode,
    pub key: String,
    pub value: String,
}

/// An input or output binding point inside the container.
///
/// For inputs, `tags` is the predicate data must satisfy to be bound; for
/// outputs, `tags` are attached to the produced data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountPoint {
    pub id: i32,
    pub path: String,
    #[serde(default)]
    pub tags: TagSet,
}

/// The log collection point of a plan. Logs have no container path of
/// their own; the nurse container writes them under a fixed mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPoint {
    pub id: i32,
    #[serde(default)]
    pub tags: TagSet,
}

/// Identity and scheduling attributes of a plan, without its mountpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanBody {
    pub plan_id: String,
    pub hash: String,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageIdentifier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pseudo: Option<PseudoPlanName>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_node: Vec<OnNode>,
}

impl PlanBody {
    /// Human-readable plan name: the pseudo plan name, or `image:version`.
    pub fn name(&self) -> String {
        if let Some(pseudo) = &self.pseudo {
            pseudo.to_string()
        } else if let Some(image) = &self.image {
            image.to_string()
        } else {
            self.plan_id.clone()
        }
    }
}

/// A full plan: body plus mountpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(flatten)]
    pub plan_body: PlanBody,
    #[serde(default)]
    pub inputs: Vec<MountPoint>,
    #[serde(default)]
    pub outputs: Vec<MountPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<LogPoint>,
    /// Tag keys whose values must agree across all inputs of one run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub consistency: Vec<String>,
}

/// A plan definition as submitted for registration. The store assigns the
/// plan id and mountpoint ids; the content hash is computed over this
/// canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSpec {
    pub image: ImageIdentifier,
    pub inputs: Vec<MountPointSpec>,
    #[serde(default)]
    pub outputs: Vec<MountPointSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<LogPointSpec>,
    #[serde(default)]
    pub active: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_node: Vec<OnNode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub consistency: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountPointSpec {
    pub path: String,
    #[serde(default)]
    pub tags: TagSet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPointSpec {
    #[serde(default)]
    pub tags: TagSet,
}

impl PlanSpec {
    /// Content hash of the definition, used to deduplicate registration.
    ///
    /// The hash is SHA-256 over the canonical JSON encoding. `TagSet` and
    /// `BTreeMap` are ordered, so two specs with the same meaning hash
    /// identically.
    pub fn content_hash(&self) -> Result<String, KnitError> {
        let canonical = serde_json::to_vec(self)
            .map_err(|e| KnitError::internal(format!("cannot hash plan spec: {e}")))?;
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        Ok(hex::encode(hasher.finalize()))
    }

    /// Validate the definition before registration.
    pub fn validate(&self) -> Result<(), KnitError> {
        if self.image.image.is_empty() || self.image.version.is_empty() {
            return Err(KnitError::bad_request(
                "plan image must have both name and version",
            ));
        }
        if self.inputs.is_empty() {
            return Err(KnitError::bad_request("plan must have at least one input"));
        }
        for mp in self.inputs.iter().chain(self.outputs.iter()) {
            if mp.path.is_empty() {
                return Err(KnitError::bad_request("mountpoint path must not be empty"));
            }
        }
        for mp in &self.inputs {
            if mp.tags.is_empty() {
                return Err(KnitError::bad_request(
                    "input mountpoint must carry a tag predicate",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::tag::Tag;

    fn spec() -> PlanSpec {
        PlanSpec {
            image: ImageIdentifier {
                image: "repo.invalid/trainer".into(),
                version: "1.0".into(),
            },
            inputs: vec![MountPointSpec {
                path: "/in/dataset".into(),
                tags: TagSet::new([Tag::new("type", "dataset")]),
            }],
            outputs: vec![MountPointSpec {
                path: "/out/model".into(),
                tags: TagSet::new([Tag::new("type", "model")]),
            }],
            log: None,
            active: true,
            resources: BTreeMap::new(),
            on_node: vec![],
            consistency: vec![],
        }
    }

    #[test]
    fn test_content_hash_is_stable() {
        let a = spec();
        let b = spec();
        assert_eq!(
            a.content_hash().expect("hash"),
            b.content_hash().expect("hash"),
        );

        let mut c = spec();
        c.image.version = "1.1".into();
        assert_ne!(
            a.content_hash().expect("hash"),
            c.content_hash().expect("hash"),
        );
    }

    #[test]
    fn test_validate_rejects_broken_specs() {
        let mut no_image = spec();
        no_image.image.image = String::new();
        assert!(no_image.validate().is_err());

        let mut no_version = spec();
        no_version.image.version = String::new();
        assert!(no_version.validate().is_err());

        let mut empty_path = spec();
        empty_path.outputs[0].path = String::new();
        assert!(empty_path.validate().is_err());

        let mut no_predicate = spec();
        no_predicate.inputs[0].tags = TagSet::default();
        assert!(no_predicate.validate().is_err());

        assert!(spec().validate().is_ok());
    }

    #[test]
    fn test_plan_name() {
        let body = PlanBody {
            plan_id: "plan-1".into(),
            hash: "#".into(),
            active: true,
            image: Some(ImageIdentifier {
                image: "repo.invalid/trainer".into(),
                version: "1.0".into(),
            }),
            pseudo: None,
            resources: BTreeMap::new(),
            on_node: vec![],
        };
        assert_eq!(body.name(), "repo.invalid/trainer:1.0");

        let pseudo = PlanBody {
            image: None,
            pseudo: Some(PseudoPlanName::Uploaded),
            ..body
        };
        assert_eq!(pseudo.name(), "uploaded");
    }
}

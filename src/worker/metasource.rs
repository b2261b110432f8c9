//! Worker job specification.
//!
//! [`WorkerSource`] validates a run and renders the Kubernetes `Job` that
//! executes it: the user's `main` container surrounded by `init-main` /
//! `init-log` (pre-creating output directories) and the `nurse` sidecar
//! (tailing main's output into the log volume). Every referenced data
//! artifact becomes a PVC-backed volume named after its knit id.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use k8s_openapi::{
    api::{
        batch::v1::{Job, JobSpec},
        core::v1::{
            Affinity, ConfigMapProjection, Container, DownwardAPIProjection,
            DownwardAPIVolumeFile, EnvVar, EnvVarSource, KeyToPath, NodeAffinity, NodeSelector,
            NodeSelectorRequirement, NodeSelectorTerm, ObjectFieldSelector,
            PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec,
            PreferredSchedulingTerm, ProjectedVolumeSource, ResourceRequirements,
            ServiceAccountTokenProjection, Toleration, Volume, VolumeMount, VolumeProjection,
        },
    },
    apimachinery::pkg::api::resource::Quantity,
};
use kube::api::ObjectMeta;

use crate::{
    config::KnitClusterConfig,
    domain::{
        plan::{ImageIdentifier, OnNode, OnNodeMode},
        run::Run,
    },
    errors::KnitError,
};

const LOG_MOUNT_PATH: &str = "/log";
const LOG_FILE_PATH: &str = "/log/log";
const SERVICEACCOUNT_VOLUME: &str = "serviceaccount";
const SERVICEACCOUNT_MOUNT_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// A validated run, ready to be rendered into a worker `Job`.
pub struct WorkerSource<'a> {
    run: &'a Run,
    image: &'a ImageIdentifier,
}

impl<'a> WorkerSource<'a> {
    /// Validate the run. Rejected before submission: assignments without
    /// data, mountpoints without a path, images without name or version,
    /// and the same knit id assigned to two produced artifacts.
    pub fn new(run: &'a Run) -> Result<Self, KnitError> {
        let image = run
            .run_body
            .plan
            .image
            .as_ref()
            .ok_or_else(|| KnitError::bad_request("pseudo plans have no worker"))?;
        if image.image.is_empty() || image.version.is_empty() {
            return Err(KnitError::bad_request(
                "worker image needs both name and version",
            ));
        }

        for assignment in run.inputs.iter().chain(run.outputs.iter()) {
            if assignment.knit_data_body.knit_id.is_empty() {
                return Err(KnitError::bad_request(format!(
                    "mountpoint {} has no data",
                    assignment.mount_point.path
                )));
            }
            if assignment.mount_point.path.is_empty() {
                return Err(KnitError::bad_request(format!(
                    "mountpoint {} has an empty path",
                    assignment.mount_point.id
                )));
            }
        }
        if let Some(log) = &run.log {
            if log.knit_data_body.knit_id.is_empty() {
                return Err(KnitError::bad_request("log mountpoint has no data"));
            }
        }

        let mut produced = HashSet::new();
        for body in run.produced_data() {
            if !produced.insert(&body.knit_id) {
                return Err(KnitError::bad_request(format!(
                    "knit id {} is assigned to two produced artifacts",
                    body.knit_id
                )));
            }
        }

        Ok(Self { run, image })
    }

    /// The worker instance name, derived from the run id. Doubles as the
    /// job name.
    pub fn instance(&self) -> String {
        format!("worker-run-{}", self.run.run_body.id)
    }

    /// Render the `Job`.
    pub fn build(&self, config: &KnitClusterConfig) -> Job {
        let run = self.run;

        let helper_limits = ResourceRequirements {
            limits: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity("50m".to_string())),
                ("memory".to_string(), Quantity("100Mi".to_string())),
            ])),
            ..Default::default()
        };

        let mut init_containers = Vec::new();
        if !run.outputs.is_empty() {
            init_containers.push(Container {
                name: "init-main".to_string(),
                image: Some(config.worker.init.image.clone()),
                args: Some(run.outputs.iter().map(|a| a.mount_point.path.clone()).collect()),
                volume_mounts: Some(
                    run.outputs
                        .iter()
                        .map(|a| VolumeMount {
                            name: a.knit_data_body.knit_id.clone(),
                            mount_path: a.mount_point.path.clone(),
                            read_only: Some(true),
                            ..Default::default()
                        })
                        .collect(),
                ),
                resources: Some(helper_limits.clone()),
                ..Default::default()
            });
        }
        if let Some(log) = &run.log {
            init_containers.push(Container {
                name: "init-log".to_string(),
                image: Some(config.worker.init.image.clone()),
                args: Some(vec![LOG_MOUNT_PATH.to_string()]),
                volume_mounts: Some(vec![VolumeMount {
                    name: log.knit_data_body.knit_id.clone(),
                    mount_path: LOG_MOUNT_PATH.to_string(),
                    read_only: Some(true),
                    ..Default::default()
                }]),
                resources: Some(helper_limits.clone()),
                ..Default::default()
            });
        }

        let mut main_mounts: Vec<VolumeMount> = run
            .inputs
            .iter()
            .map(|a| VolumeMount {
                name: a.knit_data_body.knit_id.clone(),
                mount_path: a.mount_point.path.clone(),
                read_only: Some(true),
                ..Default::default()
            })
            .collect();
        main_mounts.extend(run.outputs.iter().map(|a| VolumeMount {
            name: a.knit_data_body.knit_id.clone(),
            mount_path: a.mount_point.path.clone(),
            ..Default::default()
        }));

        let main_limits = if run.run_body.plan.resources.is_empty() {
            None
        } else {
            Some(ResourceRequirements {
                limits: Some(
                    run.run_body
                        .plan
                        .resources
                        .iter()
                        .map(|(k, v)| (k.clone(), Quantity(v.clone())))
                        .collect(),
                ),
                ..Default::default()
            })
        };

        let mut containers = vec![Container {
            name: "main".to_string(),
            image: Some(self.image.to_string()),
            volume_mounts: Some(main_mounts),
            resources: main_limits,
            ..Default::default()
        }];
        if let Some(log) = &run.log {
            containers.push(Container {
                name: "nurse".to_string(),
                image: Some(config.worker.nurse.image.clone()),
                args: Some(vec!["main".to_string(), LOG_FILE_PATH.to_string()]),
                volume_mounts: Some(vec![
                    VolumeMount {
                        name: log.knit_data_body.knit_id.clone(),
                        mount_path: LOG_MOUNT_PATH.to_string(),
                        ..Default::default()
                    },
                    VolumeMount {
                        name: SERVICEACCOUNT_VOLUME.to_string(),
                        mount_path: SERVICEACCOUNT_MOUNT_PATH.to_string(),
                        read_only: Some(true),
                        ..Default::default()
                    },
                ]),
                env: Some(vec![
                    downward_env("POD_NAME", "metadata.name"),
                    downward_env("NAMESPACE", "metadata.namespace"),
                ]),
                resources: Some(helper_limits),
                ..Default::default()
            });
        }

        let mut volumes = Vec::new();
        if run.log.is_some() {
            volumes.push(serviceaccount_volume());
        }
        volumes.extend(run.bound_data().map(|body| Volume {
            name: body.knit_id.clone(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: body.volume_ref.clone(),
                ..Default::default()
            }),
            ..Default::default()
        }));

        let (tolerations, affinity) = node_scheduling(&run.run_body.plan.on_node);

        Job {
            metadata: ObjectMeta {
                name: Some(self.instance()),
                labels: Some(BTreeMap::from([
                    ("app".to_string(), "knit-worker".to_string()),
                    ("run".to_string(), run.run_body.id.clone()),
                ])),
                ..Default::default()
            },
            spec: Some(JobSpec {
                parallelism: Some(1),
                backoff_limit: Some(0),
                template: PodTemplateSpec {
                    metadata: None,
                    spec: Some(PodSpec {
                        restart_policy: Some("Never".to_string()),
                        service_account_name: Some(config.worker.nurse.service_account.clone()),
                        automount_service_account_token: Some(false),
                        enable_service_links: Some(false),
                        priority_class_name: Some(config.worker.priority.clone()),
                        init_containers: if init_containers.is_empty() {
                            None
                        } else {
                            Some(init_containers)
                        },
                        containers,
                        volumes: Some(volumes),
                        tolerations: if tolerations.is_empty() {
                            None
                        } else {
                            Some(tolerations)
                        },
                        affinity,
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

fn downward_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn serviceaccount_volume() -> Volume {
    Volume {
        name: SERVICEACCOUNT_VOLUME.to_string(),
        projected: Some(ProjectedVolumeSource {
            default_mode: Some(0o644),
            sources: Some(vec![
                VolumeProjection {
                    service_account_token: Some(ServiceAccountTokenProjection {
                        path: "token".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                VolumeProjection {
                    config_map: Some(ConfigMapProjection {
                        name: Some("kube-root-ca.crt".to_string()),
                        items: Some(vec![KeyToPath {
                            key: "ca.crt".to_string(),
                            path: "ca.crt".to_string(),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                VolumeProjection {
                    downward_api: Some(DownwardAPIProjection {
                        items: Some(vec![DownwardAPIVolumeFile {
                            path: "namespace".to_string(),
                            field_ref: Some(ObjectFieldSelector {
                                api_version: Some("v1".to_string()),
                                field_path: "metadata.namespace".to_string(),
                            }),
                            ..Default::default()
                        }]),
                    }),
                    ..Default::default()
                },
            ]),
        }),
        ..Default::default()
    }
}

/// Tolerations and node affinity from the plan's placement rules.
///
/// `may` placements contribute a `NoSchedule` toleration only; `prefer`
/// and `must` tolerate both `NoSchedule` and `PreferNoSchedule`. `must`
/// entries AND together into the single required node-selector term, and
/// each `prefer` entry becomes its own weight-1 preferred term.
fn node_scheduling(on_node: &[OnNode]) -> (Vec<Toleration>, Option<Affinity>) {
    let mut tolerated: BTreeSet<(String, String, &'static str)> = BTreeSet::new();
    for rule in on_node {
        tolerated.insert((rule.key.clone(), rule.value.clone(), "NoSchedule"));
        if matches!(rule.mode, OnNodeMode::Prefer | OnNodeMode::Must) {
            tolerated.insert((rule.key.clone(), rule.value.clone(), "PreferNoSchedule"));
        }
    }
    let tolerations = tolerated
        .into_iter()
        .map(|(key, value, effect)| Toleration {
            key: Some(key),
            operator: Some("Equal".to_string()),
            value: Some(value),
            effect: Some(effect.to_string()),
            ..Default::default()
        })
        .collect();

    let musts: Vec<&OnNode> = on_node
        .iter()
        .filter(|r| r.mode == OnNodeMode::Must)
        .collect();
    let prefers: Vec<&OnNode> = on_node
        .iter()
        .filter(|r| r.mode == OnNodeMode::Prefer)
        .collect();

    if musts.is_empty() && prefers.is_empty() {
        return (tolerations, None);
    }

    let required = if musts.is_empty() {
        None
    } else {
        Some(NodeSelector {
            node_selector_terms: vec![NodeSelectorTerm {
                match_expressions: Some(
                    musts
                        .iter()
                        .map(|r| NodeSelectorRequirement {
                            key: r.key.clone(),
                            operator: "In".to_string(),
                            values: Some(vec![r.value.clone()]),
                        })
                        .collect(),
                ),
                ..Default::default()
            }],
        })
    };
    let preferred = if prefers.is_empty() {
        None
    } else {
        Some(
            prefers
                .iter()
                .map(|r| PreferredSchedulingTerm {
                    weight: 1,
                    preference: NodeSelectorTerm {
                        match_expressions: Some(vec![NodeSelectorRequirement {
                            key: r.key.clone(),
                            operator: "In".to_string(),
                            values: Some(vec![r.value.clone()]),
                        }]),
                        ..Default::default()
                    },
                })
                .collect(),
        )
    };

    let affinity = Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: required,
            preferred_during_scheduling_ignored_during_execution: preferred,
            ..Default::default()
        }),
        ..Default::default()
    };
    (tolerations, Some(affinity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        data::KnitDataBody,
        plan::{LogPoint, MountPoint, PlanBody},
        run::{Assignment, KnitRunStatus, LogAssignment, RunBody},
    };
    use chrono::Utc;

    fn body(knit_id: &str) -> KnitDataBody {
        KnitDataBody {
            knit_id: knit_id.to_string(),
            volume_ref: format!("ref-{knit_id}"),
            tags: Default::default(),
        }
    }

    fn assignment(id: i32, path: &str, knit_id: &str) -> Assignment {
        Assignment {
            mount_point: MountPoint {
                id,
                path: path.to_string(),
                tags: Default::default(),
            },
            knit_data_body: body(knit_id),
        }
    }

    fn base_run(with_log: bool) -> Run {
        Run {
            run_body: RunBody {
                id: "test-run-id".to_string(),
                status: KnitRunStatus::Ready,
                worker_name: None,
                updated_at: Utc::now(),
                plan: PlanBody {
                    plan_id: "test-plan-id".to_string(),
                    hash: "#hash".to_string(),
                    active: true,
                    image: Some(ImageIdentifier {
                        image: "repo.invalid/image-name".to_string(),
                        version: "1.0".to_string(),
                    }),
                    pseudo: None,
                    resources: BTreeMap::from([
                        ("cpu".to_string(), "1".to_string()),
                        ("memory".to_string(), "1Gi".to_string()),
                    ]),
                    on_node: vec![],
                },
            },
            inputs: vec![
                assignment(1, "/in/1", "input-1"),
                assignment(2, "/in/2", "input-2"),
            ],
            outputs: vec![
                assignment(3, "/out/3", "output-3"),
                assignment(4, "/out/4", "output-4"),
            ],
            log: with_log.then(|| LogAssignment {
                log_point: LogPoint {
                    id: 5,
                    tags: Default::default(),
                },
                knit_data_body: body("log-5"),
            }),
        }
    }

    fn pod_spec(job: &Job) -> &PodSpec {
        job.spec
            .as_ref()
            .expect("job spec")
            .template
            .spec
            .as_ref()
            .expect("pod spec")
    }

    #[test]
    fn test_job_shape_with_output_and_log() {
        let run = base_run(true);
        let source = WorkerSource::new(&run).expect("valid run");
        let config = KnitClusterConfig::default();
        let job = source.build(&config);

        assert_eq!(job.metadata.name.as_deref(), Some("worker-run-test-run-id"));
        let spec = job.spec.as_ref().expect("job spec");
        assert_eq!(spec.parallelism, Some(1));
        assert_eq!(spec.backoff_limit, Some(0));

        let pod = pod_spec(&job);
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        assert_eq!(pod.automount_service_account_token, Some(false));
        assert_eq!(pod.enable_service_links, Some(false));
        assert_eq!(
            pod.service_account_name.as_deref(),
            Some(config.worker.nurse.service_account.as_str()),
        );
        assert_eq!(
            pod.priority_class_name.as_deref(),
            Some(config.worker.priority.as_str()),
        );

        let inits = pod.init_containers.as_ref().expect("init containers");
        assert_eq!(
            inits.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            vec!["init-main", "init-log"],
        );
        assert_eq!(
            inits[0].args,
            Some(vec!["/out/3".to_string(), "/out/4".to_string()]),
        );
        assert_eq!(inits[1].args, Some(vec!["/log".to_string()]));

        assert_eq!(
            pod.containers.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            vec!["main", "nurse"],
        );
        let main = &pod.containers[0];
        assert_eq!(main.image.as_deref(), Some("repo.invalid/image-name:1.0"));
        let mounts = main.volume_mounts.as_ref().expect("mounts");
        assert!(mounts
            .iter()
            .filter(|m| m.mount_path.starts_with("/in/"))
            .all(|m| m.read_only == Some(true)));
        assert!(mounts
            .iter()
            .filter(|m| m.mount_path.starts_with("/out/"))
            .all(|m| m.read_only.is_none()));
        let limits = main
            .resources
            .as_ref()
            .and_then(|r| r.limits.as_ref())
            .expect("main limits");
        assert_eq!(limits.get("cpu"), Some(&Quantity("1".to_string())));
        assert_eq!(limits.get("memory"), Some(&Quantity("1Gi".to_string())));

        let nurse = &pod.containers[1];
        assert_eq!(
            nurse.args,
            Some(vec!["main".to_string(), "/log/log".to_string()]),
        );
        let env_names: Vec<&str> = nurse
            .env
            .as_ref()
            .expect("nurse env")
            .iter()
            .map(|e| e.name.as_str())
            .collect();
        assert_eq!(env_names, vec!["POD_NAME", "NAMESPACE"]);

        let volumes = pod.volumes.as_ref().expect("volumes");
        let names: Vec<&str> = volumes.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "serviceaccount",
                "input-1",
                "input-2",
                "output-3",
                "output-4",
                "log-5",
            ],
        );
        for volume in volumes.iter().skip(1) {
            let claim = volume
                .persistent_volume_claim
                .as_ref()
                .expect("pvc volume");
            assert_eq!(claim.claim_name, format!("ref-{}", volume.name));
        }
        assert!(volumes[0].projected.is_some());
    }

    #[test]
    fn test_job_shape_without_log() {
        let run = base_run(false);
        let job = WorkerSource::new(&run).expect("valid run").build(&KnitClusterConfig::default());
        let pod = pod_spec(&job);

        assert_eq!(
            pod.containers.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            vec!["main"],
        );
        let inits = pod.init_containers.as_ref().expect("init containers");
        assert_eq!(
            inits.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            vec!["init-main"],
        );
        assert!(pod
            .volumes
            .as_ref()
            .expect("volumes")
            .iter()
            .all(|v| v.name != "serviceaccount"));
    }

    #[test]
    fn test_node_scheduling_rules() {
        let mut run = base_run(false);
        run.run_body.plan.on_node = vec![
            OnNode {
                mode: OnNodeMode::May,
                key: "key1".into(),
                value: "value1".into(),
            },
            OnNode {
                mode: OnNodeMode::Prefer,
                key: "key2".into(),
                value: "value2".into(),
            },
            OnNode {
                mode: OnNodeMode::Must,
                key: "key3".into(),
                value: "value3".into(),
            },
        ];
        let job = WorkerSource::new(&run).expect("valid run").build(&KnitClusterConfig::default());
        let pod = pod_spec(&job);

        let tolerations = pod.tolerations.as_ref().expect("tolerations");
        let as_tuples: Vec<(&str, &str, &str)> = tolerations
            .iter()
            .map(|t| {
                (
                    t.key.as_deref().unwrap_or(""),
                    t.value.as_deref().unwrap_or(""),
                    t.effect.as_deref().unwrap_or(""),
                )
            })
            .collect();
        assert_eq!(
            as_tuples,
            vec![
                ("key1", "value1", "NoSchedule"),
                ("key2", "value2", "NoSchedule"),
                ("key2", "value2", "PreferNoSchedule"),
                ("key3", "value3", "NoSchedule"),
                ("key3", "value3", "PreferNoSchedule"),
            ],
        );

        let node = pod
            .affinity
            .as_ref()
            .and_then(|a| a.node_affinity.as_ref())
            .expect("node affinity");
        let required = node
            .required_during_scheduling_ignored_during_execution
            .as_ref()
            .expect("required");
        let expressions = required.node_selector_terms[0]
            .match_expressions
            .as_ref()
            .expect("expressions");
        assert_eq!(expressions.len(), 1);
        assert_eq!(expressions[0].key, "key3");
        assert_eq!(expressions[0].values, Some(vec!["value3".to_string()]));

        let preferred = node
            .preferred_during_scheduling_ignored_during_execution
            .as_ref()
            .expect("preferred");
        assert_eq!(preferred.len(), 1);
        assert_eq!(preferred[0].weight, 1);
    }

    #[test]
    fn test_rejections() {
        // input without data
        let mut run = base_run(true);
        run.inputs[1].knit_data_body.knit_id = String::new();
        assert!(WorkerSource::new(&run).is_err());

        // input without a path
        let mut run = base_run(true);
        run.inputs[0].mount_point.path = String::new();
        assert!(WorkerSource::new(&run).is_err());

        // output without data
        let mut run = base_run(true);
        run.outputs[1].knit_data_body.knit_id = String::new();
        assert!(WorkerSource::new(&run).is_err());

        // output without a path
        let mut run = base_run(true);
        run.outputs[1].mount_point.path = String::new();
        assert!(WorkerSource::new(&run).is_err());

        // log without data
        let mut run = base_run(true);
        run.log.as_mut().expect("log").knit_data_body.knit_id = String::new();
        assert!(WorkerSource::new(&run).is_err());

        // image without name / without version
        let mut run = base_run(true);
        run.run_body.plan.image.as_mut().expect("image").image = String::new();
        assert!(WorkerSource::new(&run).is_err());
        let mut run = base_run(true);
        run.run_body.plan.image.as_mut().expect("image").version = String::new();
        assert!(WorkerSource::new(&run).is_err());

        // one knit id on two outputs
        let mut run = base_run(true);
        run.outputs[1].knit_data_body = run.outputs[0].knit_data_body.clone();
        assert!(WorkerSource::new(&run).is_err());

        // one knit id on an output and the log
        let mut run = base_run(true);
        run.outputs[1].knit_data_body = run.log.as_ref().expect("log").knit_data_body.clone();
        assert!(WorkerSource::new(&run).is_err());

        assert!(WorkerSource::new(&base_run(true)).is_ok());
    }
}

//! Kubernetes-backed [`Cluster`] implementation over `kube` typed APIs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::{
    api::{
        batch::v1::Job,
        core::v1::{
            Container, ContainerPort, PersistentVolumeClaim, PersistentVolumeClaimSpec,
            PersistentVolumeClaimVolumeSource, Pod, PodSpec, Service, ServicePort, ServiceSpec,
            Volume, VolumeMount, VolumeResourceRequirements,
        },
    },
    apimachinery::pkg::{api::resource::Quantity, util::intstr::IntOrString},
};
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams};

use crate::{
    cluster::{Cluster, DataAgentHandle, JobPhase},
    config::KnitClusterConfig,
    domain::data::{DataAgent, DataAgentMode},
    errors::KnitError,
};

const DATA_MOUNT_PATH: &str = "/knit/data";
const READY_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// Cluster access through a live Kubernetes API server.
pub struct KubeCluster {
    jobs: Api<Job>,
    pods: Api<Pod>,
    pvcs: Api<PersistentVolumeClaim>,
    services: Api<Service>,
    namespace: String,
    config: KnitClusterConfig,
}

impl KubeCluster {
    pub fn new(client: kube::Client, config: KnitClusterConfig) -> Self {
        let namespace = config.namespace.clone();
        Self {
            jobs: Api::namespaced(client.clone(), &namespace),
            pods: Api::namespaced(client.clone(), &namespace),
            pvcs: Api::namespaced(client.clone(), &namespace),
            services: Api::namespaced(client, &namespace),
            namespace,
            config,
        }
    }
}

fn map_kube_err(e: kube::Error) -> KnitError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => KnitError::missing(ae.message),
        kube::Error::Api(ae) if ae.code == 409 => KnitError::conflict(ae.message),
        other => KnitError::internal(other.to_string()),
    }
}

fn agent_labels(agent: &DataAgent) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), "knit-dataagt".to_string()),
        ("dataagt".to_string(), agent.name.clone()),
    ])
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn submit_worker(&self, job: &Job) -> Result<(), KnitError> {
        self.jobs
            .create(&PostParams::default(), job)
            .await
            .map(|_| ())
            .map_err(map_kube_err)
    }

    async fn worker_status(&self, name: &str) -> Result<JobPhase, KnitError> {
        let job = self.jobs.get(name).await.map_err(map_kube_err)?;
        let status = job.status.unwrap_or_default();
        if status.succeeded.unwrap_or(0) > 0 {
            return Ok(JobPhase::Succeeded);
        }
        if status.failed.unwrap_or(0) > 0 {
            return Ok(JobPhase::Failed {
                message: format!("job {name} reported failed pods"),
            });
        }

        let since = status
            .start_time
            .map(|t| t.0)
            .or_else(|| job.metadata.creation_timestamp.map(|t| t.0))
            .unwrap_or_else(Utc::now);

        let pods = self
            .pods
            .list(&ListParams::default().labels(&format!("job-name={name}")))
            .await
            .map_err(map_kube_err)?;
        for pod in pods {
            let Some(statuses) = pod.status.and_then(|s| s.container_statuses) else {
                continue;
            };
            let Some(main) = statuses.into_iter().find(|c| c.name == "main") else {
                continue;
            };
            let Some(state) = main.state else { continue };
            if state.running.is_some() {
                return Ok(JobPhase::Running);
            }
            if let Some(terminated) = state.terminated {
                if terminated.exit_code == 0 {
                    return Ok(JobPhase::Succeeded);
                }
                return Ok(JobPhase::Failed {
                    message: terminated
                        .message
                        .unwrap_or_else(|| format!("main exited with {}", terminated.exit_code)),
                });
            }
        }
        Ok(JobPhase::Pending { since })
    }

    async fn delete_worker(&self, name: &str) -> Result<(), KnitError> {
        self.jobs
            .delete(name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(map_kube_err)
    }

    async fn ensure_pvc(&self, volume_ref: &str) -> Result<(), KnitError> {
        match self.pvcs.get(volume_ref).await {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(map_kube_err(e)),
        }

        let volume = &self.config.data_agent.volume;
        let pvc = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(volume_ref.to_string()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                storage_class_name: Some(volume.storage_class_name.clone()),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(volume.initial_capacity.clone()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        match self.pvcs.create(&PostParams::default(), &pvc).await {
            Ok(_) => Ok(()),
            // someone else raced the creation; the claim exists, which is
            // all the caller needs
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(map_kube_err(e)),
        }
    }

    async fn pvc_is_bound(&self, volume_ref: &str) -> Result<bool, KnitError> {
        let pvc = self.pvcs.get(volume_ref).await.map_err(map_kube_err)?;
        Ok(pvc
            .status
            .and_then(|s| s.phase)
            .map(|phase| phase == "Bound")
            .unwrap_or(false))
    }

    async fn delete_pvc(&self, volume_ref: &str) -> Result<(), KnitError> {
        self.pvcs
            .delete(volume_ref, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(map_kube_err)
    }

    async fn spawn_data_agent(
        &self,
        agent: &DataAgent,
        deadline: DateTime<Utc>,
    ) -> Result<Box<dyn DataAgentHandle>, KnitError> {
        if agent.mode == DataAgentMode::Write {
            self.ensure_pvc(agent.volume_ref()).await?;
        }

        let labels = agent_labels(agent);
        let port = self.config.data_agent.port;

        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(agent.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                restart_policy: Some("Never".to_string()),
                automount_service_account_token: Some(false),
                enable_service_links: Some(false),
                containers: vec![Container {
                    name: "dataagt".to_string(),
                    image: Some(self.config.data_agent.image.clone()),
                    args: Some(vec![agent.mode.to_string(), DATA_MOUNT_PATH.to_string()]),
                    ports: Some(vec![ContainerPort {
                        container_port: i32::from(port),
                        ..Default::default()
                    }]),
                    volume_mounts: Some(vec![VolumeMount {
                        name: "the-data".to_string(),
                        mount_path: DATA_MOUNT_PATH.to_string(),
                        read_only: Some(agent.mode == DataAgentMode::Read),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }],
                volumes: Some(vec![Volume {
                    name: "the-data".to_string(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: agent.volume_ref().to_string(),
                        read_only: Some(agent.mode == DataAgentMode::Read),
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let service = Service {
            metadata: ObjectMeta {
                name: Some(agent.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(labels),
                ports: Some(vec![ServicePort {
                    port: i32::from(port),
                    target_port: Some(IntOrString::Int(i32::from(port))),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        self.pods
            .create(&PostParams::default(), &pod)
            .await
            .map_err(map_kube_err)?;
        if let Err(e) = self.services.create(&PostParams::default(), &service).await {
            let _ = self
                .pods
                .delete(&agent.name, &DeleteParams::background())
                .await;
            return Err(map_kube_err(e));
        }

        let handle = KubeDataAgentHandle {
            name: agent.name.clone(),
            pods: self.pods.clone(),
            services: self.services.clone(),
            url: format!("http://{}.{}:{}/", agent.name, self.namespace, port),
        };

        // wait until the sidecar accepts connections
        loop {
            if Utc::now() >= deadline {
                let _ = handle.close().await;
                return Err(KnitError::deadline_exceeded(format!(
                    "data agent {} did not become ready",
                    agent.name
                )));
            }
            match self.pods.get(&handle.name).await {
                Ok(pod) => {
                    let ready = pod
                        .status
                        .and_then(|s| s.container_statuses)
                        .map(|statuses| !statuses.is_empty() && statuses.iter().all(|c| c.ready))
                        .unwrap_or(false);
                    if ready {
                        return Ok(Box::new(handle));
                    }
                }
                Err(e) => {
                    let _ = handle.close().await;
                    return Err(map_kube_err(e));
                }
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }
}

struct KubeDataAgentHandle {
    name: String,
    pods: Api<Pod>,
    services: Api<Service>,
    url: String,
}

#[async_trait]
impl DataAgentHandle for KubeDataAgentHandle {
    fn url(&self) -> Result<http::Uri, KnitError> {
        self.url
            .parse()
            .map_err(|e| KnitError::internal(format!("data agent url: {e}")))
    }

    async fn close(&self) -> Result<(), KnitError> {
        let deleted = self
            .services
            .delete(&self.name, &DeleteParams::background())
            .await;
        match deleted {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(map_kube_err(e)),
        }
        match self
            .pods
            .delete(&self.name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(map_kube_err(e)),
        }
    }
}

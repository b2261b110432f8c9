use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Cluster-level configuration of the engine: the namespace it operates
/// in, the helper images it deploys, and the keychain used for import
/// tokens.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct KnitClusterConfig {
    pub namespace: String,
    pub data_agent: DataAgentConfig,
    pub worker: WorkerConfig,
    pub keychains: KeychainsConfig,
}

impl Default for KnitClusterConfig {
    fn default() -> Self {
        Self {
            namespace: "knit".to_string(),
            data_agent: DataAgentConfig::default(),
            worker: WorkerConfig::default(),
            keychains: KeychainsConfig::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DataAgentConfig {
    pub image: String,
    pub port: u16,
    pub volume: VolumeConfig,
}

impl Default for DataAgentConfig {
    fn default() -> Self {
        Self {
            image: "knit-dataagt:latest".to_string(),
            port: 8080,
            volume: VolumeConfig::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct VolumeConfig {
    pub storage_class_name: String,
    pub initial_capacity: String,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            storage_class_name: "standard".to_string(),
            initial_capacity: "1Gi".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkerConfig {
    /// Priority class assigned to every worker job.
    pub priority: String,
    /// How long a submitted job may stay pending before it is aborted.
    #[serde(with = "secs")]
    pub pending_deadline: Duration,
    pub init: InitContainerConfig,
    pub nurse: NurseContainerConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            priority: "knit-worker-priority".to_string(),
            pending_deadline: Duration::from_secs(300),
            init: InitContainerConfig::default(),
            nurse: NurseContainerConfig::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct InitContainerConfig {
    pub image: String,
}

impl Default for InitContainerConfig {
    fn default() -> Self {
        Self {
            image: "knit-init:latest".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NurseContainerConfig {
    pub service_account: String,
    pub image: String,
}

impl Default for NurseContainerConfig {
    fn default() -> Self {
        Self {
            service_account: "knit-nurse".to_string(),
            image: "knit-nurse:latest".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct KeychainsConfig {
    /// Name of the keychain signing import tokens.
    pub sign_key_for_import_token: String,
}

impl Default for KeychainsConfig {
    fn default() -> Self {
        Self {
            sign_key_for_import_token: "sign-for-import-token".to_string(),
        }
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

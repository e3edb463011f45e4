use crate::crd::{FleetKey, MachineFleet, MachineFleetStatus};
use async_trait::async_trait;
use kube::api::PostParams;
use kube::{Api, Client};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("MachineFleet not found")]
    NotFound,
    #[error("stale resourceVersion {0}")]
    Conflict(String),
    #[error("k8s error: {0}")]
    KubeError(#[source] kube::Error),
    #[error("json error: {0}")]
    SerdeJsonError(#[source] serde_json::Error),
}

impl From<serde_json::Error> for StoreError {
    fn from(v: serde_json::Error) -> Self {
        StoreError::SerdeJsonError(v)
    }
}

/// Read and conditionally write MachineFleet objects.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Returns the fleet and its current version token.
    async fn get(&self, key: &FleetKey) -> Result<(MachineFleet, String), StoreError>;

    /// Replaces the status, failing with `Conflict` when `version` is no longer current.
    async fn update_status(
        &self,
        key: &FleetKey,
        version: &str,
        status: &MachineFleetStatus,
    ) -> Result<(), StoreError>;
}

pub struct KubeStore {
    pub client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, key: &FleetKey) -> Api<MachineFleet> {
        Api::namespaced(self.client.clone(), &key.namespace)
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get(&self, key: &FleetKey) -> Result<(MachineFleet, String), StoreError> {
        let fleet = self
            .api(key)
            .get_opt(&key.name)
            .await
            .map_err(StoreError::KubeError)?
            .ok_or(StoreError::NotFound)?;
        let version = fleet.metadata.resource_version.clone().unwrap_or_default();
        Ok((fleet, version))
    }

    async fn update_status(
        &self,
        key: &FleetKey,
        version: &str,
        status: &MachineFleetStatus,
    ) -> Result<(), StoreError> {
        // The apiserver rejects a PUT carrying an outdated resourceVersion with 409.
        let data = serde_json::to_vec(&serde_json::json!({
            "apiVersion": "hcc.dev/v1alpha1",
            "kind": "MachineFleet",
            "metadata": {
                "name": key.name,
                "namespace": key.namespace,
                "resourceVersion": version,
            },
            "status": status,
        }))?;
        match self
            .api(key)
            .replace_status(&key.name, &PostParams::default(), data)
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 409 => Err(StoreError::Conflict(version.to_string())),
            Err(kube::Error::Api(e)) if e.code == 404 => Err(StoreError::NotFound),
            Err(e) => Err(StoreError::KubeError(e)),
        }
    }
}

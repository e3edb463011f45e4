// Turns a freshly created server into a cluster node, and tells which servers already are.
// The server bootstraps itself from its cloud-init user data; once its kubelet registers a Node
// of the same name, the Node is adopted: spec.providerID is set to hcloud://<server id> and the
// cloud-provider uninitialized taint is removed.

use crate::cloud::Instance;
use crate::credentials::Credentials;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{ListParams, Patch, PatchParams};
use kube::runtime::wait::await_condition;
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;
use tokio::time::error::Elapsed;
use tracing::info;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("k8s error: {0}")]
    KubeError(#[source] kube::Error),
    #[error("k8s wait error: {0}")]
    WaitError(#[source] kube::runtime::wait::Error),
    #[error("timeout waiting for node {0} to register")]
    JoinTimeout(String, #[source] Elapsed),
    #[error("node {0} disappeared while joining")]
    NodeGone(String),
}

impl From<kube::Error> for NodeError {
    fn from(v: kube::Error) -> Self {
        NodeError::KubeError(v)
    }
}

#[async_trait]
pub trait NodeConfigurer: Send + Sync {
    async fn configure_node(&self, instance: &Instance, credentials: &Credentials) -> Result<(), NodeError>;

    /// Ids of the given instances that are registered as cluster nodes.
    async fn joined(&self, instances: &[Instance]) -> Result<BTreeSet<String>, NodeError>;
}

pub struct KubeNodes {
    pub client: Client,
    pub join_timeout: Duration,
}

impl KubeNodes {
    pub fn new(client: Client, join_timeout: Duration) -> Self {
        Self { client, join_timeout }
    }
}

/// Whether `node` is backed by `instance`.
pub fn is_backed_by(node: &Node, instance: &Instance) -> bool {
    let provider_id = node.spec.as_ref().and_then(|s| s.provider_id.as_deref());
    match provider_id {
        Some(id) => id == instance.provider_id(),
        None => node.name_any() == instance.name,
    }
}

#[async_trait]
impl NodeConfigurer for KubeNodes {
    async fn configure_node(&self, instance: &Instance, _credentials: &Credentials) -> Result<(), NodeError> {
        let nodes = Api::<Node>::all(self.client.clone());
        let registered = await_condition(nodes.clone(), &instance.name, |n: Option<&Node>| n.is_some());
        let node = tokio::time::timeout(self.join_timeout, registered)
            .await
            .map_err(|e| NodeError::JoinTimeout(instance.name.clone(), e))?
            .map_err(NodeError::WaitError)?
            .ok_or_else(|| NodeError::NodeGone(instance.name.clone()))?;

        let spec = node.spec.clone().unwrap_or_default();
        if spec.provider_id.is_some() {
            return Ok(());
        }
        let taints = spec.taints.unwrap_or_default();
        info!(
            "patching Node {} with provider ID {} and removing taint",
            instance.name,
            instance.provider_id()
        );
        nodes
            .patch(
                &instance.name,
                &PatchParams::default(),
                &Patch::Merge(json!({
                    "spec": {
                        "providerID": instance.provider_id(),
                        "taints": taints.iter().filter(|x| x.key != crate::TAINT_UNINITIALIZED).collect::<Vec<_>>(),
                    },
                })),
            )
            .await?;
        Ok(())
    }

    async fn joined(&self, instances: &[Instance]) -> Result<BTreeSet<String>, NodeError> {
        let nodes = Api::<Node>::all(self.client.clone())
            .list(&ListParams::default())
            .await?;
        Ok(instances
            .iter()
            .filter(|i| nodes.items.iter().any(|n| is_backed_by(n, i)))
            .map(|i| i.id.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::NodeSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn node(name: &str, provider_id: Option<&str>) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                provider_id: provider_id.map(str::to_string),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn instance() -> Instance {
        Instance {
            id: "42".to_string(),
            name: "ns-workers-0".to_string(),
            created: None,
        }
    }

    #[test]
    fn matches_by_provider_id() {
        assert!(is_backed_by(&node("renamed", Some("hcloud://42")), &instance()));
        assert!(!is_backed_by(&node("ns-workers-0", Some("hcloud://7")), &instance()));
    }

    #[test]
    fn falls_back_to_name_before_adoption() {
        assert!(is_backed_by(&node("ns-workers-0", None), &instance()));
        assert!(!is_backed_by(&node("other", None), &instance()));
    }
}

use crate::conditions::ConditionSet;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A fleet of cloud servers that should be joined to this cluster as worker nodes.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    kind = "MachineFleet",
    group = "hcc.dev",
    version = "v1alpha1",
    status = "MachineFleetStatus",
    shortname = "mf",
    namespaced
)]
#[kube(
    printcolumn = r#"
    {"name":"desired", "type":"integer", "description":"Desired machines", "jsonPath":".spec.replicas"},
    {"name":"joined",  "type":"integer", "description":"Joined machines", "jsonPath":".status.joinedCount"},
    {"name":"degraded", "type":"string", "description":"Degradation reasons", "jsonPath":".status.conditions[?(@.type == 'Degraded')].reason"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachineFleetSpec {
    /// Number of machines that should be joined to the cluster
    pub replicas: u32,
    /// Secret (same namespace) holding the cloud API `token` and optional `userData`
    pub credentials_secret: String,
    /// Server type override, e.g. "cx22"
    pub server_type: Option<String>,
    /// Image override
    pub image: Option<String>,
    /// Location override, e.g. "fsn1"
    pub location: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineFleetStatus {
    /// Machines observed as registered cluster nodes during the last pass
    #[serde(default)]
    pub joined_count: u32,
    #[serde(default)]
    pub conditions: ConditionSet,
}

/// Stable identity of a `MachineFleet`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FleetKey {
    pub namespace: String,
    pub name: String,
}

impl FleetKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Server names of this fleet are `<prefix>-<index>`.
    pub fn prefix(&self) -> String {
        format!("{}-{}", self.namespace, self.name)
    }
}

impl fmt::Display for FleetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl From<&MachineFleet> for FleetKey {
    fn from(fleet: &MachineFleet) -> Self {
        FleetKey::new(fleet.namespace().unwrap_or_default(), fleet.name_any())
    }
}

impl MachineFleet {
    pub fn joined_count(&self) -> u32 {
        self.status.as_ref().map(|s| s.joined_count).unwrap_or_default()
    }
}

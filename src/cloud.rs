// Cloud backends able to create and destroy fleet servers.
// A server belongs to a fleet when it carries the fleet's namespace and name labels. Names
// (`<namespace>-<fleet>-<index>`) are only for humans and for picking fresh indexes.

use crate::credentials::Credentials;
use crate::crd::FleetKey;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hcloud::apis::configuration::Configuration;
use hcloud::apis::servers_api::{self, CreateServerParams, DeleteServerParams, ListServersParams};
use hcloud::models::CreateServerRequest;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;

const PAGE_SIZE: i32 = 50;

pub const LABEL_FLEET_NAMESPACE: &str = "hcc.dev/fleet-namespace";
pub const LABEL_FLEET_NAME: &str = "hcc.dev/fleet-name";

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("cloud API error: {0}")]
    Api(String),
    #[error("invalid credentials: {0}")]
    Credentials(String),
    #[error("cloud API returned an unusable server: {0}")]
    InvalidServer(String),
}

/// A server owned by a fleet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub created: Option<DateTime<Utc>>,
}

impl Instance {
    /// Kubernetes `spec.providerID` of the node backed by this server.
    pub fn provider_id(&self) -> String {
        format!("{}{}", crate::PROVIDER_ID_PREFIX, self.id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceParams {
    pub name: String,
    pub server_type: String,
    pub image: String,
    pub location: Option<String>,
    pub user_data: Option<String>,
    /// Ownership labels, see [`fleet_labels`]
    pub labels: BTreeMap<String, String>,
}

#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn list_instances(&self, fleet: &FleetKey) -> Result<Vec<Instance>, CloudError>;
    async fn create_instance(&self, params: &InstanceParams) -> Result<Instance, CloudError>;
    async fn destroy_instance(&self, instance: &Instance) -> Result<(), CloudError>;
}

/// Builds an authenticated provider for one pass.
pub trait CloudConnector: Send + Sync {
    fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn CloudProvider>, CloudError>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CloudBackend {
    #[default]
    Hetzner,
}

impl CloudConnector for CloudBackend {
    fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn CloudProvider>, CloudError> {
        match self {
            CloudBackend::Hetzner => Ok(Arc::new(HetznerCloud::new(&credentials.token)?)),
        }
    }
}

/// Labels that mark a server as owned by `fleet`.
pub fn fleet_labels(fleet: &FleetKey) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_FLEET_NAMESPACE.to_string(), fleet.namespace.clone()),
        (LABEL_FLEET_NAME.to_string(), fleet.name.clone()),
    ])
}

/// Cloud API label selector matching exactly the servers of `fleet`.
pub fn label_selector(fleet: &FleetKey) -> String {
    fleet_labels(fleet)
        .iter()
        .map(|(k, v)| format!("{k}=={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Whether `labels` carry the ownership labels of `fleet`.
pub fn is_owned_by<'a>(labels: impl IntoIterator<Item = (&'a String, &'a String)>, fleet: &FleetKey) -> bool {
    let wanted = fleet_labels(fleet);
    labels
        .into_iter()
        .filter(|(k, v)| wanted.get(*k) == Some(*v))
        .count()
        == wanted.len()
}

/// Returns the index encoded in `name` if it is a server of `fleet`.
pub fn fleet_index(fleet: &FleetKey, name: &str) -> Option<u32> {
    let rest = name.strip_prefix(&fleet.prefix())?.strip_prefix('-')?;
    if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    rest.parse().ok()
}

/// The lowest `count` free server names for `fleet`, given its current servers.
pub fn next_names(fleet: &FleetKey, existing: &[Instance], count: usize) -> Vec<String> {
    let taken: BTreeSet<u32> = existing.iter().filter_map(|i| fleet_index(fleet, &i.name)).collect();
    (0..)
        .filter(|i| !taken.contains(i))
        .take(count)
        .map(|i| format!("{}-{}", fleet.prefix(), i))
        .collect()
}

pub struct HetznerCloud {
    configuration: Configuration,
}

impl HetznerCloud {
    pub fn new(token: &str) -> Result<Self, CloudError> {
        if token.trim().is_empty() {
            return Err(CloudError::Credentials("empty hcloud token".to_string()));
        }
        let mut configuration = Configuration::new();
        configuration.bearer_access_token = Some(token.trim().to_string());
        Ok(Self { configuration })
    }
}

fn to_instance(server: &hcloud::models::Server) -> Instance {
    Instance {
        id: server.id.to_string(),
        name: server.name.clone(),
        created: DateTime::parse_from_rfc3339(&server.created)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
    }
}

#[async_trait]
impl CloudProvider for HetznerCloud {
    async fn list_instances(&self, fleet: &FleetKey) -> Result<Vec<Instance>, CloudError> {
        let selector = label_selector(fleet);
        let mut instances = vec![];
        let mut page = 1;
        loop {
            let servers = servers_api::list_servers(
                &self.configuration,
                ListServersParams {
                    label_selector: Some(selector.clone()),
                    page: Some(page),
                    per_page: Some(PAGE_SIZE),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| CloudError::Api(e.to_string()))?
            .servers;
            let last = servers.len() < PAGE_SIZE as usize;
            instances.extend(
                servers
                    .iter()
                    .filter(|s| is_owned_by(&s.labels, fleet))
                    .map(to_instance),
            );
            if last {
                break;
            }
            page += 1;
        }
        Ok(instances)
    }

    async fn create_instance(&self, params: &InstanceParams) -> Result<Instance, CloudError> {
        let request = CreateServerRequest {
            name: params.name.clone(),
            image: params.image.clone(),
            server_type: params.server_type.clone(),
            location: params.location.clone(),
            user_data: params.user_data.clone(),
            labels: Some(params.labels.clone().into_iter().collect()),
            ..Default::default()
        };
        let response = servers_api::create_server(
            &self.configuration,
            CreateServerParams {
                create_server_request: Some(request),
            },
        )
        .await
        .map_err(|e| CloudError::Api(e.to_string()))?;
        Ok(to_instance(&response.server))
    }

    async fn destroy_instance(&self, instance: &Instance) -> Result<(), CloudError> {
        let id = instance
            .id
            .parse::<i32>()
            .map_err(|_| CloudError::InvalidServer(instance.id.clone()))?;
        servers_api::delete_server(&self.configuration, DeleteServerParams { id })
            .await
            .map_err(|e| CloudError::Api(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(name: &str) -> Instance {
        Instance {
            id: "1".to_string(),
            name: name.to_string(),
            created: None,
        }
    }

    #[test]
    fn only_numeric_suffixes_belong_to_fleet() {
        let fleet = FleetKey::new("ns", "workers");
        assert_eq!(fleet_index(&fleet, "ns-workers-0"), Some(0));
        assert_eq!(fleet_index(&fleet, "ns-workers-12"), Some(12));
        assert_eq!(fleet_index(&fleet, "ns-workers-b-1"), None);
        assert_eq!(fleet_index(&fleet, "ns-workers-"), None);
        assert_eq!(fleet_index(&fleet, "ns-workers"), None);
        assert_eq!(fleet_index(&fleet, "other-workers-1"), None);
    }

    #[test]
    fn next_names_fill_gaps() {
        let fleet = FleetKey::new("ns", "workers");
        let existing = vec![instance("ns-workers-0"), instance("ns-workers-2")];
        assert_eq!(
            next_names(&fleet, &existing, 3),
            vec!["ns-workers-1", "ns-workers-3", "ns-workers-4"]
        );
    }

    #[test]
    fn ownership_does_not_depend_on_dashes_in_names() {
        let a = FleetKey::new("team-a", "workers");
        let b = FleetKey::new("team", "a-workers");
        assert_eq!(a.prefix(), b.prefix());
        assert_ne!(label_selector(&a), label_selector(&b));
        assert_eq!(
            label_selector(&a),
            "hcc.dev/fleet-name==workers,hcc.dev/fleet-namespace==team-a"
        );

        let labels = fleet_labels(&a);
        assert!(is_owned_by(&labels, &a));
        assert!(!is_owned_by(&labels, &b));
    }

    #[test]
    fn ownership_tolerates_extra_labels() {
        let fleet = FleetKey::new("ns", "workers");
        let mut labels = fleet_labels(&fleet);
        labels.insert("team".to_string(), "infra".to_string());
        assert!(is_owned_by(&labels, &fleet));
        labels.remove(LABEL_FLEET_NAME);
        assert!(!is_owned_by(&labels, &fleet));
    }

    #[tokio::test]
    async fn hetzner_rejects_ids_it_cannot_address() {
        let cloud = HetznerCloud::new("secret").unwrap();
        for id in ["abc", "99999999999"] {
            let server = Instance {
                id: id.to_string(),
                ..instance("ns-workers-0")
            };
            assert!(matches!(
                cloud.destroy_instance(&server).await,
                Err(CloudError::InvalidServer(_))
            ));
        }
    }

    #[test]
    fn hetzner_rejects_empty_token() {
        assert!(matches!(HetznerCloud::new("  "), Err(CloudError::Credentials(_))));
        assert!(HetznerCloud::new("secret").is_ok());
    }
}

use crate::cloud::CloudBackend;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod cloud;
pub mod conditions;
pub mod crd;
pub mod credentials;
pub mod fleet_reconciler;
pub mod fleet_state;
pub mod metrics;
pub mod node_configurer;
pub mod reconcile_error;
pub mod status;
pub mod store;

pub const TAINT_UNINITIALIZED: &str = "node.cloudprovider.kubernetes.io/uninitialized";
pub const PROVIDER_ID_PREFIX: &str = "hcloud://";

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct FleetConfig {
    pub enabled: bool,
    pub backend: CloudBackend,
    pub server_type: String,
    pub image: String,
    pub location: Option<String>,
    /// How long a new server may take to register its Node
    pub join_timeout_secs: u64,
    /// Periodic resync of every fleet
    pub resync_secs: u64,
    /// Requeue delay after a pass failed to persist status
    pub error_requeue_secs: u64,
    /// Destroy servers that never joined before scaling
    pub reap_unjoined: bool,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: CloudBackend::default(),
            server_type: "cx22".to_string(),
            image: "ubuntu-24.04".to_string(),
            location: None,
            join_timeout_secs: 600,
            resync_secs: 300,
            error_requeue_secs: 5,
            reap_unjoined: true,
        }
    }
}

impl FleetConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    pub fn resync(&self) -> Duration {
        Duration::from_secs(self.resync_secs)
    }

    pub fn error_requeue(&self) -> Duration {
        Duration::from_secs(self.error_requeue_secs)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: "0.0.0.0:9000".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct Config {
    pub fleet: FleetConfig,
    pub metrics: MetricsConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let config: Config = serde_yaml::from_str(
            r#"
fleet:
  serverType: cpx31
  location: nbg1
  reapUnjoined: false
metrics:
  enabled: false
"#,
        )
        .unwrap();
        assert_eq!(config.fleet.server_type, "cpx31");
        assert_eq!(config.fleet.location.as_deref(), Some("nbg1"));
        assert!(!config.fleet.reap_unjoined);
        assert_eq!(config.fleet.backend, CloudBackend::Hetzner);
        assert_eq!(config.fleet.image, "ubuntu-24.04");
        assert_eq!(config.fleet.join_timeout(), Duration::from_secs(600));
        assert!(!config.metrics.enabled);
        assert_eq!(config.metrics.address, "0.0.0.0:9000");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(serde_yaml::from_str::<Config>("fleet:\n  replicas: 3\n").is_err());
    }

    #[test]
    fn backend_is_named_in_camel_case() {
        let config: Config = serde_yaml::from_str("fleet:\n  backend: hetzner\n").unwrap();
        assert_eq!(config.fleet.backend, CloudBackend::Hetzner);
    }
}

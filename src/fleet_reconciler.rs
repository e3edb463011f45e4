// Reconciles MachineFleets: keeps the number of cloud servers registered as cluster nodes equal to
// .spec.replicas and reports the outcome through .status.
//
// A pass is level-triggered and carries nothing over from the previous one:
//  * mark the fleet Reconciling
//  * resolve credentials and list the fleet's servers (CloudProviderAPIFailure)
//  * destroy servers that never joined, if enabled (VMTerminationFailure)
//  * create missing servers one at a time, stopping at the first failure (VMCreationFailure),
//    then turn each created server into a node (VMConfigurationFailure). Servers that exist but
//    haven't joined count against the desired size, so the fleet never exceeds .spec.replicas
//    servers
//  * or destroy surplus joined servers, oldest first (VMTerminationFailure)
//  * write the joined count, Reconciling=False and the Degraded condition
//
// Machine failures only ever end up in the Degraded condition. The pass itself fails only when
// the fleet can't be read or its status can't be written, so the controller requeues it.

use crate::cloud::{fleet_labels, next_names, CloudConnector, CloudProvider, Instance, InstanceParams};
use crate::crd::{FleetKey, MachineFleet};
use crate::credentials::{CredentialStore, Credentials};
use crate::fleet_state::{NodeFleetState, ScaleAction};
use crate::metrics::Metrics;
use crate::node_configurer::NodeConfigurer;
use crate::reconcile_error::{ReasonCode, ReconcileError};
use crate::status::StatusManager;
use crate::store::{ResourceStore, StoreError};
use crate::FleetConfig;
use futures::Stream;
use kube::runtime::controller::Action;
use kube::runtime::{predicates, watcher, WatchStreamExt};
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

pub struct Data {
    pub store: Arc<dyn ResourceStore>,
    pub credentials: Arc<dyn CredentialStore>,
    pub connector: Arc<dyn CloudConnector>,
    pub nodes: Arc<dyn NodeConfigurer>,
    pub config: FleetConfig,
    pub metrics: Metrics,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("could not fetch MachineFleet: {0}")]
    Fetch(#[source] StoreError),
    #[error("could not persist MachineFleet status: {0}")]
    Persist(#[source] StoreError),
}

impl Error {
    #[must_use]
    pub fn metric_label(&self) -> String {
        match self {
            Error::Fetch(_) => "fetch".to_string(),
            Error::Persist(StoreError::Conflict(_)) => "conflict".to_string(),
            Error::Persist(_) => "persist".to_string(),
        }
    }
}

/// What a completed pass observed and recorded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PassReport {
    pub state: NodeFleetState,
    pub failures: BTreeMap<ReasonCode, usize>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PassOutcome {
    /// The fleet was deleted before or during the pass
    Gone,
    Done(PassReport),
}

/// Keeps only the fleet events that bump `.metadata.generation`. Status writes made by a pass
/// leave the generation alone, so they don't trigger the next pass; periodic passes come from the
/// resync requeue instead.
pub fn spec_changes<S>(fleets: S) -> impl Stream<Item = Result<MachineFleet, watcher::Error>> + Send
where
    S: Stream<Item = Result<MachineFleet, watcher::Error>> + Send + 'static,
{
    fleets.predicate_filter(predicates::generation)
}

#[instrument(skip(fleet, ctx), fields(fleet = %fleet.name_any()))]
pub async fn reconcile(fleet: Arc<MachineFleet>, ctx: Arc<Data>) -> Result<Action, Error> {
    let key = FleetKey::from(fleet.as_ref());
    let _measure = ctx.metrics.count_and_measure();
    match run_pass(&key, &ctx).await? {
        PassOutcome::Gone => Ok(Action::await_change()),
        PassOutcome::Done(report) => {
            for (reason, count) in report.failures {
                ctx.metrics.degradation(&key, reason, count);
            }
            Ok(Action::requeue(ctx.config.resync()))
        }
    }
}

pub fn error_policy(fleet: Arc<MachineFleet>, error: &Error, ctx: Arc<Data>) -> Action {
    let key = FleetKey::from(fleet.as_ref());
    warn!("reconcile of fleet {} failed: {}", key, error);
    ctx.metrics.reconcile_failure(&key, error);
    Action::requeue(ctx.config.error_requeue())
}

/// Runs one full pass for `key`.
pub async fn run_pass(key: &FleetKey, ctx: &Data) -> Result<PassOutcome, Error> {
    let fleet = match ctx.store.get(key).await {
        Ok((fleet, _)) => fleet,
        Err(StoreError::NotFound) => {
            debug!("fleet {} not found, nothing to do", key);
            return Ok(PassOutcome::Gone);
        }
        Err(e) => return Err(Error::Fetch(e)),
    };

    let mut status = StatusManager::new(ctx.store.clone(), key.clone());
    status.begin();
    if let Err(e) = status.mark_reconciling().await {
        warn!("could not mark fleet {} as reconciling: {}", key, e);
    }

    let desired = fleet.spec.replicas;
    let joined = match connect(key, &fleet, ctx).await {
        Ok((credentials, cloud)) => {
            let mut pass = Pass {
                key,
                fleet: &fleet,
                ctx,
                status: &mut status,
                credentials: &credentials,
                cloud: cloud.as_ref(),
            };
            pass.converge().await
        }
        Err(e) => {
            status.record_failure(e);
            fleet.joined_count()
        }
    };

    status.set_joined_count(joined);
    let failures = status.failure_counts();
    status.finish().await.map_err(Error::Persist)?;
    info!("fleet {} reconciled: desired={} joined={}", key, desired, joined);
    Ok(PassOutcome::Done(PassReport {
        state: NodeFleetState::new(desired, joined),
        failures,
    }))
}

async fn connect(
    key: &FleetKey,
    fleet: &MachineFleet,
    ctx: &Data,
) -> Result<(Credentials, Arc<dyn CloudProvider>), ReconcileError> {
    let credentials = ctx
        .credentials
        .credentials(&key.namespace, &fleet.spec.credentials_secret)
        .await
        .map_err(ReconcileError::cloud_api)?;
    let cloud = ctx
        .connector
        .connect(&credentials)
        .map_err(ReconcileError::cloud_api)?;
    Ok((credentials, cloud))
}

/// Surplus joined servers to destroy: oldest first, unknown creation time last, then by name.
pub fn select_for_removal<'a>(
    instances: &'a [Instance],
    joined: &BTreeSet<String>,
    count: usize,
) -> Vec<&'a Instance> {
    let mut candidates: Vec<&Instance> = instances.iter().filter(|i| joined.contains(&i.id)).collect();
    candidates.sort_by(|a, b| {
        (a.created.is_none(), a.created, &a.name).cmp(&(b.created.is_none(), b.created, &b.name))
    });
    candidates.truncate(count);
    candidates
}

/// How many servers a scale-out may create: the missing joined count, capped so the fleet's
/// servers, joined or not, never outnumber `desired`.
pub fn creation_budget(desired: u32, servers: usize, missing: u32) -> u32 {
    let room = (desired as usize).saturating_sub(servers);
    missing.min(u32::try_from(room).unwrap_or(u32::MAX))
}

struct Pass<'a> {
    key: &'a FleetKey,
    fleet: &'a MachineFleet,
    ctx: &'a Data,
    status: &'a mut StatusManager,
    credentials: &'a Credentials,
    cloud: &'a dyn CloudProvider,
}

impl Pass<'_> {
    /// Drives the fleet towards its desired size and returns the joined count to report.
    async fn converge(&mut self) -> u32 {
        let (mut instances, joined) = match self.observe().await {
            Ok(observed) => observed,
            Err(e) => {
                self.status.record_failure(e);
                return self.fleet.joined_count();
            }
        };

        if self.ctx.config.reap_unjoined {
            self.reap(&mut instances, &joined).await;
        }

        let mut state = NodeFleetState::new(self.fleet.spec.replicas, joined.len() as u32);
        debug!(
            "fleet {}: desired={} joined={} servers={}",
            self.key,
            state.desired,
            state.joined,
            instances.len()
        );
        match state.action() {
            ScaleAction::Out(count) => self.scale_out(&instances, count, &mut state).await,
            ScaleAction::In(count) => self.scale_in(&instances, &joined, count, &mut state).await,
            ScaleAction::Steady => debug!("fleet {} is at its desired size", self.key),
        }

        match self.observe().await {
            Ok((_, joined)) => joined.len() as u32,
            Err(e) => {
                warn!(
                    "fleet {}: could not re-observe joined servers, reporting tracked count {}: {}",
                    self.key, state.joined, e
                );
                state.joined
            }
        }
    }

    /// The fleet's servers and the ids of those registered as nodes.
    async fn observe(&self) -> Result<(Vec<Instance>, BTreeSet<String>), ReconcileError> {
        let instances = self
            .cloud
            .list_instances(self.key)
            .await
            .map_err(ReconcileError::cloud_api)?;
        let joined = self
            .ctx
            .nodes
            .joined(&instances)
            .await
            .map_err(ReconcileError::configuration)?;
        Ok((instances, joined))
    }

    /// Destroys servers left behind by earlier passes that never became nodes.
    async fn reap(&mut self, instances: &mut Vec<Instance>, joined: &BTreeSet<String>) {
        let stragglers: Vec<Instance> = instances.iter().filter(|i| !joined.contains(&i.id)).cloned().collect();
        for instance in stragglers {
            info!("fleet {}: destroying server {} which never joined", self.key, instance.name);
            match self.cloud.destroy_instance(&instance).await {
                Ok(()) => instances.retain(|i| i.id != instance.id),
                Err(e) => self
                    .status
                    .record_failure(ReconcileError::termination(format!("server {}: {}", instance.name, e))),
            }
        }
    }

    async fn scale_out(&mut self, existing: &[Instance], count: u32, state: &mut NodeFleetState) {
        let spec = &self.fleet.spec;
        let config = &self.ctx.config;
        let count = creation_budget(state.desired, existing.len(), count);
        if count == 0 {
            info!(
                "fleet {}: {} servers exist but only {} joined, waiting instead of creating more",
                self.key,
                existing.len(),
                state.joined
            );
            return;
        }
        let mut created = vec![];
        for name in next_names(self.key, existing, count as usize) {
            let params = InstanceParams {
                name,
                server_type: spec.server_type.clone().unwrap_or_else(|| config.server_type.clone()),
                image: spec.image.clone().unwrap_or_else(|| config.image.clone()),
                location: spec.location.clone().or_else(|| config.location.clone()),
                user_data: self.credentials.user_data.clone(),
                labels: fleet_labels(self.key),
            };
            info!("fleet {}: creating server {}", self.key, params.name);
            match self.cloud.create_instance(&params).await {
                Ok(instance) => created.push(instance),
                Err(e) => {
                    self.status
                        .record_failure(ReconcileError::creation(format!("server {}: {}", params.name, e)));
                    break;
                }
            }
        }

        for instance in &created {
            info!("fleet {}: configuring server {} ({})", self.key, instance.name, instance.id);
            match self.ctx.nodes.configure_node(instance, self.credentials).await {
                Ok(()) => state.machine_joined(),
                Err(e) => self
                    .status
                    .record_failure(ReconcileError::configuration(format!("server {}: {}", instance.name, e))),
            }
        }
    }

    async fn scale_in(
        &mut self,
        instances: &[Instance],
        joined: &BTreeSet<String>,
        count: u32,
        state: &mut NodeFleetState,
    ) {
        for instance in select_for_removal(instances, joined, count as usize) {
            info!("fleet {}: destroying surplus server {}", self.key, instance.name);
            match self.cloud.destroy_instance(instance).await {
                Ok(()) => state.machine_removed(),
                Err(e) => self
                    .status
                    .record_failure(ReconcileError::termination(format!("server {}: {}", instance.name, e))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{MachineFleetSpec, MachineFleetStatus};
    use chrono::{TimeZone, Utc};
    use futures::StreamExt;

    fn instance(id: &str, created: Option<i64>) -> Instance {
        Instance {
            id: id.to_string(),
            name: format!("ns-workers-{id}"),
            created: created.map(|s| Utc.timestamp_opt(s, 0).unwrap()),
        }
    }

    #[test]
    fn removal_prefers_oldest_joined() {
        let instances = vec![
            instance("1", Some(300)),
            instance("2", Some(100)),
            instance("3", None),
            instance("4", Some(50)),
            instance("5", Some(200)),
        ];
        let joined: BTreeSet<String> = ["1", "2", "3", "5"].iter().map(|s| s.to_string()).collect();
        let ids: Vec<_> = select_for_removal(&instances, &joined, 3)
            .iter()
            .map(|i| i.id.as_str())
            .collect();
        assert_eq!(ids, vec!["2", "5", "1"]);
    }

    #[test]
    fn removal_never_exceeds_joined() {
        let instances = vec![instance("1", None), instance("2", None)];
        let joined: BTreeSet<String> = ["2".to_string()].into_iter().collect();
        assert_eq!(select_for_removal(&instances, &joined, 5).len(), 1);
    }

    fn fleet(generation: i64, joined: u32) -> MachineFleet {
        let mut fleet = MachineFleet::new(
            "workers",
            MachineFleetSpec {
                replicas: 3,
                credentials_secret: "hcloud".to_string(),
                server_type: None,
                image: None,
                location: None,
            },
        );
        fleet.metadata.namespace = Some("ns".to_string());
        fleet.metadata.generation = Some(generation);
        fleet.status = Some(MachineFleetStatus {
            joined_count: joined,
            ..Default::default()
        });
        fleet
    }

    #[tokio::test]
    async fn status_writes_do_not_trigger_a_pass() {
        let events = futures::stream::iter(vec![
            Ok(fleet(1, 0)),
            Ok(fleet(1, 1)),
            Ok(fleet(1, 2)),
            Ok(fleet(2, 2)),
            Ok(fleet(2, 3)),
        ]);
        let passes: Vec<_> = spec_changes(events)
            .map(|f| f.unwrap().metadata.generation)
            .collect()
            .await;
        assert_eq!(passes, vec![Some(1), Some(2)]);
    }

    #[test]
    fn unjoined_servers_count_against_creation() {
        assert_eq!(creation_budget(3, 0, 3), 3);
        assert_eq!(creation_budget(3, 2, 3), 1);
        assert_eq!(creation_budget(1, 1, 1), 0);
        assert_eq!(creation_budget(2, 5, 2), 0);
    }

    #[test]
    fn conflict_has_its_own_metric_label() {
        assert_eq!(Error::Persist(StoreError::Conflict("7".to_string())).metric_label(), "conflict");
        assert_eq!(Error::Persist(StoreError::NotFound).metric_label(), "persist");
        assert_eq!(Error::Fetch(StoreError::NotFound).metric_label(), "fetch");
    }
}

// Per-pass status bookkeeping for a MachineFleet.
// Failures are accumulated while a pass runs and folded into a single Degraded condition at the
// end. Writes are read-before-write against the store and conditional on the fetched version; a
// stale version is returned to the caller, never retried here. A fleet deleted before or during
// the write is not an error.

use crate::conditions::Condition;
use crate::crd::{FleetKey, MachineFleetStatus};
use crate::reconcile_error::{ReasonCode, ReconcileError};
use crate::store::{ResourceStore, StoreError};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct StatusManager {
    store: Arc<dyn ResourceStore>,
    key: FleetKey,
    joined_count: u32,
    /// reason code -> messages, in recording order
    failures: BTreeMap<ReasonCode, Vec<String>>,
}

impl StatusManager {
    pub fn new(store: Arc<dyn ResourceStore>, key: FleetKey) -> Self {
        Self {
            store,
            key,
            joined_count: 0,
            failures: BTreeMap::new(),
        }
    }

    /// Starts a new pass.
    pub fn begin(&mut self) {
        self.failures.clear();
    }

    pub fn record_failure(&mut self, error: ReconcileError) {
        warn!("fleet {} degraded: {}", self.key, error);
        self.failures
            .entry(error.reason())
            .or_default()
            .push(error.message());
    }

    pub fn set_joined_count(&mut self, joined: u32) {
        self.joined_count = joined;
    }

    pub fn joined_count(&self) -> u32 {
        self.joined_count
    }

    /// Number of recorded failures per reason code.
    pub fn failure_counts(&self) -> BTreeMap<ReasonCode, usize> {
        self.failures.iter().map(|(r, m)| (*r, m.len())).collect()
    }

    /// Folds the recorded failures into the Degraded condition.
    ///
    /// Reason codes come out in lexicographic order and messages in recording order. The reason
    /// lists one code per failure, so a code repeats when it failed several times.
    pub fn derive_degraded(&self) -> Condition {
        if self.failures.is_empty() {
            return Condition::healthy();
        }
        let mut reasons = vec![];
        let mut segments = vec![];
        for (reason, messages) in &self.failures {
            for message in messages {
                reasons.push(reason.as_str());
                segments.push(format!("{reason}: {message}"));
            }
        }
        Condition::degraded(&reasons.join(","), &segments.join(","))
    }

    /// Best-effort `Reconciling=True` marker at the start of a pass. Only the marker is written.
    pub async fn mark_reconciling(&self) -> Result<(), StoreError> {
        self.write(|status| status.conditions.set(Condition::reconciling(true)))
            .await
    }

    /// Writes the observed joined count and the two conditions, Reconciling first.
    pub async fn persist(
        &self,
        joined_count: u32,
        reconciling: Condition,
        degraded: Condition,
    ) -> Result<(), StoreError> {
        self.write(move |status| {
            status.joined_count = joined_count;
            status.conditions.set(reconciling);
            status.conditions.set(degraded);
        })
        .await
    }

    /// End of pass: `Reconciling=False` plus the derived Degraded condition.
    pub async fn finish(&self) -> Result<(), StoreError> {
        self.persist(self.joined_count, Condition::reconciling(false), self.derive_degraded())
            .await
    }

    async fn write(&self, apply: impl FnOnce(&mut MachineFleetStatus)) -> Result<(), StoreError> {
        let (fleet, version) = match self.store.get(&self.key).await {
            Ok(found) => found,
            Err(StoreError::NotFound) => {
                debug!("fleet {} is gone, skipping status update", self.key);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let mut status = fleet.status.unwrap_or_default();
        apply(&mut status);
        match self.store.update_status(&self.key, &version, &status).await {
            Ok(()) => {}
            Err(StoreError::NotFound) => {
                debug!("fleet {} was deleted while updating its status", self.key);
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        info!(
            "updated status of fleet {}: joined={} conditions={:?}",
            self.key, status.joined_count, status.conditions
        );
        Ok(())
    }
}

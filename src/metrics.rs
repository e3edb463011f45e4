use crate::crd::FleetKey;
use crate::reconcile_error::ReasonCode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::{Registry, Unit};
use tokio::time::Instant;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub fleet: String,
    pub error: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReasonLabels {
    pub fleet: String,
    pub reason: String,
}

/// Reconcile metrics. Created once per process and registered into a caller-owned `Registry`.
#[derive(Clone)]
pub struct Metrics {
    pub runs: Counter,
    pub failures: Family<ErrorLabels, Counter>,
    pub degradations: Family<ReasonLabels, Counter>,
    pub duration: Histogram,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            runs: Counter::default(),
            failures: Family::<ErrorLabels, Counter>::default(),
            degradations: Family::<ReasonLabels, Counter>::default(),
            duration: Histogram::new([0.1, 0.5, 1., 5., 15., 60., 300., 900.].into_iter()),
        }
    }
}

impl Metrics {
    /// Register metrics to start tracking them.
    pub fn register(self, r: &mut Registry) -> Self {
        r.register_with_unit("duration", "reconcile duration", Unit::Seconds, self.duration.clone());
        r.register("failures", "reconcile passes that failed to persist status", self.failures.clone());
        r.register("degradations", "machine failures recorded in the Degraded condition", self.degradations.clone());
        r.register("runs", "reconcile passes", self.runs.clone());
        self
    }

    pub fn reconcile_failure(&self, fleet: &FleetKey, error: &crate::fleet_reconciler::Error) {
        self.failures
            .get_or_create(&ErrorLabels {
                fleet: fleet.to_string(),
                error: error.metric_label(),
            })
            .inc();
    }

    pub fn degradation(&self, fleet: &FleetKey, reason: ReasonCode, count: usize) {
        self.degradations
            .get_or_create(&ReasonLabels {
                fleet: fleet.to_string(),
                reason: reason.to_string(),
            })
            .inc_by(count as u64);
    }

    pub fn count_and_measure(&self) -> ReconcileMeasurer {
        self.runs.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.duration.clone(),
        }
    }
}

/// Records the elapsed time into the duration histogram when dropped.
pub struct ReconcileMeasurer {
    start: Instant,
    metric: Histogram,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric.observe(duration);
    }
}

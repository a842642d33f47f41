use crate::error::Error;

use opentelemetry::trace::TraceId;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::exemplar::HistogramWithExemplars;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::{Registry, Unit};
use tokio::time::Instant;

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct ControllerLabel {
    pub controller: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
pub struct ErrorLabels {
    pub controller: String,
    pub error: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct StatusLabel {
    pub status: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct OutcomeLabel {
    pub outcome: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct TraceLabel {
    pub id: String,
}

impl TryFrom<&TraceId> for TraceLabel {
    type Error = Error;

    fn try_from(id: &TraceId) -> Result<TraceLabel, Self::Error> {
        if std::matches!(id, &TraceId::INVALID) {
            Err(Error::InvalidTraceId)
        } else {
            Ok(Self { id: id.to_string() })
        }
    }
}

#[derive(Clone)]
pub struct Metrics {
    pub passes: Family<ControllerLabel, Counter>,
    pub failures: Family<ErrorLabels, Counter>,
    pub pass_duration: HistogramWithExemplars<TraceLabel>,
    pub namespaces: Family<StatusLabel, Gauge>,
    pub deletions: Counter,
    pub delete_stuck: Counter,
    pub notifications: Family<OutcomeLabel, Counter>,
    pub leader: Family<ControllerLabel, Gauge>,
}

impl Metrics {
    /// Register all manager metrics under the `ns_manager` prefix.
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            passes: Family::default(),
            failures: Family::default(),
            pass_duration: HistogramWithExemplars::new([0.1, 0.5, 1., 5., 15., 60.].into_iter()),
            namespaces: Family::default(),
            deletions: Counter::default(),
            delete_stuck: Counter::default(),
            notifications: Family::default(),
            leader: Family::default(),
        };
        let sub = registry.sub_registry_with_prefix("ns_manager");
        sub.register("passes", "reconciliation passes", metrics.passes.clone());
        sub.register("pass_failures", "failed passes or units", metrics.failures.clone());
        sub.register_with_unit(
            "pass_duration",
            "reconciliation pass duration",
            Unit::Seconds,
            metrics.pass_duration.clone(),
        );
        sub.register(
            "namespaces",
            "watched namespaces by status",
            metrics.namespaces.clone(),
        );
        sub.register("deletions", "namespace deletions issued", metrics.deletions.clone());
        sub.register(
            "delete_stuck",
            "namespaces that refused to terminate",
            metrics.delete_stuck.clone(),
        );
        sub.register(
            "notifications",
            "owner notifications by outcome",
            metrics.notifications.clone(),
        );
        sub.register(
            "leader",
            "whether this replica leads the given controller",
            metrics.leader.clone(),
        );
        metrics
    }

    pub fn pass_started(&self, controller: &str, trace_id: &TraceId) -> PassMeasurer {
        self.passes
            .get_or_create(&ControllerLabel {
                controller: controller.to_string(),
            })
            .inc();
        PassMeasurer {
            start: Instant::now(),
            labels: trace_id.try_into().ok(),
            metric: self.pass_duration.clone(),
        }
    }

    pub fn failure_inc(&self, controller: &str, error: &Error) {
        self.failures
            .get_or_create(&ErrorLabels {
                controller: controller.to_string(),
                error: error.metric_label(),
            })
            .inc();
    }

    pub fn leader_set(&self, controller: &str, is_leader: bool) {
        self.leader
            .get_or_create(&ControllerLabel {
                controller: controller.to_string(),
            })
            .set(is_leader as i64);
    }

    pub fn namespaces_set(&self, status: &str, count: i64) {
        self.namespaces
            .get_or_create(&StatusLabel {
                status: status.to_string(),
            })
            .set(count);
    }

    pub fn notification_inc(&self, outcome: &str) {
        self.notifications
            .get_or_create(&OutcomeLabel {
                outcome: outcome.to_string(),
            })
            .inc();
    }
}

/// Pass duration measurer; relies on Drop so early returns and `?`
/// exits are observed too.
pub struct PassMeasurer {
    start: Instant,
    labels: Option<TraceLabel>,
    metric: HistogramWithExemplars<TraceLabel>,
}

impl Drop for PassMeasurer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        let labels = self.labels.take();
        self.metric.observe(duration, labels);
    }
}

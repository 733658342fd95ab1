use crate::controller::ControllerId;

use polman_dataplane::metrics::DataplaneMetrics;

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue, LabelValueEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;

/// Everything the agent exposes on `/metrics`.
///
/// Built once at startup; the registry is frozen behind an `Arc` afterwards
/// and the handles are shared into the controllers and the dataplane.
#[derive(Clone)]
pub struct Metrics {
    pub registry: Arc<Registry>,
    pub controllers: HashMap<ControllerId, Arc<ControllerMetrics>>,
    pub cluster: Arc<ClusterMetrics>,
    pub dataplane: Arc<DataplaneMetrics>,
}

impl Metrics {
    pub fn new(mut registry: Registry, controller_names: &[&'static str]) -> Self {
        let controllers = controller_names
            .iter()
            .map(|&id| (id, Arc::new(ControllerMetrics::new(id, &mut registry))))
            .collect::<HashMap<ControllerId, Arc<ControllerMetrics>>>();
        let cluster = Arc::new(ClusterMetrics::new(&mut registry));
        let dataplane = Arc::new(DataplaneMetrics::new(&mut registry));

        Self {
            registry: Arc::new(registry),
            controllers,
            cluster,
            dataplane,
        }
    }
}

/// Cluster-wide metrics not owned by a single controller.
#[derive(Clone)]
pub struct ClusterMetrics {
    pub num_policies: Gauge,
    pub pod_event_count: Family<EventLabels, Counter>,
}

impl ClusterMetrics {
    fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            num_policies: Gauge::default(),
            pod_event_count: Family::default(),
        };
        registry.register(
            "num_policies",
            "Number of network policies currently installed",
            metrics.num_policies.clone(),
        );
        registry.register(
            "pod_event_count",
            "Pod events processed, by operation",
            metrics.pod_event_count.clone(),
        );
        metrics
    }

    pub fn pod_event_inc(&self, operation: EventOp) {
        self.pod_event_count
            .get_or_create(&EventLabels { operation })
            .inc();
    }
}

/// Per-controller reconciliation metrics.
#[derive(Clone)]
pub struct ControllerMetrics {
    controller: String,
    exec_time: Family<OpLabels, Histogram, fn() -> Histogram>,
    reconcile_failures: Counter,
    watch_operations_failed: Counter,
    ready: Gauge,
}

fn exec_time_histogram() -> Histogram {
    Histogram::new(exponential_buckets(0.5, 2.0, 14))
}

impl ControllerMetrics {
    fn new(controller: &str, registry: &mut Registry) -> Self {
        let metrics = Self {
            controller: controller.to_string(),
            exec_time: Family::new_with_constructor(exec_time_histogram),
            reconcile_failures: Counter::default(),
            watch_operations_failed: Counter::default(),
            ready: Gauge::default(),
        };

        registry.register(
            format!("{controller}_exec_time"),
            format!("Milliseconds spent reconciling one {controller} event, by operation"),
            metrics.exec_time.clone(),
        );
        registry.register(
            format!("{controller}_reconcile_failures"),
            "Number of errors that occurred during reconcile operations",
            metrics.reconcile_failures.clone(),
        );
        registry.register(
            format!("{controller}_watch_operations_failed"),
            "Total number of watch operations that failed",
            metrics.watch_operations_failed.clone(),
        );
        registry.register(
            format!("{controller}_ready"),
            "1 when the controller is ready to reconcile resources, 0 otherwise",
            metrics.ready.clone(),
        );
        metrics
    }

    pub fn observe_exec(&self, operation: Operation, had_error: bool, elapsed: Duration) {
        self.exec_time
            .get_or_create(&OpLabels {
                operation,
                had_error,
            })
            .observe(elapsed.as_secs_f64() * 1000.0);
    }

    pub fn reconcile_failure_inc(&self) {
        self.reconcile_failures.inc();
    }

    pub fn watch_operations_failed_inc(&self) {
        self.watch_operations_failed.inc();
    }

    pub fn ready_set(&self, status: i64) {
        self.ready.set(status);
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OpLabels {
    pub operation: Operation,
    pub had_error: bool,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl EncodeLabelValue for Operation {
    fn encode(&self, encoder: &mut LabelValueEncoder<'_>) -> std::fmt::Result {
        encoder.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EventLabels {
    pub operation: EventOp,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum EventOp {
    Create,
    Update,
    Delete,
    UpdateWithEmptyIp,
}

impl EventOp {
    pub fn as_str(self) -> &'static str {
        match self {
            EventOp::Create => "create",
            EventOp::Update => "update",
            EventOp::Delete => "delete",
            EventOp::UpdateWithEmptyIp => "update-with-empty-ip",
        }
    }
}

impl EncodeLabelValue for EventOp {
    fn encode(&self, encoder: &mut LabelValueEncoder<'_>) -> std::fmt::Result {
        encoder.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposition_carries_the_full_surface() {
        let metrics = Metrics::new(Registry::default(), &["pod", "namespace", "policy"]);

        metrics.cluster.num_policies.set(2);
        metrics.cluster.pod_event_inc(EventOp::UpdateWithEmptyIp);
        metrics
            .controllers
            .get("pod")
            .unwrap()
            .observe_exec(Operation::Create, false, Duration::from_millis(3));
        metrics.dataplane.num_ipsets.set(5);

        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &metrics.registry).unwrap();

        assert!(buffer.contains("num_policies 2"));
        assert!(buffer.contains("num_ipsets 5"));
        assert!(buffer.contains("num_ipset_entries"));
        assert!(buffer.contains("num_iptables_rules"));
        assert!(buffer.contains("add_policy_exec_time"));
        assert!(buffer.contains("add_iptables_rule_exec_time"));
        assert!(buffer.contains("add_ipset_exec_time"));
        assert!(buffer.contains("pod_exec_time"));
        assert!(buffer.contains("namespace_exec_time"));
        assert!(buffer.contains("policy_exec_time"));
        assert!(buffer.contains(r#"operation="update-with-empty-ip""#));
        assert!(buffer.contains(r#"operation="create""#));
        assert!(buffer.contains(r#"had_error="false""#));
    }

    #[test]
    fn operation_labels_are_lowercase() {
        assert_eq!(Operation::Create.as_str(), "create");
        assert_eq!(Operation::Update.as_str(), "update");
        assert_eq!(Operation::Delete.as_str(), "delete");
        assert_eq!(EventOp::UpdateWithEmptyIp.as_str(), "update-with-empty-ip");
    }
}

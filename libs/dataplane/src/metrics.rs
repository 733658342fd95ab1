use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;

/// Labels of the per-set inventory gauge.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SetLabels {
    pub set_name: String,
    pub set_hash: String,
}

/// Gauges and timers moved by the set and filter managers.
///
/// Exec times are recorded in milliseconds; the buckets cover sub-millisecond
/// cache hits up to multi-second kernel stalls.
#[derive(Clone)]
pub struct DataplaneMetrics {
    pub num_ipsets: Gauge,
    pub num_ipset_entries: Gauge,
    pub ipset_counts: Family<SetLabels, Gauge>,
    pub num_iptables_rules: Gauge,
    pub add_ipset_exec_time: Histogram,
    pub add_iptables_rule_exec_time: Histogram,
    pub add_policy_exec_time: Histogram,
}

fn exec_time_histogram() -> Histogram {
    Histogram::new(exponential_buckets(0.5, 2.0, 14))
}

impl DataplaneMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self::unregistered();

        registry.register(
            "num_ipsets",
            "Number of kernel named sets owned by the agent",
            metrics.num_ipsets.clone(),
        );
        registry.register(
            "num_ipset_entries",
            "Total number of elements across all owned named sets",
            metrics.num_ipset_entries.clone(),
        );
        registry.register(
            "ipset_counts",
            "Number of elements per owned named set",
            metrics.ipset_counts.clone(),
        );
        registry.register(
            "num_iptables_rules",
            "Number of filter rule entries installed by the agent",
            metrics.num_iptables_rules.clone(),
        );
        registry.register(
            "add_ipset_exec_time",
            "Milliseconds spent in a single ipset invocation",
            metrics.add_ipset_exec_time.clone(),
        );
        registry.register(
            "add_iptables_rule_exec_time",
            "Milliseconds spent installing a single filter rule entry",
            metrics.add_iptables_rule_exec_time.clone(),
        );
        registry.register(
            "add_policy_exec_time",
            "Milliseconds spent installing all rule entries of one policy",
            metrics.add_policy_exec_time.clone(),
        );

        metrics
    }

    /// Metrics wired to no registry; used by tests.
    pub fn unregistered() -> Self {
        Self {
            num_ipsets: Gauge::default(),
            num_ipset_entries: Gauge::default(),
            ipset_counts: Family::default(),
            num_iptables_rules: Gauge::default(),
            add_ipset_exec_time: exec_time_histogram(),
            add_iptables_rule_exec_time: exec_time_histogram(),
            add_policy_exec_time: exec_time_histogram(),
        }
    }
}

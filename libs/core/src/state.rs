//! Node-local shadow state.
//!
//! One [`NodeState`] exists per process, behind the process-wide mutex. It
//! owns both dataplane managers and the shadow maps the controllers diff
//! incoming events against; controllers never talk to the kernel except
//! through it.

use crate::error::{Error, Result};
use crate::snapshot::Snapshot;

use polman_dataplane::exec::CommandRunner;
use polman_dataplane::ipset::{SetKind, SetManager};
use polman_dataplane::iptables::FilterManager;
use polman_dataplane::metrics::DataplaneMetrics;
use polman_dataplane::names::{ALL_NAMESPACES, ns_set};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use tracing::info;

/// A named container port of a pod, feeding a `namedport:` set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedPort {
    pub name: String,
    pub protocol: String,
    pub port: i32,
}

/// Shadow of one mirrored pod.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodRecord {
    pub uid: String,
    pub ip: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub named_ports: Vec<NamedPort>,
    pub phase: String,
    pub host_network: bool,
    pub resource_version: u64,
}

impl PodRecord {
    /// Only valid pods are mirrored into the dataplane.
    pub fn is_valid(&self) -> bool {
        !self.host_network
            && !self.ip.is_empty()
            && matches!(self.phase.as_str(), "Running" | "Pending")
    }
}

/// Shadow of one observed namespace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamespaceRecord {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

/// Per-policy bookkeeping: every set name the policy holds a reference on,
/// and the policy-scoped CIDR sets it created.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyRecord {
    pub sets: Vec<String>,
    pub named_ports: Vec<String>,
    pub lists: Vec<String>,
    pub cidr_sets: Vec<String>,
}

pub struct NodeState {
    pub node_name: String,
    pub sets: SetManager,
    pub filters: FilterManager,
    pub ns_map: HashMap<String, NamespaceRecord>,
    pub pod_map: HashMap<String, PodRecord>,
    pub policy_map: HashMap<String, PolicyRecord>,
}

impl NodeState {
    pub fn new(
        node_name: impl Into<String>,
        runner: Arc<dyn CommandRunner>,
        metrics: Arc<DataplaneMetrics>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            sets: SetManager::new(runner.clone(), metrics.clone()),
            filters: FilterManager::new(runner, metrics),
            ns_map: HashMap::new(),
            pod_map: HashMap::new(),
            policy_map: HashMap::new(),
        }
    }

    /// Bring the kernel to a clean baseline at process start: drop leftovers
    /// of a previous agent, pin the coordinator-owned sets and build the
    /// chain topology.
    pub fn bootstrap(&mut self) -> Result<()> {
        info!(msg = "sweeping dataplane leftovers and rebuilding baseline");
        self.filters
            .reset()
            .map_err(|e| Error::FilterError("failed to reset owned chains".to_string(), e))?;
        self.sets
            .destroy_all_prefixed()
            .map_err(|e| Error::IpsetError("failed to sweep prefixed sets".to_string(), e))?;

        self.sets
            .add_reference(ALL_NAMESPACES, SetKind::SetList)
            .map_err(|e| {
                Error::IpsetError("failed to create all-namespaces list".to_string(), e)
            })?;
        // the kube-system exception chain matches on this set from day one
        self.ensure_namespace_set("kube-system")
            .map_err(|e| {
                Error::IpsetError("failed to create kube-system exception set".to_string(), e)
            })?;

        self.filters
            .init()
            .map_err(|e| Error::FilterError("failed to build chain topology".to_string(), e))
    }

    /// Make sure `ns-<namespace>` exists and is a member of the
    /// all-namespaces list. Pod events may arrive before the namespace event,
    /// so both reconcilers go through here.
    ///
    /// The set is pinned with a reference: it is a member of the
    /// all-namespaces list, so emptiness must never destroy it. The
    /// namespace reconciler releases the pin when the namespace goes away.
    pub fn ensure_namespace_set(
        &mut self,
        namespace: &str,
    ) -> std::result::Result<String, polman_dataplane::ipset::error::IpsetError> {
        let name = ns_set(namespace);
        if !self.sets.sets().contains_key(&name) {
            self.sets.add_reference(&name, SetKind::NetHash)?;
        }
        self.sets.add_to_list(ALL_NAMESPACES, &name)?;
        Ok(name)
    }

    /// Point-in-time copy of the shadow state for the debug endpoint.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            node_name: self.node_name.clone(),
            ns_map: self.ns_map.clone(),
            pod_map: self.pod_map.clone(),
            list_map: self.sets.lists().clone(),
            set_map: self.sets.sets().clone(),
        }
    }
}

/// Resource versions are opaque per the API contract, but within a single
/// watch they parse as u64 and are monotonic; the comparator is used to drop
/// out-of-order pod updates. Unparseable or absent versions order first.
pub fn resource_version(meta: &ObjectMeta) -> u64 {
    meta.resource_version
        .as_deref()
        .and_then(|rv| rv.parse().ok())
        .unwrap_or(0)
}

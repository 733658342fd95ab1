use polman_core::controller::DEFAULT_RESYNC_INTERVAL;
use polman_core::controller::context::Context;
use polman_core::error::{Error, Result};
use polman_core::metrics::{EventOp, Operation};
use polman_core::state::{NamedPort, NodeState, PodRecord, resource_version};

use polman_dataplane::ipset::SetKind;
use polman_dataplane::names::{namedport_set, ns_set, pod_label_set};

use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use tracing::{debug, instrument, trace};

#[instrument(skip(ctx, pod))]
pub async fn reconcile_pod(pod: Arc<Pod>, ctx: Arc<Context<Pod>>) -> Result<Action> {
    // safe unwrap: Pod is namespace scoped
    let namespace = pod.namespace().unwrap();
    let name = pod.name_any();
    let key = format!("{namespace}/{name}");

    // reconcile against the cache, not the event payload
    let desired = ctx
        .pod_store
        .get(&ObjectRef::from(pod.as_ref()))
        .map(|cached| record_from(&cached));

    let start = Instant::now();
    let mut node = ctx.node.lock().await;
    let operation = if desired.is_some() {
        if node.pod_map.contains_key(&key) {
            Operation::Update
        } else {
            Operation::Create
        }
    } else {
        Operation::Delete
    };
    let result = sync_pod(&mut node, &key, desired);
    drop(node);

    ctx.metrics
        .observe_exec(operation, result.is_err(), start.elapsed());
    if let Ok(Some(event)) = &result {
        ctx.cluster_metrics.pod_event_inc(*event);
    }
    result?;
    Ok(Action::requeue(DEFAULT_RESYNC_INTERVAL))
}

/// Extract the shadow record of a pod object.
pub fn record_from(pod: &Pod) -> PodRecord {
    let spec = pod.spec.as_ref();
    let status = pod.status.as_ref();

    let named_ports = spec
        .map(|spec| {
            spec.containers
                .iter()
                .flat_map(|container| container.ports.as_deref().unwrap_or_default())
                .filter_map(|port| {
                    port.name.as_ref().map(|name| NamedPort {
                        name: name.clone(),
                        protocol: port.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
                        port: port.container_port,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    PodRecord {
        uid: pod.metadata.uid.clone().unwrap_or_default(),
        ip: status
            .and_then(|status| status.pod_ip.clone())
            .unwrap_or_default(),
        namespace: pod.namespace().unwrap_or_default(),
        labels: pod.metadata.labels.clone().unwrap_or_default(),
        named_ports,
        phase: status
            .and_then(|status| status.phase.clone())
            .unwrap_or_default(),
        host_network: spec.and_then(|spec| spec.host_network).unwrap_or(false),
        resource_version: resource_version(&pod.metadata),
    }
}

/// Reconcile one pod key against the shadow map. Returns the event that was
/// effectively processed, if any.
pub fn sync_pod(
    node: &mut NodeState,
    key: &str,
    desired: Option<PodRecord>,
) -> Result<Option<EventOp>> {
    let current = node.pod_map.get(key).cloned();
    match (current, desired) {
        (None, Some(new)) => {
            if new.host_network {
                trace!(msg = "ignoring host-network pod", %key);
                return Ok(None);
            }
            if !new.is_valid() {
                trace!(msg = "ignoring pod without mirrorable state", %key);
                return Ok(None);
            }
            add_pod(node, key, new)?;
            Ok(Some(EventOp::Create))
        }
        (Some(old), Some(new)) => {
            if new.resource_version < old.resource_version {
                debug!(msg = "dropping out-of-order pod update", %key);
                return Ok(None);
            }
            if new.ip.is_empty() {
                delete_pod(node, key, &old)?;
                return Ok(Some(EventOp::UpdateWithEmptyIp));
            }
            if new.host_network || !new.is_valid() {
                delete_pod(node, key, &old)?;
                return Ok(Some(EventOp::Delete));
            }
            if old.ip != new.ip || old.uid != new.uid {
                // full remove then full add, so a reused IP ends up owned
                // by the newer pod
                delete_pod(node, key, &old)?;
                add_pod(node, key, new)?;
                return Ok(Some(EventOp::Update));
            }
            update_pod(node, key, &old, new)?;
            Ok(Some(EventOp::Update))
        }
        (Some(old), None) => {
            delete_pod(node, key, &old)?;
            Ok(Some(EventOp::Delete))
        }
        (None, None) => Ok(None),
    }
}

fn add_pod(node: &mut NodeState, key: &str, record: PodRecord) -> Result<()> {
    debug!(msg = "mirroring pod", %key, ip = %record.ip);
    let ns_set_name = node
        .ensure_namespace_set(&record.namespace)
        .map_err(|e| Error::IpsetError(format!("failed to ensure namespace set for {key}"), e))?;
    node.sets
        .add_to_set(&ns_set_name, &record.ip, SetKind::NetHash, &record.uid)
        .map_err(|e| Error::IpsetError(format!("failed to add {key} to namespace set"), e))?;

    for (label_key, label_value) in &record.labels {
        node.sets
            .add_to_set(label_key, &record.ip, SetKind::NetHash, &record.uid)
            .map_err(|e| {
                Error::IpsetError(format!("failed to add {key} to label set {label_key}"), e)
            })?;
        let value_set = pod_label_set(label_key, label_value);
        node.sets
            .add_to_set(&value_set, &record.ip, SetKind::NetHash, &record.uid)
            .map_err(|e| {
                Error::IpsetError(format!("failed to add {key} to label set {value_set}"), e)
            })?;
    }

    for port in &record.named_ports {
        let set = namedport_set(&port.name);
        node.sets
            .add_to_set(
                &set,
                &port_element(&record.ip, port),
                SetKind::IpPortHash,
                &record.uid,
            )
            .map_err(|e| {
                Error::IpsetError(format!("failed to add {key} to named port set {set}"), e)
            })?;
    }

    node.pod_map.insert(key.to_string(), record);
    Ok(())
}

/// Tear down a pod's mirrored elements in reverse creation order. Deletes
/// guarded by the pod UID lose against a newer owner of the same IP.
fn delete_pod(node: &mut NodeState, key: &str, old: &PodRecord) -> Result<()> {
    debug!(msg = "unmirroring pod", %key, ip = %old.ip);
    for port in old.named_ports.iter().rev() {
        let set = namedport_set(&port.name);
        node.sets
            .remove_from_set(&set, &port_element(&old.ip, port), &old.uid)
            .map_err(|e| {
                Error::IpsetError(format!("failed to remove {key} from named port set {set}"), e)
            })?;
    }
    for (label_key, label_value) in old.labels.iter().rev() {
        let value_set = pod_label_set(label_key, label_value);
        node.sets
            .remove_from_set(&value_set, &old.ip, &old.uid)
            .map_err(|e| {
                Error::IpsetError(format!("failed to remove {key} from label set {value_set}"), e)
            })?;
        node.sets
            .remove_from_set(label_key, &old.ip, &old.uid)
            .map_err(|e| {
                Error::IpsetError(format!("failed to remove {key} from label set {label_key}"), e)
            })?;
    }
    node.sets
        .remove_from_set(&ns_set(&old.namespace), &old.ip, &old.uid)
        .map_err(|e| {
            Error::IpsetError(format!("failed to remove {key} from namespace set"), e)
        })?;
    node.pod_map.remove(key);
    Ok(())
}

/// In-place update for an unchanged IP and UID: diff labels and named ports.
fn update_pod(node: &mut NodeState, key: &str, old: &PodRecord, new: PodRecord) -> Result<()> {
    for (label_key, label_value) in &old.labels {
        if new.labels.get(label_key) == Some(label_value) {
            continue;
        }
        let value_set = pod_label_set(label_key, label_value);
        node.sets
            .remove_from_set(&value_set, &old.ip, &old.uid)
            .map_err(|e| {
                Error::IpsetError(format!("failed to remove {key} from label set {value_set}"), e)
            })?;
        if !new.labels.contains_key(label_key) {
            node.sets
                .remove_from_set(label_key, &old.ip, &old.uid)
                .map_err(|e| {
                    Error::IpsetError(
                        format!("failed to remove {key} from label set {label_key}"),
                        e,
                    )
                })?;
        }
    }
    for (label_key, label_value) in &new.labels {
        if old.labels.get(label_key) == Some(label_value) {
            continue;
        }
        node.sets
            .add_to_set(label_key, &new.ip, SetKind::NetHash, &new.uid)
            .map_err(|e| {
                Error::IpsetError(format!("failed to add {key} to label set {label_key}"), e)
            })?;
        let value_set = pod_label_set(label_key, label_value);
        node.sets
            .add_to_set(&value_set, &new.ip, SetKind::NetHash, &new.uid)
            .map_err(|e| {
                Error::IpsetError(format!("failed to add {key} to label set {value_set}"), e)
            })?;
    }

    for port in &old.named_ports {
        if new.named_ports.contains(port) {
            continue;
        }
        let set = namedport_set(&port.name);
        node.sets
            .remove_from_set(&set, &port_element(&old.ip, port), &old.uid)
            .map_err(|e| {
                Error::IpsetError(format!("failed to remove {key} from named port set {set}"), e)
            })?;
    }
    for port in &new.named_ports {
        if old.named_ports.contains(port) {
            continue;
        }
        let set = namedport_set(&port.name);
        node.sets
            .add_to_set(
                &set,
                &port_element(&new.ip, port),
                SetKind::IpPortHash,
                &new.uid,
            )
            .map_err(|e| {
                Error::IpsetError(format!("failed to add {key} to named port set {set}"), e)
            })?;
    }

    node.pod_map.insert(key.to_string(), new);
    Ok(())
}

/// `ip,port` for TCP (the kernel default), `ip,proto:port` otherwise.
fn port_element(ip: &str, port: &NamedPort) -> String {
    if port.protocol.is_empty() || port.protocol == "TCP" {
        format!("{ip},{}", port.port)
    } else {
        format!("{ip},{}:{}", port.protocol.to_ascii_lowercase(), port.port)
    }
}

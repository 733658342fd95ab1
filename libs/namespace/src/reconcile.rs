use polman_core::controller::DEFAULT_RESYNC_INTERVAL;
use polman_core::controller::context::Context;
use polman_core::error::{Error, Result};
use polman_core::metrics::Operation;
use polman_core::state::{NamespaceRecord, NodeState};

use polman_dataplane::names::{ALL_NAMESPACES, ns_label_key_set, ns_label_set, ns_set};

use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::api::core::v1::Namespace;
use kube::ResourceExt;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use tracing::{debug, instrument};

#[instrument(skip(ctx, namespace))]
pub async fn reconcile_namespace(
    namespace: Arc<Namespace>,
    ctx: Arc<Context<Namespace>>,
) -> Result<Action> {
    let name = namespace.name_any();

    // reconcile against the cache, not the event payload
    let desired = ctx
        .namespace_store
        .get(&ObjectRef::from(namespace.as_ref()))
        .map(|cached| record_from(&cached));

    let start = Instant::now();
    let mut node = ctx.node.lock().await;
    let operation = if desired.is_some() {
        if node.ns_map.contains_key(&name) {
            Operation::Update
        } else {
            Operation::Create
        }
    } else {
        Operation::Delete
    };
    let result = sync_namespace(&mut node, &name, desired);
    drop(node);

    ctx.metrics
        .observe_exec(operation, result.is_err(), start.elapsed());
    result?;
    Ok(Action::requeue(DEFAULT_RESYNC_INTERVAL))
}

pub fn record_from(namespace: &Namespace) -> NamespaceRecord {
    NamespaceRecord {
        name: namespace.name_any(),
        labels: namespace.metadata.labels.clone().unwrap_or_default(),
    }
}

/// Reconcile one namespace against the shadow map.
pub fn sync_namespace(
    node: &mut NodeState,
    name: &str,
    desired: Option<NamespaceRecord>,
) -> Result<()> {
    let current = node.ns_map.get(name).cloned();
    match (current, desired) {
        (None, Some(new)) => {
            debug!(msg = "mirroring namespace", namespace = %name);
            let set = node
                .ensure_namespace_set(name)
                .map_err(|e| Error::IpsetError(format!("failed to create set for {name}"), e))?;
            for (label_key, label_value) in &new.labels {
                join_label_lists(node, &set, label_key, label_value)?;
            }
            node.ns_map.insert(name.to_string(), new);
            Ok(())
        }
        (Some(old), Some(new)) => {
            let set = node
                .ensure_namespace_set(name)
                .map_err(|e| Error::IpsetError(format!("failed to ensure set for {name}"), e))?;
            for (label_key, label_value) in &old.labels {
                if new.labels.get(label_key) == Some(label_value) {
                    continue;
                }
                leave_value_list(node, &set, label_key, label_value)?;
                if !new.labels.contains_key(label_key) {
                    leave_key_list(node, &set, label_key)?;
                }
            }
            for (label_key, label_value) in &new.labels {
                if old.labels.get(label_key) == Some(label_value) {
                    continue;
                }
                join_label_lists(node, &set, label_key, label_value)?;
            }
            node.ns_map.insert(name.to_string(), new);
            Ok(())
        }
        (Some(old), None) => {
            debug!(msg = "unmirroring namespace", namespace = %name);
            let set = ns_set(name);
            for (label_key, label_value) in old.labels.iter().rev() {
                leave_value_list(node, &set, label_key, label_value)?;
                leave_key_list(node, &set, label_key)?;
            }
            node.sets
                .remove_from_list(ALL_NAMESPACES, &set)
                .map_err(|e| {
                    Error::IpsetError(format!("failed to leave all-namespaces for {name}"), e)
                })?;
            // release the pin taken by ensure_namespace_set; the set lives on
            // while pods still populate it
            node.sets.remove_reference(&set).map_err(|e| {
                Error::IpsetError(format!("failed to release set for {name}"), e)
            })?;
            node.ns_map.remove(name);
            Ok(())
        }
        (None, None) => Ok(()),
    }
}

fn join_label_lists(
    node: &mut NodeState,
    set: &str,
    label_key: &str,
    label_value: &str,
) -> Result<()> {
    let key_list = ns_label_key_set(label_key);
    node.sets.add_to_list(&key_list, set).map_err(|e| {
        Error::IpsetError(format!("failed to join label list {key_list}"), e)
    })?;
    let value_list = ns_label_set(label_key, label_value);
    node.sets.add_to_list(&value_list, set).map_err(|e| {
        Error::IpsetError(format!("failed to join label list {value_list}"), e)
    })
}

fn leave_value_list(
    node: &mut NodeState,
    set: &str,
    label_key: &str,
    label_value: &str,
) -> Result<()> {
    let value_list = ns_label_set(label_key, label_value);
    node.sets.remove_from_list(&value_list, set).map_err(|e| {
        Error::IpsetError(format!("failed to leave label list {value_list}"), e)
    })
}

fn leave_key_list(node: &mut NodeState, set: &str, label_key: &str) -> Result<()> {
    let key_list = ns_label_key_set(label_key);
    node.sets.remove_from_list(&key_list, set).map_err(|e| {
        Error::IpsetError(format!("failed to leave label list {key_list}"), e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use polman_dataplane::exec::FakeRunner;
    use polman_dataplane::metrics::DataplaneMetrics;
    use polman_dataplane::names::hashed_name;

    fn node() -> (NodeState, Arc<FakeRunner>) {
        let runner = Arc::new(FakeRunner::new());
        let state = NodeState::new(
            "nodename",
            runner.clone(),
            Arc::new(DataplaneMetrics::unregistered()),
        );
        (state, runner)
    }

    fn dev_namespace() -> NamespaceRecord {
        NamespaceRecord {
            name: "dev".to_string(),
            labels: [("env".to_string(), "dev".to_string())].into(),
        }
    }

    #[test]
    fn create_joins_all_namespaces_and_label_lists() {
        let (mut node, runner) = node();

        sync_namespace(&mut node, "dev", Some(dev_namespace())).unwrap();

        let ns = hashed_name("ns-dev");
        let all = hashed_name(ALL_NAMESPACES);
        let key_list = hashed_name("ns-env");
        let value_list = hashed_name("ns-env:dev");
        assert_eq!(runner.command_lines(), vec![
            format!("ipset -N -exist {ns} nethash"),
            format!("ipset -N -exist {all} setlist"),
            format!("ipset -A -exist {all} {ns}"),
            format!("ipset -N -exist {key_list} setlist"),
            format!("ipset -A -exist {key_list} {ns}"),
            format!("ipset -N -exist {value_list} setlist"),
            format!("ipset -A -exist {value_list} {ns}"),
        ]);
        assert!(node.ns_map.contains_key("dev"));
    }

    #[test]
    fn label_change_moves_the_membership() {
        let (mut node, runner) = node();
        sync_namespace(&mut node, "dev", Some(dev_namespace())).unwrap();

        let mut relabeled = dev_namespace();
        relabeled.labels = [("env".to_string(), "staging".to_string())].into();
        sync_namespace(&mut node, "dev", Some(relabeled)).unwrap();

        let ns = hashed_name("ns-dev");
        let old_value = hashed_name("ns-env:dev");
        let new_value = hashed_name("ns-env:staging");
        let lines = runner.command_lines();
        assert_eq!(lines[7..], [
            format!("ipset -D -exist {old_value} {ns}"),
            format!("ipset -X {old_value}"),
            // key list membership is kept, only re-asserted in the mirror
            format!("ipset -N -exist {new_value} setlist"),
            format!("ipset -A -exist {new_value} {ns}"),
        ]);
        assert_eq!(node.ns_map["dev"].labels["env"], "staging");
    }

    #[test]
    fn delete_leaves_lists_then_destroys_the_set() {
        let (mut node, runner) = node();
        sync_namespace(&mut node, "dev", Some(dev_namespace())).unwrap();

        sync_namespace(&mut node, "dev", None).unwrap();

        let ns = hashed_name("ns-dev");
        let all = hashed_name(ALL_NAMESPACES);
        let key_list = hashed_name("ns-env");
        let value_list = hashed_name("ns-env:dev");
        let lines = runner.command_lines();
        assert_eq!(lines[7..], [
            format!("ipset -D -exist {value_list} {ns}"),
            format!("ipset -X {value_list}"),
            format!("ipset -D -exist {key_list} {ns}"),
            format!("ipset -X {key_list}"),
            format!("ipset -D -exist {all} {ns}"),
            format!("ipset -X {all}"),
            format!("ipset -X {ns}"),
        ]);
        assert!(node.ns_map.is_empty());
        assert!(node.sets.sets().is_empty());
        assert!(node.sets.lists().is_empty());
    }

    #[test]
    fn namespace_set_with_pods_survives_namespace_deletion() {
        let (mut node, _runner) = node();
        sync_namespace(&mut node, "dev", Some(dev_namespace())).unwrap();
        node.sets
            .add_to_set("ns-dev", "10.0.0.7", polman_dataplane::ipset::SetKind::NetHash, "uid-1")
            .unwrap();

        sync_namespace(&mut node, "dev", None).unwrap();

        // refcount released, but the element keeps the set alive
        assert!(node.sets.sets().contains_key("ns-dev"));
        node.sets
            .remove_from_set("ns-dev", "10.0.0.7", "uid-1")
            .unwrap();
        assert!(!node.sets.sets().contains_key("ns-dev"));
    }

    #[test]
    fn unknown_namespace_delete_is_a_no_op() {
        let (mut node, runner) = node();
        sync_namespace(&mut node, "ghost", None).unwrap();
        assert_eq!(runner.call_count(), 0);
    }
}

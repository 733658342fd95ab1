use crate::translate::{Direction, TranslatedPolicy, cidr_set_name, translate};

use polman_core::controller::DEFAULT_RESYNC_INTERVAL;
use polman_core::controller::context::Context;
use polman_core::error::{Error, Result};
use polman_core::metrics::Operation;
use polman_core::state::{NodeState, PolicyRecord};

use polman_dataplane::ipset::SetKind;

use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::ResourceExt;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use tracing::{debug, info, instrument, warn};

#[instrument(skip(ctx, policy))]
pub async fn reconcile_policy(
    policy: Arc<NetworkPolicy>,
    ctx: Arc<Context<NetworkPolicy>>,
) -> Result<Action> {
    // safe unwrap: NetworkPolicy is namespace scoped
    let namespace = policy.namespace().unwrap();
    let name = policy.name_any();
    let key = format!("{namespace}/{name}");

    // reconcile against the cache, not the event payload
    let cached = ctx.policy_store.get(&ObjectRef::from(policy.as_ref()));

    let start = Instant::now();
    let mut node = ctx.node.lock().await;
    let (operation, result) = match cached {
        Some(current) => {
            let operation = if node.policy_map.contains_key(&key) {
                Operation::Update
            } else {
                Operation::Create
            };
            info!(msg = "applying network policy", %key);
            (operation, apply_policy(&mut node, &key, &current))
        }
        None => {
            info!(msg = "removing network policy", %key);
            (Operation::Delete, remove_policy(&mut node, &key))
        }
    };
    ctx.cluster_metrics
        .num_policies
        .set(node.policy_map.len() as i64);
    drop(node);

    ctx.metrics
        .observe_exec(operation, result.is_err(), start.elapsed());
    result?;
    Ok(Action::requeue(DEFAULT_RESYNC_INTERVAL))
}

/// Translate and install a policy. A policy already present is uninstalled
/// first; the translator is deterministic, so replaying an unchanged policy
/// converges to the same dataplane state.
pub fn apply_policy(node: &mut NodeState, key: &str, policy: &NetworkPolicy) -> Result<()> {
    let translated = translate(policy)?;
    if node.policy_map.contains_key(key) || node.filters.has_policy(key) {
        debug!(msg = "policy already installed, reinstalling", %key);
        remove_policy(node, key)?;
    }

    let mut record = PolicyRecord::default();
    match install(node, key, &translated, &mut record) {
        Ok(()) => {
            node.policy_map.insert(key.to_string(), record);
            Ok(())
        }
        Err(e) => {
            warn!(msg = "policy install failed, releasing partial state", %key, %e);
            if let Err(release) = release_record(node, &record) {
                warn!(msg = "failed to release partial policy state", %key, %release);
            }
            Err(e)
        }
    }
}

/// Uninstall a policy's rule entries (newest first) and release every set
/// reference it held; sets whose last reference drops and that hold no
/// elements are destroyed.
pub fn remove_policy(node: &mut NodeState, key: &str) -> Result<()> {
    node.filters.uninstall_policy(key);
    match node.policy_map.remove(key) {
        Some(record) => release_record(node, &record),
        None => Ok(()),
    }
}

fn install(
    node: &mut NodeState,
    key: &str,
    translated: &TranslatedPolicy,
    record: &mut PolicyRecord,
) -> Result<()> {
    let (namespace, name) = key
        .split_once('/')
        .ok_or_else(|| Error::MissingData(format!("malformed policy key {key:?}")))?;

    for set in &translated.sets {
        node.sets
            .add_reference(set, SetKind::NetHash)
            .map_err(|e| Error::IpsetError(format!("failed to reference set {set}"), e))?;
        record.sets.push(set.clone());
    }
    for named_port in &translated.named_ports {
        node.sets
            .add_reference(named_port, SetKind::IpPortHash)
            .map_err(|e| {
                Error::IpsetError(format!("failed to reference named port set {named_port}"), e)
            })?;
        record.named_ports.push(named_port.clone());
    }
    for list in &translated.lists {
        node.sets
            .add_reference(list, SetKind::SetList)
            .map_err(|e| Error::IpsetError(format!("failed to reference list {list}"), e))?;
        record.lists.push(list.clone());
    }

    install_cidr_groups(
        node,
        name,
        namespace,
        Direction::Ingress,
        &translated.ingress_cidrs,
        record,
    )?;
    install_cidr_groups(
        node,
        name,
        namespace,
        Direction::Egress,
        &translated.egress_cidrs,
        record,
    )?;

    node.filters
        .install_policy(key, translated.entries.clone())
        .map_err(|e| Error::FilterError(format!("failed to install entries for {key}"), e))
}

fn install_cidr_groups(
    node: &mut NodeState,
    name: &str,
    namespace: &str,
    direction: Direction,
    groups: &[Vec<String>],
    record: &mut PolicyRecord,
) -> Result<()> {
    for (rule_index, group) in groups.iter().enumerate() {
        if group.is_empty() {
            continue;
        }
        let set = cidr_set_name(name, namespace, rule_index, direction);
        node.sets
            .add_reference(&set, SetKind::NetHash)
            .map_err(|e| Error::IpsetError(format!("failed to create CIDR set {set}"), e))?;
        record.cidr_sets.push(set.clone());
        for element in group {
            node.sets
                .add_to_set(&set, element, SetKind::NetHash, "")
                .map_err(|e| {
                    Error::IpsetError(format!("failed to populate CIDR set {set}"), e)
                })?;
        }
    }
    Ok(())
}

/// Release everything a record holds. Walks every entry even after a
/// failure and surfaces the first error, so a single in-use set does not
/// leak the remaining references.
fn release_record(node: &mut NodeState, record: &PolicyRecord) -> Result<()> {
    let mut first_error = None;

    for set in &record.cidr_sets {
        // policy-scoped: destroyed outright, elements and all
        if let Err(e) = node.sets.delete_set(set) {
            warn!(msg = "failed to destroy CIDR set", set = %set, %e);
            first_error.get_or_insert(Error::IpsetError(
                format!("failed to destroy CIDR set {set}"),
                e,
            ));
        }
    }
    for set in record
        .sets
        .iter()
        .chain(&record.named_ports)
        .chain(&record.lists)
    {
        if let Err(e) = node.sets.remove_reference(set) {
            warn!(msg = "failed to release set reference", set = %set, %e);
            first_error.get_or_insert(Error::IpsetError(
                format!("failed to release reference on {set}"),
                e,
            ));
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use polman_dataplane::exec::{FakeRunner, exit_output};
    use polman_dataplane::iptables::CHAIN_INGRESS_DROPS;
    use polman_dataplane::metrics::DataplaneMetrics;

    use k8s_openapi::api::networking::v1::{
        NetworkPolicyIngressRule, NetworkPolicyPeer, NetworkPolicySpec,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

    fn node() -> (NodeState, Arc<FakeRunner>) {
        let runner = Arc::new(FakeRunner::new());
        let state = NodeState::new(
            "nodename",
            runner.clone(),
            Arc::new(DataplaneMetrics::unregistered()),
        );
        (state, runner)
    }

    fn labels(pairs: &[(&str, &str)]) -> LabelSelector {
        LabelSelector {
            match_labels: Some(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            match_expressions: None,
        }
    }

    fn allow_from(namespace: &str, name: &str, peer: NetworkPolicyPeer) -> NetworkPolicy {
        NetworkPolicy {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(NetworkPolicySpec {
                pod_selector: Some(labels(&[("app", "backend")])),
                policy_types: Some(vec!["Ingress".to_string()]),
                ingress: Some(vec![NetworkPolicyIngressRule {
                    from: Some(vec![peer]),
                    ports: None,
                }]),
                egress: None,
            }),
        }
    }

    fn pod_peer(pairs: &[(&str, &str)]) -> NetworkPolicyPeer {
        NetworkPolicyPeer {
            pod_selector: Some(labels(pairs)),
            namespace_selector: None,
            ip_block: None,
        }
    }

    fn namespace_peer(pairs: &[(&str, &str)]) -> NetworkPolicyPeer {
        NetworkPolicyPeer {
            pod_selector: None,
            namespace_selector: Some(labels(pairs)),
            ip_block: None,
        }
    }

    #[test]
    fn install_then_remove_restores_the_previous_state() {
        let (mut node, _runner) = node();
        let policy = allow_from("dev", "allow-web", pod_peer(&[("app", "frontend")]));

        apply_policy(&mut node, "dev/allow-web", &policy).unwrap();
        assert!(node.filters.has_policy("dev/allow-web"));
        assert_eq!(node.sets.sets()["ns-dev"].refcount, 1);
        assert_eq!(node.sets.sets()["app:frontend"].refcount, 1);

        remove_policy(&mut node, "dev/allow-web").unwrap();
        assert!(!node.filters.has_policy("dev/allow-web"));
        assert!(node.sets.sets().is_empty());
        assert!(node.sets.lists().is_empty());
        assert!(node.policy_map.is_empty());
    }

    #[test]
    fn exactly_one_drop_entry_per_installed_ingress_policy() {
        let (mut node, _runner) = node();
        let policy = allow_from("dev", "allow-web", pod_peer(&[("app", "frontend")]));

        apply_policy(&mut node, "dev/allow-web", &policy).unwrap();

        let drops: Vec<_> = node
            .filters
            .installed("dev/allow-web")
            .unwrap()
            .iter()
            .filter(|e| e.chain == CHAIN_INGRESS_DROPS && e.specs.last().is_some_and(|s| s == "DROP"))
            .collect();
        assert_eq!(drops.len(), 1);

        remove_policy(&mut node, "dev/allow-web").unwrap();
        assert!(node.filters.installed("dev/allow-web").is_none());
    }

    #[test]
    fn shared_list_survives_deleting_one_of_two_policies() {
        let (mut node, _runner) = node();
        let a = allow_from("dev", "from-prod-a", namespace_peer(&[("env", "prod")]));
        let b = allow_from("dev", "from-prod-b", namespace_peer(&[("env", "prod")]));

        apply_policy(&mut node, "dev/from-prod-a", &a).unwrap();
        apply_policy(&mut node, "dev/from-prod-b", &b).unwrap();
        assert_eq!(node.sets.lists()["ns-env:prod"].refcount, 2);

        remove_policy(&mut node, "dev/from-prod-a").unwrap();
        assert_eq!(node.sets.lists()["ns-env:prod"].refcount, 1);
        assert!(node.filters.has_policy("dev/from-prod-b"));

        remove_policy(&mut node, "dev/from-prod-b").unwrap();
        assert!(node.sets.lists().is_empty());
    }

    #[test]
    fn reapplying_a_policy_reinstalls_it_once() {
        let (mut node, _runner) = node();
        let policy = allow_from("dev", "allow-web", pod_peer(&[("app", "frontend")]));

        apply_policy(&mut node, "dev/allow-web", &policy).unwrap();
        apply_policy(&mut node, "dev/allow-web", &policy).unwrap();

        assert_eq!(node.policy_map.len(), 1);
        assert_eq!(node.sets.sets()["ns-dev"].refcount, 1);
        assert_eq!(
            node.filters.installed("dev/allow-web").map(<[_]>::len),
            Some(3)
        );
    }

    #[test]
    fn cidr_sets_are_created_populated_and_destroyed_with_the_policy() {
        let (mut node, runner) = node();
        let policy = allow_from("dev", "from-vnet", NetworkPolicyPeer {
            ip_block: Some(k8s_openapi::api::networking::v1::IPBlock {
                cidr: "10.0.0.0/8".to_string(),
                except: Some(vec!["10.1.0.0/16".to_string()]),
            }),
            pod_selector: None,
            namespace_selector: None,
        });

        apply_policy(&mut node, "dev/from-vnet", &policy).unwrap();

        let cidr_set = "from-vnet-in-ns-dev-0in";
        let entry = &node.sets.sets()[cidr_set];
        assert_eq!(entry.refcount, 1);
        assert!(entry.elements.contains_key("10.0.0.0/8"));
        assert!(entry.elements.contains_key("10.1.0.0/16 nomatch"));
        let hashed = polman_dataplane::names::hashed_name(cidr_set);
        assert!(
            runner
                .command_lines()
                .contains(&format!("ipset -A -exist {hashed} 10.1.0.0/16 nomatch"))
        );

        remove_policy(&mut node, "dev/from-vnet").unwrap();
        assert!(!node.sets.sets().contains_key(cidr_set));
        assert!(
            runner
                .command_lines()
                .contains(&format!("ipset -X {hashed}"))
        );
    }

    #[test]
    fn failed_entry_install_releases_references() {
        let (mut node, runner) = node();
        let policy = allow_from("dev", "allow-web", pod_peer(&[("app", "frontend")]));

        // sets install fine (3 creates), first iptables insert blows up
        runner.push_response(exit_output(0, "", ""));
        runner.push_response(exit_output(0, "", ""));
        runner.push_response(exit_output(0, "", ""));
        runner.push_response(exit_output(2, "", "iptables v1.8.7: unknown option"));

        let err = apply_policy(&mut node, "dev/allow-web", &policy).unwrap_err();
        assert!(matches!(err, Error::FilterError(..)));
        assert!(node.policy_map.is_empty());
        assert!(node.sets.sets().is_empty());
        assert!(!node.filters.has_policy("dev/allow-web"));
    }
}

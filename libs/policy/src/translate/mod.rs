//! The policy translator: a pure function from a `NetworkPolicy` object to
//! the named sets and ordered rule entries that realize it. No kernel
//! contact happens here; the reconciler applies the output through the set
//! and filter managers.
//!
//! Output is deterministic: two policies equal up to map iteration order of
//! their label selectors translate to byte-identical entry sequences,
//! comments included.

mod selector;

use self::selector::{CompiledSelector, Domain, SetMatch, compile_label_selector};

use polman_core::error::{Error, Result};
use polman_dataplane::ipset::SetKind;
use polman_dataplane::iptables::{
    CHAIN_EGRESS_DROPS, CHAIN_EGRESS_PORT, CHAIN_EGRESS_TO, CHAIN_INGRESS_DROPS,
    CHAIN_INGRESS_FROM, CHAIN_INGRESS_PORT, MARK_EGRESS_ALLOW, MARK_INGRESS_ALLOW, RuleEntry,
};
use polman_dataplane::names::{ALL_NAMESPACES, hashed_name, namedport_set, ns_set};

use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyPeer, NetworkPolicyPort, NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

/// Traffic direction of one rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ingress,
    Egress,
}

impl Direction {
    fn cidr_suffix(self) -> &'static str {
        match self {
            Direction::Ingress => "in",
            Direction::Egress => "out",
        }
    }

    /// Direction flag of peer matches: the peer is the source of ingress
    /// traffic and the destination of egress traffic.
    fn peer_direction(self) -> &'static str {
        match self {
            Direction::Ingress => "src",
            Direction::Egress => "dst",
        }
    }

    fn target_direction(self) -> &'static str {
        match self {
            Direction::Ingress => "dst",
            Direction::Egress => "src",
        }
    }

    fn peer_chain(self) -> &'static str {
        match self {
            Direction::Ingress => CHAIN_INGRESS_FROM,
            Direction::Egress => CHAIN_EGRESS_TO,
        }
    }

    fn port_chain(self) -> &'static str {
        match self {
            Direction::Ingress => CHAIN_INGRESS_PORT,
            Direction::Egress => CHAIN_EGRESS_PORT,
        }
    }

    fn drops_chain(self) -> &'static str {
        match self {
            Direction::Ingress => CHAIN_INGRESS_DROPS,
            Direction::Egress => CHAIN_EGRESS_DROPS,
        }
    }

    fn mark(self) -> &'static str {
        match self {
            Direction::Ingress => MARK_INGRESS_ALLOW,
            Direction::Egress => MARK_EGRESS_ALLOW,
        }
    }
}

/// Name of the policy-scoped set holding one rule's literal CIDRs.
pub fn cidr_set_name(
    policy: &str,
    namespace: &str,
    rule_index: usize,
    direction: Direction,
) -> String {
    format!(
        "{policy}-in-ns-{namespace}-{rule_index}{}",
        direction.cidr_suffix()
    )
}

/// Everything a policy requires of the dataplane, in installation order.
///
/// `sets`, `named_ports` and `lists` are the logical names the reconciler
/// must reference-count into existence. `ingress_cidrs`/`egress_cidrs` hold
/// one group per input rule (empty when the rule has no `ipBlock`), positive
/// CIDRs first, `nomatch` exemptions after.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranslatedPolicy {
    pub sets: Vec<String>,
    pub named_ports: Vec<String>,
    pub lists: Vec<String>,
    pub ingress_cidrs: Vec<Vec<String>>,
    pub egress_cidrs: Vec<Vec<String>>,
    pub entries: Vec<RuleEntry>,
}

impl TranslatedPolicy {
    fn require_set(&mut self, name: &str) {
        if !self.sets.iter().any(|existing| existing == name) {
            self.sets.push(name.to_string());
        }
    }

    fn require_list(&mut self, name: &str) {
        if !self.lists.iter().any(|existing| existing == name) {
            self.lists.push(name.to_string());
        }
    }

    fn require_named_port(&mut self, name: &str) {
        if !self.named_ports.iter().any(|existing| existing == name) {
            self.named_ports.push(name.to_string());
        }
    }

    fn require_matches(&mut self, matches: &[SetMatch]) {
        for set_match in matches {
            match set_match.kind {
                SetKind::SetList => self.require_list(&set_match.name),
                _ => self.require_set(&set_match.name),
            }
        }
    }
}

struct CompiledTarget {
    matches: Vec<SetMatch>,
    comment: String,
}

struct CompiledPeer {
    matches: Vec<SetMatch>,
    comment: String,
}

struct PortClause {
    tokens: Vec<String>,
}

/// Translate one policy object. Pure; the only failure modes are malformed
/// input (missing metadata or spec, invalid selector operators).
pub fn translate(policy: &NetworkPolicy) -> Result<TranslatedPolicy> {
    let namespace = policy
        .metadata
        .namespace
        .as_deref()
        .ok_or_else(|| Error::MissingData("network policy has no namespace".to_string()))?;
    let name = policy
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| Error::MissingData("network policy has no name".to_string()))?;
    let spec = policy
        .spec
        .as_ref()
        .ok_or_else(|| Error::MissingData(format!("network policy {namespace}/{name} has no spec")))?;

    let mut out = TranslatedPolicy::default();
    let pod_selector = spec.pod_selector.clone().unwrap_or_default();
    let target = compile_target(namespace, &pod_selector, &mut out)?;
    let (ingress, egress) = effective_policy_types(spec);

    if ingress {
        for (rule_index, rule) in spec.ingress.as_deref().unwrap_or_default().iter().enumerate() {
            compile_rule(
                Direction::Ingress,
                rule_index,
                rule.from.as_deref().unwrap_or_default(),
                rule.ports.as_deref().unwrap_or_default(),
                &target,
                name,
                namespace,
                &mut out,
            )?;
        }
        drop_entries(Direction::Ingress, &target, &mut out);
    }
    if egress {
        for (rule_index, rule) in spec.egress.as_deref().unwrap_or_default().iter().enumerate() {
            compile_rule(
                Direction::Egress,
                rule_index,
                rule.to.as_deref().unwrap_or_default(),
                rule.ports.as_deref().unwrap_or_default(),
                &target,
                name,
                namespace,
                &mut out,
            )?;
        }
        drop_entries(Direction::Egress, &target, &mut out);
    }
    Ok(out)
}

/// `policyTypes` defaulting per NetworkPolicy v1: absent means Ingress, plus
/// Egress when egress rules are present.
fn effective_policy_types(spec: &NetworkPolicySpec) -> (bool, bool) {
    match &spec.policy_types {
        Some(types) => (
            types.iter().any(|t| t == "Ingress"),
            types.iter().any(|t| t == "Egress"),
        ),
        None => (true, spec.egress.is_some()),
    }
}

fn compile_target(
    namespace: &str,
    pod_selector: &LabelSelector,
    out: &mut TranslatedPolicy,
) -> Result<CompiledTarget> {
    let mut matches = vec![SetMatch::of(ns_set(namespace), SetKind::NetHash)];
    let compiled = compile_label_selector(pod_selector, Domain::Pod)?;
    let comment = selector_comment(&compiled, namespace);
    matches.extend(compiled.matches);
    out.require_matches(&matches);
    Ok(CompiledTarget { matches, comment })
}

/// `<frags>-IN-ns-<ns>` for a non-empty selector, the namespace set name for
/// the match-everything selector.
fn selector_comment(compiled: &CompiledSelector, namespace: &str) -> String {
    if compiled.fragments.is_empty() {
        ns_set(namespace)
    } else {
        format!("{}-IN-ns-{namespace}", compiled.fragments.join("-AND-"))
    }
}

#[allow(clippy::too_many_arguments)]
fn compile_rule(
    direction: Direction,
    rule_index: usize,
    peers: &[NetworkPolicyPeer],
    ports: &[NetworkPolicyPort],
    target: &CompiledTarget,
    policy_name: &str,
    namespace: &str,
    out: &mut TranslatedPolicy,
) -> Result<()> {
    let mut cidr_group = Vec::new();
    let compiled_peers = compile_peers(
        direction,
        rule_index,
        peers,
        policy_name,
        namespace,
        &mut cidr_group,
        out,
    )?;
    let port_clauses = compile_ports(ports, out);
    let target_tokens: Vec<String> = target
        .matches
        .iter()
        .flat_map(|m| m.tokens(direction.target_direction()))
        .collect();

    let rendered_peers: Vec<(Vec<String>, String)> = compiled_peers
        .iter()
        .map(|peer| {
            let tokens: Vec<String> = peer
                .matches
                .iter()
                .flat_map(|m| m.tokens(direction.peer_direction()))
                .collect();
            let comment = match direction {
                Direction::Ingress => format!("ALLOW-{}-TO-{}", peer.comment, target.comment),
                Direction::Egress => format!("ALLOW-{}-TO-{}", target.comment, peer.comment),
            };
            (tokens, comment)
        })
        .collect();

    if port_clauses.is_empty() {
        for (peer_tokens, comment) in &rendered_peers {
            let mut specs = peer_tokens.clone();
            specs.extend(target_tokens.iter().cloned());
            specs.extend(comment_tokens(comment));
            specs.extend(mark_action(direction));
            out.entries
                .push(RuleEntry::new(direction.peer_chain(), specs));
        }
    } else {
        for clause in &port_clauses {
            for (peer_tokens, comment) in &rendered_peers {
                let mut specs = clause.tokens.clone();
                specs.extend(peer_tokens.iter().cloned());
                specs.extend(target_tokens.iter().cloned());
                specs.extend(comment_tokens(comment));
                specs.extend(mark_action(direction));
                out.entries
                    .push(RuleEntry::new(direction.port_chain(), specs));
            }
        }
    }

    match direction {
        Direction::Ingress => out.ingress_cidrs.push(cidr_group),
        Direction::Egress => out.egress_cidrs.push(cidr_group),
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn compile_peers(
    direction: Direction,
    rule_index: usize,
    peers: &[NetworkPolicyPeer],
    policy_name: &str,
    namespace: &str,
    cidr_group: &mut Vec<String>,
    out: &mut TranslatedPolicy,
) -> Result<Vec<CompiledPeer>> {
    // an empty peer list allows traffic from any namespace
    if peers.is_empty() {
        out.require_list(ALL_NAMESPACES);
        return Ok(vec![CompiledPeer {
            matches: vec![SetMatch::of(ALL_NAMESPACES, SetKind::SetList)],
            comment: ALL_NAMESPACES.to_string(),
        }]);
    }

    let mut compiled = Vec::with_capacity(peers.len());
    let mut cidr_peer_emitted = false;
    for peer in peers {
        if let Some(block) = &peer.ip_block {
            cidr_group.push(block.cidr.clone());
            for except in block.except.as_deref().unwrap_or_default() {
                cidr_group.push(format!("{except} nomatch"));
            }
            // all ipBlock peers of one rule share the rule-scoped CIDR set,
            // so only the first emits a match
            if !cidr_peer_emitted {
                let set = cidr_set_name(policy_name, namespace, rule_index, direction);
                compiled.push(CompiledPeer {
                    matches: vec![SetMatch::of(set.clone(), SetKind::NetHash)],
                    comment: set,
                });
                cidr_peer_emitted = true;
            }
            continue;
        }

        let mut matches = Vec::new();
        let mut fragments = Vec::new();
        let mut own_namespace = false;
        match &peer.namespace_selector {
            Some(ns_selector) => {
                let c = compile_label_selector(ns_selector, Domain::Namespace)?;
                if c.matches.is_empty() {
                    matches.push(SetMatch::of(ALL_NAMESPACES, SetKind::SetList));
                    fragments.push(ALL_NAMESPACES.to_string());
                } else {
                    matches.extend(c.matches);
                    fragments.extend(c.fragments);
                }
            }
            None => {
                matches.push(SetMatch::of(ns_set(namespace), SetKind::NetHash));
                own_namespace = true;
            }
        }
        if let Some(pod_selector) = &peer.pod_selector {
            let c = compile_label_selector(pod_selector, Domain::Pod)?;
            matches.extend(c.matches);
            fragments.extend(c.fragments);
        }

        let comment = if fragments.is_empty() {
            ns_set(namespace)
        } else if own_namespace {
            format!("{}-IN-ns-{namespace}", fragments.join("-AND-"))
        } else {
            fragments.join("-AND-")
        };
        out.require_matches(&matches);
        compiled.push(CompiledPeer { matches, comment });
    }
    Ok(compiled)
}

fn compile_ports(ports: &[NetworkPolicyPort], out: &mut TranslatedPolicy) -> Vec<PortClause> {
    ports
        .iter()
        .map(|port| {
            let protocol = port
                .protocol
                .as_deref()
                .unwrap_or("TCP")
                .to_ascii_lowercase();
            let mut tokens = vec!["-p".to_string(), protocol];
            match &port.port {
                Some(IntOrString::Int(number)) => {
                    tokens.push("--dport".to_string());
                    match port.end_port {
                        Some(end) => tokens.push(format!("{number}:{end}")),
                        None => tokens.push(number.to_string()),
                    }
                }
                Some(IntOrString::String(name)) => {
                    let set = namedport_set(name);
                    out.require_named_port(&set);
                    tokens.extend([
                        "-m".to_string(),
                        "set".to_string(),
                        "--match-set".to_string(),
                        hashed_name(&set),
                        "dst,dst".to_string(),
                    ]);
                }
                // protocol-only clause: every port of the protocol
                None => {}
            }
            PortClause { tokens }
        })
        .collect()
}

/// The per-policy pair in the drops chain: marked flows return, everything
/// else destined to (or sourced from) the target is dropped. Allow entries
/// run in earlier chains, so their mark always beats the drop.
fn drop_entries(direction: Direction, target: &CompiledTarget, out: &mut TranslatedPolicy) {
    let target_tokens: Vec<String> = target
        .matches
        .iter()
        .flat_map(|m| m.tokens(direction.target_direction()))
        .collect();
    let (return_comment, drop_comment) = match direction {
        Direction::Ingress => (
            format!("RETURN-MARKED-TO-{}", target.comment),
            format!("DROP-ALL-TO-{}", target.comment),
        ),
        Direction::Egress => (
            format!("RETURN-MARKED-FROM-{}", target.comment),
            format!("DROP-ALL-FROM-{}", target.comment),
        ),
    };

    let mut return_specs = target_tokens.clone();
    return_specs.extend([
        "-m".to_string(),
        "mark".to_string(),
        "--mark".to_string(),
        direction.mark().to_string(),
    ]);
    return_specs.extend(comment_tokens(&return_comment));
    return_specs.extend(["-j".to_string(), "RETURN".to_string()]);
    out.entries
        .push(RuleEntry::new(direction.drops_chain(), return_specs));

    let mut drop_specs = target_tokens;
    drop_specs.extend(comment_tokens(&drop_comment));
    drop_specs.extend(["-j".to_string(), "DROP".to_string()]);
    out.entries
        .push(RuleEntry::new(direction.drops_chain(), drop_specs));
}

fn comment_tokens(comment: &str) -> Vec<String> {
    vec![
        "-m".to_string(),
        "comment".to_string(),
        "--comment".to_string(),
        comment.to_string(),
    ]
}

fn mark_action(direction: Direction) -> Vec<String> {
    vec![
        "-j".to_string(),
        "MARK".to_string(),
        "--set-mark".to_string(),
        direction.mark().to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    use k8s_openapi::api::networking::v1::{
        IPBlock, NetworkPolicyEgressRule, NetworkPolicyIngressRule,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
        LabelSelectorRequirement, ObjectMeta,
    };

    fn policy(namespace: &str, name: &str, spec: NetworkPolicySpec) -> NetworkPolicy {
        NetworkPolicy {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(spec),
        }
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

    fn spec_line(entry: &RuleEntry) -> String {
        entry.specs.join(" ")
    }

    #[test]
    fn deny_all_ingress_emits_only_the_drops_pair() {
        let translated = translate(&policy("testnamespace", "deny-all", NetworkPolicySpec {
            pod_selector: Some(LabelSelector::default()),
            policy_types: Some(vec!["Ingress".to_string()]),
            ingress: None,
            egress: None,
        }))
        .unwrap();

        assert_eq!(translated.sets, vec!["ns-testnamespace"]);
        assert!(translated.lists.is_empty());
        assert!(translated.named_ports.is_empty());
        assert_eq!(translated.entries.len(), 2);
        assert!(
            translated
                .entries
                .iter()
                .all(|e| e.chain == CHAIN_INGRESS_DROPS)
        );

        let return_entry = spec_line(&translated.entries[0]);
        let drop_entry = spec_line(&translated.entries[1]);
        let ns_hash = hashed_name("ns-testnamespace");
        assert_eq!(
            return_entry,
            format!(
                "-m set --match-set {ns_hash} dst -m mark --mark 0x2000 \
                 -m comment --comment RETURN-MARKED-TO-ns-testnamespace -j RETURN"
            )
        );
        assert_eq!(
            drop_entry,
            format!(
                "-m set --match-set {ns_hash} dst \
                 -m comment --comment DROP-ALL-TO-ns-testnamespace -j DROP"
            )
        );
    }

    #[test]
    fn frontend_to_backend_allow() {
        let translated = translate(&policy("testnamespace", "allow-frontend", NetworkPolicySpec {
            pod_selector: Some(labels(&[("app", "backend")])),
            policy_types: Some(vec!["Ingress".to_string()]),
            ingress: Some(vec![NetworkPolicyIngressRule {
                from: Some(vec![NetworkPolicyPeer {
                    pod_selector: Some(labels(&[("app", "frontend")])),
                    namespace_selector: None,
                    ip_block: None,
                }]),
                ports: None,
            }]),
            egress: None,
        }))
        .unwrap();

        assert_eq!(translated.sets, vec![
            "ns-testnamespace",
            "app:backend",
            "app:frontend"
        ]);
        assert_eq!(translated.entries.len(), 3);

        let allow = &translated.entries[0];
        assert_eq!(allow.chain, CHAIN_INGRESS_FROM);
        let ns_hash = hashed_name("ns-testnamespace");
        let frontend_hash = hashed_name("app:frontend");
        let backend_hash = hashed_name("app:backend");
        assert_eq!(
            spec_line(allow),
            format!(
                "-m set --match-set {ns_hash} src -m set --match-set {frontend_hash} src \
                 -m set --match-set {ns_hash} dst -m set --match-set {backend_hash} dst \
                 -m comment --comment \
                 ALLOW-app:frontend-IN-ns-testnamespace-TO-app:backend-IN-ns-testnamespace \
                 -j MARK --set-mark 0x2000"
            )
        );
        assert_eq!(translated.entries[1].chain, CHAIN_INGRESS_DROPS);
        assert!(spec_line(&translated.entries[2]).ends_with("-j DROP"));
    }

    #[test]
    fn translator_is_deterministic_under_selector_permutation() {
        let expressions = vec![
            LabelSelectorRequirement {
                key: "k1".to_string(),
                operator: "In".to_string(),
                values: Some(vec!["v10".to_string(), "v11".to_string()]),
            },
            LabelSelectorRequirement {
                key: "k2".to_string(),
                operator: "DoesNotExist".to_string(),
                values: None,
            },
        ];
        let mut permuted = expressions.clone();
        permuted.reverse();
        // safe unwrap: values set above
        permuted[1].values.as_mut().unwrap().reverse();

        let build = |exprs: Vec<LabelSelectorRequirement>| {
            translate(&policy("dev", "perm", NetworkPolicySpec {
                pod_selector: Some(LabelSelector {
                    match_labels: Some([("k0".to_string(), "v0".to_string())].into()),
                    match_expressions: Some(exprs),
                }),
                policy_types: Some(vec!["Ingress".to_string()]),
                ingress: Some(vec![NetworkPolicyIngressRule {
                    from: None,
                    ports: None,
                }]),
                egress: None,
            }))
            .unwrap()
        };

        assert_eq!(build(expressions), build(permuted));
    }

    #[test]
    fn empty_from_allows_all_namespaces() {
        let translated = translate(&policy("dev", "open", NetworkPolicySpec {
            pod_selector: Some(LabelSelector::default()),
            policy_types: Some(vec!["Ingress".to_string()]),
            ingress: Some(vec![NetworkPolicyIngressRule {
                from: None,
                ports: None,
            }]),
            egress: None,
        }))
        .unwrap();

        assert_eq!(translated.lists, vec![ALL_NAMESPACES]);
        let allow = &translated.entries[0];
        assert_eq!(allow.chain, CHAIN_INGRESS_FROM);
        let all_hash = hashed_name(ALL_NAMESPACES);
        assert!(spec_line(allow).starts_with(&format!("-m set --match-set {all_hash} src")));
        assert!(spec_line(allow).contains("ALLOW-all-namespaces-TO-ns-dev"));
    }

    #[test]
    fn ip_block_builds_a_rule_scoped_cidr_set() {
        let translated = translate(&policy("dev", "from-vnet", NetworkPolicySpec {
            pod_selector: Some(LabelSelector::default()),
            policy_types: Some(vec!["Ingress".to_string()]),
            ingress: Some(vec![NetworkPolicyIngressRule {
                from: Some(vec![NetworkPolicyPeer {
                    ip_block: Some(IPBlock {
                        cidr: "10.0.0.0/8".to_string(),
                        except: Some(vec!["10.1.0.0/16".to_string()]),
                    }),
                    namespace_selector: None,
                    pod_selector: None,
                }]),
                ports: None,
            }]),
            egress: None,
        }))
        .unwrap();

        assert_eq!(translated.ingress_cidrs, vec![vec![
            "10.0.0.0/8".to_string(),
            "10.1.0.0/16 nomatch".to_string(),
        ]]);
        // the CIDR set is policy-scoped, not reference-counted like label sets
        assert_eq!(translated.sets, vec!["ns-dev"]);

        let cidr_set = cidr_set_name("from-vnet", "dev", 0, Direction::Ingress);
        assert_eq!(cidr_set, "from-vnet-in-ns-dev-0in");
        let allow = &translated.entries[0];
        assert!(
            spec_line(allow)
                .starts_with(&format!("-m set --match-set {} src", hashed_name(&cidr_set)))
        );
    }

    #[test]
    fn ports_cross_product_into_the_port_chain() {
        let translated = translate(&policy("dev", "web-ports", NetworkPolicySpec {
            pod_selector: Some(labels(&[("app", "web")])),
            policy_types: Some(vec!["Ingress".to_string()]),
            ingress: Some(vec![NetworkPolicyIngressRule {
                from: Some(vec![
                    NetworkPolicyPeer {
                        pod_selector: Some(labels(&[("app", "lb")])),
                        namespace_selector: None,
                        ip_block: None,
                    },
                    NetworkPolicyPeer {
                        pod_selector: Some(labels(&[("app", "gw")])),
                        namespace_selector: None,
                        ip_block: None,
                    },
                ]),
                ports: Some(vec![
                    NetworkPolicyPort {
                        port: Some(IntOrString::Int(80)),
                        end_port: None,
                        protocol: None,
                    },
                    NetworkPolicyPort {
                        port: Some(IntOrString::Int(443)),
                        end_port: None,
                        protocol: Some("UDP".to_string()),
                    },
                ]),
            }]),
            egress: None,
        }))
        .unwrap();

        let port_entries: Vec<&RuleEntry> = translated
            .entries
            .iter()
            .filter(|e| e.chain == CHAIN_INGRESS_PORT)
            .collect();
        assert_eq!(port_entries.len(), 4);
        assert!(spec_line(port_entries[0]).starts_with("-p tcp --dport 80 "));
        assert!(spec_line(port_entries[2]).starts_with("-p udp --dport 443 "));
        // no entries land in the from chain when the rule has ports
        assert!(
            translated
                .entries
                .iter()
                .all(|e| e.chain != CHAIN_INGRESS_FROM)
        );
    }

    #[test]
    fn named_port_references_the_namedport_set() {
        let translated = translate(&policy("dev", "metrics", NetworkPolicySpec {
            pod_selector: Some(LabelSelector::default()),
            policy_types: Some(vec!["Ingress".to_string()]),
            ingress: Some(vec![NetworkPolicyIngressRule {
                from: None,
                ports: Some(vec![NetworkPolicyPort {
                    port: Some(IntOrString::String("prom".to_string())),
                    end_port: None,
                    protocol: None,
                }]),
            }]),
            egress: None,
        }))
        .unwrap();

        assert_eq!(translated.named_ports, vec!["namedport:prom"]);
        let allow = &translated.entries[0];
        assert_eq!(allow.chain, CHAIN_INGRESS_PORT);
        assert!(spec_line(allow).contains(&format!(
            "-m set --match-set {} dst,dst",
            hashed_name("namedport:prom")
        )));
    }

    #[test]
    fn egress_swaps_directions_and_suffix() {
        let translated = translate(&policy("dev", "to-db", NetworkPolicySpec {
            pod_selector: Some(labels(&[("app", "web")])),
            policy_types: Some(vec!["Egress".to_string()]),
            ingress: None,
            egress: Some(vec![NetworkPolicyEgressRule {
                to: Some(vec![NetworkPolicyPeer {
                    pod_selector: Some(labels(&[("app", "db")])),
                    namespace_selector: None,
                    ip_block: None,
                }]),
                ports: None,
            }]),
        }))
        .unwrap();

        let allow = &translated.entries[0];
        assert_eq!(allow.chain, CHAIN_EGRESS_TO);
        let db_hash = hashed_name("app:db");
        let web_hash = hashed_name("app:web");
        let line = spec_line(allow);
        // peer (db) matches on dst, target (web) on src
        assert!(line.contains(&format!("-m set --match-set {db_hash} dst")));
        assert!(line.contains(&format!("-m set --match-set {web_hash} src")));
        assert!(line.contains("ALLOW-app:web-IN-ns-dev-TO-app:db-IN-ns-dev"));
        assert!(line.ends_with(&format!("-j MARK --set-mark {MARK_EGRESS_ALLOW}")));

        assert_eq!(translated.egress_cidrs, vec![Vec::<String>::new()]);
        assert_eq!(
            cidr_set_name("to-db", "dev", 0, Direction::Egress),
            "to-db-in-ns-dev-0out"
        );
    }

    #[test]
    fn namespace_selector_peer_uses_label_lists() {
        let translated = translate(&policy("dev", "from-prod", NetworkPolicySpec {
            pod_selector: Some(LabelSelector::default()),
            policy_types: Some(vec!["Ingress".to_string()]),
            ingress: Some(vec![NetworkPolicyIngressRule {
                from: Some(vec![NetworkPolicyPeer {
                    namespace_selector: Some(labels(&[("env", "prod")])),
                    pod_selector: None,
                    ip_block: None,
                }]),
                ports: None,
            }]),
            egress: None,
        }))
        .unwrap();

        assert_eq!(translated.lists, vec!["ns-env:prod"]);
        let allow = &translated.entries[0];
        assert!(spec_line(allow).starts_with(&format!(
            "-m set --match-set {} src",
            hashed_name("ns-env:prod")
        )));
        assert!(spec_line(allow).contains("ALLOW-env:prod-TO-ns-dev"));
    }

    #[test]
    fn absent_policy_types_default_from_rules() {
        let translated = translate(&policy("dev", "implicit", NetworkPolicySpec {
            pod_selector: Some(LabelSelector::default()),
            policy_types: None,
            ingress: None,
            egress: Some(vec![NetworkPolicyEgressRule {
                to: None,
                ports: None,
            }]),
        }))
        .unwrap();

        let drops: Vec<&str> = translated
            .entries
            .iter()
            .filter(|e| spec_line(e).ends_with("-j DROP"))
            .map(|e| e.chain)
            .collect();
        assert_eq!(drops, vec![CHAIN_INGRESS_DROPS, CHAIN_EGRESS_DROPS]);
    }

    #[test]
    fn policy_without_spec_is_rejected() {
        let bare = NetworkPolicy {
            metadata: ObjectMeta {
                namespace: Some("dev".to_string()),
                name: Some("empty".to_string()),
                ..ObjectMeta::default()
            },
            spec: None,
        };
        assert!(translate(&bare).is_err());
    }
}

//! Label-selector compilation.
//!
//! A selector compiles to an ordered list of set matches plus human comment
//! fragments. Ordering is fixed so that equivalent selectors compile to
//! byte-identical token sequences: `matchLabels` in key order, then
//! `matchExpressions` sorted by `(key, sorted values)`, with multi-value
//! operators expanded in value order.

use polman_core::error::{Error, Result};
use polman_dataplane::ipset::SetKind;
use polman_dataplane::names::{
    hashed_name, ns_label_key_set, ns_label_set, pod_label_set,
};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};

/// Whether the selector names pod labels or namespace labels; decides the
/// set naming and kind (namespace label sets are set-of-sets).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Domain {
    Pod,
    Namespace,
}

impl Domain {
    fn value_set(self, key: &str, value: &str) -> (String, SetKind) {
        match self {
            Domain::Pod => (pod_label_set(key, value), SetKind::NetHash),
            Domain::Namespace => (ns_label_set(key, value), SetKind::SetList),
        }
    }

    fn key_set(self, key: &str) -> (String, SetKind) {
        match self {
            Domain::Pod => (key.to_string(), SetKind::NetHash),
            Domain::Namespace => (ns_label_key_set(key), SetKind::SetList),
        }
    }
}

/// One `-m set` group of an entry, direction applied at render time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SetMatch {
    pub name: String,
    pub kind: SetKind,
    pub negated: bool,
}

impl SetMatch {
    pub(crate) fn of(name: impl Into<String>, kind: SetKind) -> Self {
        Self {
            name: name.into(),
            kind,
            negated: false,
        }
    }

    pub(crate) fn tokens(&self, direction: &str) -> Vec<String> {
        let mut tokens = vec!["-m".to_string(), "set".to_string()];
        if self.negated {
            tokens.push("!".to_string());
        }
        tokens.push("--match-set".to_string());
        tokens.push(hashed_name(&self.name));
        tokens.push(direction.to_string());
        tokens
    }
}

#[derive(Debug, Default, Clone)]
pub(crate) struct CompiledSelector {
    pub matches: Vec<SetMatch>,
    pub fragments: Vec<String>,
}

pub(crate) fn compile_label_selector(
    selector: &LabelSelector,
    domain: Domain,
) -> Result<CompiledSelector> {
    let mut compiled = CompiledSelector::default();

    if let Some(labels) = &selector.match_labels {
        for (key, value) in labels {
            let (name, kind) = domain.value_set(key, value);
            compiled.matches.push(SetMatch::of(name, kind));
            compiled.fragments.push(format!("{key}:{value}"));
        }
    }

    let mut requirements: Vec<Requirement> = selector
        .match_expressions
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(Requirement::try_from)
        .collect::<Result<_>>()?;
    requirements.sort_by(|a, b| a.key.cmp(&b.key).then_with(|| a.values.cmp(&b.values)));

    for requirement in requirements {
        requirement.compile(domain, &mut compiled);
    }
    Ok(compiled)
}

/// A `matchExpressions` entry with its values pre-sorted.
struct Requirement {
    key: String,
    operator: Operator,
    values: Vec<String>,
}

enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

impl TryFrom<&LabelSelectorRequirement> for Requirement {
    type Error = Error;

    fn try_from(requirement: &LabelSelectorRequirement) -> Result<Self> {
        let operator = match requirement.operator.as_str() {
            "In" => Operator::In,
            "NotIn" => Operator::NotIn,
            "Exists" => Operator::Exists,
            "DoesNotExist" => Operator::DoesNotExist,
            other => {
                return Err(Error::ParseError(format!(
                    "unsupported label selector operator {other:?}"
                )));
            }
        };
        let mut values = requirement.values.clone().unwrap_or_default();
        values.sort();

        if matches!(operator, Operator::In | Operator::NotIn) && values.is_empty() {
            return Err(Error::ParseError(format!(
                "operator {:?} requires values for key {:?}",
                requirement.operator, requirement.key
            )));
        }
        Ok(Self {
            key: requirement.key.clone(),
            operator,
            values,
        })
    }
}

impl Requirement {
    fn compile(&self, domain: Domain, out: &mut CompiledSelector) {
        match self.operator {
            Operator::In => {
                for value in &self.values {
                    let (name, kind) = domain.value_set(&self.key, value);
                    out.matches.push(SetMatch::of(name, kind));
                    out.fragments.push(format!("{}:{value}", self.key));
                }
            }
            Operator::NotIn => {
                for value in &self.values {
                    let (name, kind) = domain.value_set(&self.key, value);
                    out.matches.push(SetMatch {
                        negated: true,
                        ..SetMatch::of(name, kind)
                    });
                    out.fragments.push(format!("!{}:{value}", self.key));
                }
            }
            Operator::Exists => {
                let (name, kind) = domain.key_set(&self.key);
                out.matches.push(SetMatch::of(name, kind));
                out.fragments.push(self.key.clone());
            }
            Operator::DoesNotExist => {
                let (name, kind) = domain.key_set(&self.key);
                out.matches.push(SetMatch {
                    negated: true,
                    ..SetMatch::of(name, kind)
                });
                out.fragments.push(format!("!{}", self.key));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

    fn requirement(key: &str, operator: &str, values: &[&str]) -> LabelSelectorRequirement {
        LabelSelectorRequirement {
            key: key.to_string(),
            operator: operator.to_string(),
            values: if values.is_empty() {
                None
            } else {
                Some(values.iter().map(|v| v.to_string()).collect())
            },
        }
    }

    #[test]
    fn match_labels_come_before_expressions_in_key_order() {
        let selector = LabelSelector {
            match_labels: Some(
                [
                    ("b".to_string(), "2".to_string()),
                    ("a".to_string(), "1".to_string()),
                ]
                .into(),
            ),
            match_expressions: Some(vec![requirement("c", "Exists", &[])]),
        };

        let compiled = compile_label_selector(&selector, Domain::Pod).unwrap();
        assert_eq!(compiled.fragments, vec!["a:1", "b:2", "c"]);
        assert_eq!(
            compiled
                .matches
                .iter()
                .map(|m| m.name.as_str())
                .collect::<Vec<_>>(),
            vec!["a:1", "b:2", "c"]
        );
    }

    #[test]
    fn multi_value_in_expands_in_sorted_value_order() {
        let selector = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![requirement("k1", "In", &["v11", "v10"])]),
        };

        let compiled = compile_label_selector(&selector, Domain::Pod).unwrap();
        assert_eq!(compiled.fragments, vec!["k1:v10", "k1:v11"]);
        assert!(compiled.matches.iter().all(|m| !m.negated));
    }

    #[test]
    fn expressions_sort_by_key_then_values() {
        let selector = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![
                requirement("k2", "DoesNotExist", &[]),
                requirement("k1", "In", &["v11", "v10"]),
                requirement("k0", "In", &["v0"]),
            ]),
        };

        let compiled = compile_label_selector(&selector, Domain::Pod).unwrap();
        assert_eq!(
            compiled.fragments.join("-AND-"),
            "k0:v0-AND-k1:v10-AND-k1:v11-AND-!k2"
        );
        assert!(compiled.matches[3].negated);
        assert_eq!(compiled.matches[3].name, "k2");
    }

    #[test]
    fn not_in_negates_every_value() {
        let selector = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![requirement("env", "NotIn", &["prod", "canary"])]),
        };

        let compiled = compile_label_selector(&selector, Domain::Pod).unwrap();
        assert_eq!(compiled.fragments, vec!["!env:canary", "!env:prod"]);
        assert!(compiled.matches.iter().all(|m| m.negated));
        assert_eq!(compiled.matches[0].name, "env:canary");
        assert_eq!(compiled.matches[1].name, "env:prod");
    }

    #[test]
    fn namespace_domain_uses_list_sets() {
        let selector = LabelSelector {
            match_labels: Some([("env".to_string(), "prod".to_string())].into()),
            match_expressions: Some(vec![requirement("team", "Exists", &[])]),
        };

        let compiled = compile_label_selector(&selector, Domain::Namespace).unwrap();
        assert_eq!(compiled.matches[0].name, "ns-env:prod");
        assert_eq!(compiled.matches[0].kind, SetKind::SetList);
        assert_eq!(compiled.matches[1].name, "ns-team");
    }

    #[test]
    fn negated_match_token_shape() {
        let set_match = SetMatch {
            negated: true,
            ..SetMatch::of("k2", SetKind::NetHash)
        };
        let tokens = set_match.tokens("src");
        assert_eq!(tokens[0..3], ["-m", "set", "!"]);
        assert_eq!(tokens[3], "--match-set");
        assert_eq!(tokens[4], hashed_name("k2"));
        assert_eq!(tokens[5], "src");
    }

    #[test]
    fn in_without_values_is_rejected() {
        let selector = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![requirement("k", "In", &[])]),
        };
        assert!(compile_label_selector(&selector, Domain::Pod).is_err());
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let selector = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![requirement("k", "GreaterThan", &["1"])]),
        };
        assert!(compile_label_selector(&selector, Domain::Pod).is_err());
    }
}

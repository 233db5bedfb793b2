//! Ingressify core types: flattened ingress rules and the grouping/ordering
//! transforms exposed to templates.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::str::FromStr;

use k8s_openapi::api::networking::v1::Ingress;
use serde::{Deserialize, Serialize};

pub mod config;
mod transform;

pub use config::{parse_duration, Config, ConfigError, Hooks};
pub use transform::denormalize;

/// One flattened routing entry: a single (host rule × path) combination of an Ingress.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct IngressRule {
    /// FNV-1a over `namespace + name + service_name + host + path`. Stable, not unique.
    pub hash: u32,
    pub service_name: String,
    /// Numeric backend port; `0` when the backend uses a named port or none.
    pub service_port: i32,
    /// Named backend port; empty when the port is numeric.
    pub service_port_name: String,
    pub host: String,
    pub path: String,
    pub namespace: String,
    pub name: String,
    /// The Ingress this rule was flattened from.
    pub source: Ingress,
}

/// Rules in source iteration order (object, then host rule, then path).
pub type RuleSet = Vec<IngressRule>;

/// Rules partitioned by a composite key. BTreeMap keeps key order deterministic.
pub type GroupedRuleIndex = BTreeMap<String, RuleSet>;

pub mod prelude {
    pub use super::{
        denormalize, group_by, group_by_host, group_by_path, group_by_svc_ns, order_by_path_len, rule_hash,
        GroupField, GroupedRuleIndex, IngressRule, PathOrder, RuleSet,
    };
}

/// 32-bit FNV-1a.
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut h: u32 = 0x811c_9dc5;
    for b in bytes {
        h ^= *b as u32;
        h = h.wrapping_mul(0x0100_0193);
    }
    h
}

/// Identifier hash of a rule, computed over the plain concatenation of its key fields.
pub fn rule_hash(namespace: &str, name: &str, service_name: &str, host: &str, path: &str) -> u32 {
    let mut buf = String::with_capacity(namespace.len() + name.len() + service_name.len() + host.len() + path.len());
    buf.push_str(namespace);
    buf.push_str(name);
    buf.push_str(service_name);
    buf.push_str(host);
    buf.push_str(path);
    fnv1a_32(buf.as_bytes())
}

// ---- grouping ----

/// A rule field usable as a grouping dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupField {
    ServiceName,
    ServicePort,
    Host,
    Path,
    Namespace,
    Name,
}

impl GroupField {
    pub fn key_of(self, rule: &IngressRule) -> String {
        match self {
            GroupField::ServiceName => rule.service_name.clone(),
            GroupField::ServicePort => rule.service_port.to_string(),
            GroupField::Host => rule.host.clone(),
            GroupField::Path => rule.path.clone(),
            GroupField::Namespace => rule.namespace.clone(),
            GroupField::Name => rule.name.clone(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GroupField::ServiceName => "service_name",
            GroupField::ServicePort => "service_port",
            GroupField::Host => "host",
            GroupField::Path => "path",
            GroupField::Namespace => "namespace",
            GroupField::Name => "name",
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown grouping field: {0} (expected one of service_name, service_port, host, path, namespace, name)")]
pub struct UnknownGroupField(pub String);

impl FromStr for GroupField {
    type Err = UnknownGroupField;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "service_name" => Ok(GroupField::ServiceName),
            "service_port" => Ok(GroupField::ServicePort),
            "host" => Ok(GroupField::Host),
            "path" => Ok(GroupField::Path),
            "namespace" => Ok(GroupField::Namespace),
            "name" => Ok(GroupField::Name),
            other => Err(UnknownGroupField(other.to_string())),
        }
    }
}

/// Composite key: field values in the given order joined with `-`, leading separator trimmed.
/// Values are not escaped, so `-` inside a value can make keys collide.
pub fn grouping_key(rule: &IngressRule, fields: &[GroupField]) -> String {
    let mut key = String::new();
    for f in fields {
        key.push('-');
        key.push_str(&f.key_of(rule));
    }
    key.strip_prefix('-').map(str::to_string).unwrap_or(key)
}

/// Partition `rules` by the composite key of `fields`. Order inside each group follows input order.
pub fn group_by(rules: &[IngressRule], fields: &[GroupField]) -> GroupedRuleIndex {
    let mut out = GroupedRuleIndex::new();
    for rule in rules {
        out.entry(grouping_key(rule, fields)).or_default().push(rule.clone());
    }
    out
}

pub fn group_by_host(rules: &[IngressRule]) -> GroupedRuleIndex {
    group_by(rules, &[GroupField::Host])
}

pub fn group_by_path(rules: &[IngressRule]) -> GroupedRuleIndex {
    group_by(rules, &[GroupField::Path])
}

pub fn group_by_svc_ns(rules: &[IngressRule]) -> GroupedRuleIndex {
    group_by(rules, &[GroupField::ServiceName, GroupField::Namespace])
}

// ---- ordering ----

/// Sort direction for [`order_by_path_len`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathOrder {
    /// Shortest path first.
    Ascending,
    /// Longest path first.
    Descending,
}

impl PathOrder {
    pub fn from_ascending(ascending: bool) -> Self {
        if ascending { PathOrder::Ascending } else { PathOrder::Descending }
    }
}

/// Stable sort on path length; equal lengths keep their input order in both directions.
pub fn order_by_path_len(mut rules: RuleSet, order: PathOrder) -> RuleSet {
    match order {
        PathOrder::Ascending => rules.sort_by_key(|r| r.path.len()),
        PathOrder::Descending => rules.sort_by(|a, b| b.path.len().cmp(&a.path.len())),
    }
    rules
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(host: &str, path: &str, svc: &str, ns: &str) -> IngressRule {
        IngressRule {
            hash: rule_hash(ns, "ing", svc, host, path),
            service_name: svc.to_string(),
            host: host.to_string(),
            path: path.to_string(),
            namespace: ns.to_string(),
            name: "ing".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn fnv1a_matches_reference_vectors() {
        assert_eq!(fnv1a_32(b""), 0x811c9dc5);
        assert_eq!(fnv1a_32(b"a"), 0xe40c292c);
        assert_eq!(fnv1a_32(b"foobar"), 0xbf9cf968);
    }

    #[test]
    fn rule_hash_is_plain_concatenation() {
        assert_eq!(rule_hash("ns1", "ing", "svc", "h1", "/a"), fnv1a_32(b"ns1ingsvch1/a"));
    }

    #[test]
    fn grouping_key_joins_in_given_order() {
        let r = rule("h1", "/a", "svc", "ns1");
        assert_eq!(grouping_key(&r, &[GroupField::ServiceName, GroupField::Namespace]), "svc-ns1");
        assert_eq!(grouping_key(&r, &[GroupField::Namespace, GroupField::ServiceName]), "ns1-svc");
        assert_eq!(grouping_key(&r, &[]), "");
    }

    #[test]
    fn grouping_key_only_trims_leading_separator() {
        let r = rule("", "/a", "", "ns1");
        assert_eq!(grouping_key(&r, &[GroupField::Host]), "");
        assert_eq!(grouping_key(&r, &[GroupField::Host, GroupField::Namespace]), "-ns1");
        assert_eq!(grouping_key(&r, &[GroupField::Namespace, GroupField::ServiceName]), "ns1-");
    }

    #[test]
    fn group_field_parses_template_names() {
        assert_eq!("service_name".parse::<GroupField>(), Ok(GroupField::ServiceName));
        assert_eq!("host".parse::<GroupField>(), Ok(GroupField::Host));
        assert!("Host".parse::<GroupField>().is_err());
        for f in [GroupField::ServiceName, GroupField::ServicePort, GroupField::Host, GroupField::Path, GroupField::Namespace, GroupField::Name] {
            assert_eq!(f.as_str().parse::<GroupField>(), Ok(f));
        }
    }

    #[test]
    fn group_by_partitions_losslessly() {
        let rules = vec![
            rule("h1", "/a", "s1", "ns1"),
            rule("h2", "/b", "s1", "ns1"),
            rule("h1", "/c", "s2", "ns2"),
            rule("", "/d", "s2", "ns2"),
        ];
        for fields in [vec![GroupField::Host], vec![GroupField::Path], vec![GroupField::ServiceName, GroupField::Namespace]] {
            let idx = group_by(&rules, &fields);
            assert_eq!(idx.values().map(Vec::len).sum::<usize>(), rules.len());
            for r in &rules {
                let hits = idx.values().flatten().filter(|x| *x == r).count();
                assert_eq!(hits, 1, "rule {:?} must land in exactly one group", r.path);
            }
        }
        let by_svc = group_by_svc_ns(&rules);
        assert_eq!(by_svc.keys().collect::<Vec<_>>(), vec!["s1-ns1", "s2-ns2"]);
        let by_host = group_by_host(&rules);
        let h1: Vec<_> = by_host["h1"].iter().map(|r| r.path.as_str()).collect();
        assert_eq!(h1, vec!["/a", "/c"]);
    }

    #[test]
    fn order_by_path_len_is_stable_both_ways() {
        let rules = vec![
            rule("h", "/long/path", "a", "ns"),
            rule("h", "/x", "b", "ns"),
            rule("h", "/y", "c", "ns"),
            rule("h", "/mid", "d", "ns"),
        ];
        let asc: Vec<_> = order_by_path_len(rules.clone(), PathOrder::Ascending).into_iter().map(|r| r.service_name).collect();
        assert_eq!(asc, vec!["b", "c", "d", "a"]);
        let desc: Vec<_> = order_by_path_len(rules, PathOrder::Descending).into_iter().map(|r| r.service_name).collect();
        assert_eq!(desc, vec!["a", "d", "b", "c"]);
    }

    #[test]
    fn path_order_from_flag() {
        assert_eq!(PathOrder::from_ascending(true), PathOrder::Ascending);
        assert_eq!(PathOrder::from_ascending(false), PathOrder::Descending);
    }
}

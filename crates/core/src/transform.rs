//! Ingress objects -> flat rule set.

use k8s_openapi::api::networking::v1::{HTTPIngressPath, Ingress, IngressRule as KubeIngressRule};
use tracing::debug;

use crate::{rule_hash, IngressRule, RuleSet};

/// Flatten Ingress objects into one rule per (host rule × path).
///
/// A host rule with a non-empty host and no paths still yields one rule with an
/// empty path and backend; with an empty host it yields nothing. Missing
/// collections are treated as empty.
pub fn denormalize(ingresses: &[Ingress]) -> RuleSet {
    let mut out = RuleSet::new();
    for ing in ingresses {
        let namespace = ing.metadata.namespace.as_deref().unwrap_or("");
        let name = ing.metadata.name.as_deref().unwrap_or("");
        let host_rules = ing.spec.as_ref().and_then(|s| s.rules.as_deref()).unwrap_or(&[]);
        for hr in host_rules {
            let host = hr.host.as_deref().unwrap_or("");
            let paths = paths_of(hr);
            if paths.is_empty() {
                if !host.is_empty() {
                    out.push(flat_rule(ing, namespace, name, host, None));
                }
                continue;
            }
            for p in paths {
                out.push(flat_rule(ing, namespace, name, host, Some(p)));
            }
        }
    }
    debug!(ingresses = ingresses.len(), rules = out.len(), "denormalized ingress rules");
    out
}

fn paths_of(rule: &KubeIngressRule) -> &[HTTPIngressPath] {
    rule.http.as_ref().map(|h| h.paths.as_slice()).unwrap_or(&[])
}

fn flat_rule(ing: &Ingress, namespace: &str, name: &str, host: &str, path: Option<&HTTPIngressPath>) -> IngressRule {
    let svc = path.and_then(|p| p.backend.service.as_ref());
    let service_name = svc.map(|s| s.name.clone()).unwrap_or_default();
    let port = svc.and_then(|s| s.port.as_ref());
    let service_port = port.and_then(|p| p.number).unwrap_or(0);
    let service_port_name = port.and_then(|p| p.name.clone()).unwrap_or_default();
    let path = path.and_then(|p| p.path.clone()).unwrap_or_default();
    IngressRule {
        hash: rule_hash(namespace, name, &service_name, host, &path),
        service_name,
        service_port,
        service_port_name,
        host: host.to_string(),
        path,
        namespace: namespace.to_string(),
        name: name.to_string(),
        source: ing.clone(),
    }
}

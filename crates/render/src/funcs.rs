//! Template function tables: rule grouping/ordering plus general string helpers.

use ingressify_core::{GroupField, PathOrder};
use minijinja::value::{Rest, Value};
use minijinja::{Error, ErrorKind};
use tracing::warn;

use crate::adapter::{index_to_value, rules_from_value, rules_to_value};
use crate::FuncTable;

/// Grouping and ordering over the `rules` context value.
pub fn builtin_funcs() -> FuncTable {
    FuncTable::new()
        .with("group_by", Value::from_function(group_by))
        .with("group_by_host", Value::from_function(group_by_host))
        .with("group_by_path", Value::from_function(group_by_path))
        .with("group_by_svc_ns", Value::from_function(group_by_svc_ns))
        .with("order_by_path_len", Value::from_function(order_by_path_len))
}

/// String/number helpers available to every template.
pub fn helper_funcs() -> FuncTable {
    FuncTable::new()
        .with("env", Value::from_function(env_var))
        .with("trim_prefix", Value::from_function(trim_prefix))
        .with("trim_suffix", Value::from_function(trim_suffix))
        .with("has_prefix", Value::from_function(has_prefix))
        .with("has_suffix", Value::from_function(has_suffix))
        .with("contains", Value::from_function(contains))
        .with("split", Value::from_function(split))
        .with("quote", Value::from_function(quote))
        .with("fnv32", Value::from_function(fnv32))
}

fn group_by(rules: Value, fields: Rest<String>) -> Result<Value, Error> {
    if fields.is_empty() {
        return Err(Error::new(ErrorKind::MissingArgument, "group_by needs at least one field"));
    }
    let fields = fields
        .iter()
        .map(|f| f.parse::<GroupField>().map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string())))
        .collect::<Result<Vec<_>, _>>()?;
    let rules = rules_from_value(&rules)?;
    Ok(index_to_value(ingressify_core::group_by(&rules, &fields)))
}

fn group_by_host(rules: Value) -> Result<Value, Error> {
    Ok(index_to_value(ingressify_core::group_by_host(&rules_from_value(&rules)?)))
}

fn group_by_path(rules: Value) -> Result<Value, Error> {
    Ok(index_to_value(ingressify_core::group_by_path(&rules_from_value(&rules)?)))
}

fn group_by_svc_ns(rules: Value) -> Result<Value, Error> {
    Ok(index_to_value(ingressify_core::group_by_svc_ns(&rules_from_value(&rules)?)))
}

/// `order_by_path_len(rules, true)` puts the shortest path first.
fn order_by_path_len(rules: Value, ascending: bool) -> Result<Value, Error> {
    let rules = rules_from_value(&rules)?;
    Ok(rules_to_value(ingressify_core::order_by_path_len(rules, PathOrder::from_ascending(ascending))))
}

/// Environment variable by name; empty (with a warning) when unset.
fn env_var(name: String) -> String {
    match std::env::var(&name) {
        Ok(val) => val,
        Err(_) => {
            warn!(var = %name, "environment variable not found, returning empty string");
            String::new()
        }
    }
}

fn trim_prefix(s: String, prefix: String) -> String {
    s.strip_prefix(prefix.as_str()).map(str::to_string).unwrap_or(s)
}

fn trim_suffix(s: String, suffix: String) -> String {
    s.strip_suffix(suffix.as_str()).map(str::to_string).unwrap_or(s)
}

fn has_prefix(s: String, prefix: String) -> bool { s.starts_with(prefix.as_str()) }

fn has_suffix(s: String, suffix: String) -> bool { s.ends_with(suffix.as_str()) }

fn contains(s: String, sub: String) -> bool { s.contains(sub.as_str()) }

fn split(s: String, sep: String) -> Vec<String> {
    s.split(sep.as_str()).map(str::to_string).collect()
}

fn quote(s: String) -> String { format!("{:?}", s) }

fn fnv32(s: String) -> u32 { ingressify_core::fnv1a_32(s.as_bytes()) }

//! Conversion between typed rule collections and template values.
//!
//! Rules cross into the template engine only through this module: a rule set
//! becomes a sequence object that keeps the typed rules alongside their
//! rendered values, so template functions can take them back without
//! re-parsing.

use std::sync::Arc;

use ingressify_core::{GroupedRuleIndex, IngressRule, RuleSet};
use minijinja::value::{Enumerator, Object, ObjectRepr, Value, ValueKind};
use minijinja::{Error, ErrorKind};
use serde::Deserialize;

#[derive(Debug)]
struct RuleSeq {
    rules: RuleSet,
    values: Vec<Value>,
}

impl Object for RuleSeq {
    fn repr(self: &Arc<Self>) -> ObjectRepr {
        ObjectRepr::Seq
    }

    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        let idx = usize::try_from(key.clone()).ok()?;
        self.values.get(idx).cloned()
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        Enumerator::Seq(self.values.len())
    }
}

pub fn rules_to_value(rules: RuleSet) -> Value {
    let values = rules.iter().map(Value::from_serialize).collect();
    Value::from_object(RuleSeq { rules, values })
}

/// Map of group key -> rule sequence; keys iterate in sorted order.
pub fn index_to_value(index: GroupedRuleIndex) -> Value {
    Value::from_iter(index.into_iter().map(|(k, v)| (k, rules_to_value(v))))
}

pub fn rules_from_value(value: &Value) -> Result<RuleSet, Error> {
    if let Some(seq) = value.downcast_object_ref::<RuleSeq>() {
        return Ok(seq.rules.clone());
    }
    // lists and iterators rebuilt inside the template (sort, reverse, selectattr, ...)
    // lose the typed side
    let items = match value.kind() {
        ValueKind::String | ValueKind::Map => None,
        _ => value.try_iter().ok(),
    };
    let items = items.ok_or_else(|| {
        Error::new(ErrorKind::InvalidOperation, format!("expected a list of ingress rules, got {}", value.kind()))
    })?;
    let mut out = RuleSet::new();
    for item in items {
        out.push(IngressRule::deserialize(item)?);
    }
    Ok(out)
}

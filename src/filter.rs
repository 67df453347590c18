//! The subscription filter evaluator: `(filter, message) -> bool`
//! (SPEC_FULL.md §4.7). The predicate language itself is opaque to the core
//! engine; this module owns one baseline evaluator and the trait boundary so
//! a richer grammar can be swapped in without touching `worker.rs`.

use serde_json::Value;

pub trait MessageFilter: Send + Sync {
    fn matches(&self, filter: &str, message: &Value) -> bool;
}

/// `field=value` equality over the message's top-level JSON object fields.
/// Any filter text that doesn't parse as `field=value` is treated as
/// non-matching rather than a panic or a silent pass-through.
pub struct EqualityFilter;

impl MessageFilter for EqualityFilter {
    fn matches(&self, filter: &str, message: &Value) -> bool {
        let Some((field, expected)) = filter.split_once('=') else {
            return false;
        };
        match message.get(field.trim()) {
            Some(Value::String(s)) => s == expected.trim(),
            Some(other) => other.to_string() == expected.trim(),
            None => false,
        }
    }
}

use std::collections::BTreeMap;
use serde_json::Value as JsonValue;

/// Metric name -> value snapshot handed to observability tooling
pub type StatusMap = BTreeMap<String, JsonValue>;

/// Components that contribute entries to a status snapshot
pub trait StatusSource {
    fn fill_status(&self, prefix: &str, status: &mut StatusMap);
}

pub fn put<V: Into<JsonValue>>(status: &mut StatusMap, prefix: &str, key: &str, value: V) {
    status.insert(format!("{}.{}", prefix, key), value.into());
}

use std::collections::BTreeMap;

use serde_json::Value;

/// Per-instance key/value scope. Owned by exactly one executor while a run is
/// in flight and handed back to the instance when the run ends.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KvScope {
    entries: BTreeMap<String, Value>,
}

impl KvScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Returns the previous value, if any.
    pub fn put(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.entries.insert(key.into(), value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

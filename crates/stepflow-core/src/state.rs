use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Key/value store carried by a run.
///
/// Used both as the run-wide shared state (visible to every executor) and as
/// each executor's private local state. Keys are unique and writes are
/// last-writer-wins. Backed by a `BTreeMap` so snapshots serialize in a
/// stable key order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateMap {
    data: BTreeMap<String, serde_json::Value>,
}

/// Per-run state shared by all executors.
pub type SharedState = StateMap;

/// State private to one executor within one run.
pub type LocalState = StateMap;

impl StateMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a value by key.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    /// Get a value as a string, if it's a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    /// Set a value, returning the one it replaced.
    pub fn set(
        &mut self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Option<serde_json::Value> {
        self.data.insert(key.into(), value)
    }

    /// Set a string value.
    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data
            .insert(key.into(), serde_json::Value::String(value.into()));
    }

    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.data.remove(key)
    }

    /// Merge another map into this one (overwrites on conflict).
    pub fn merge(&mut self, other: &StateMap) {
        for (k, v) in &other.data {
            self.data.insert(k.clone(), v.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Get the underlying data map.
    pub fn data(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.data
    }
}

impl From<BTreeMap<String, serde_json::Value>> for StateMap {
    fn from(data: BTreeMap<String, serde_json::Value>) -> Self {
        Self { data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_operations() {
        let mut state = SharedState::new();
        state.set_str("name", "Alice");
        state.set("count", serde_json::json!(42));

        assert_eq!(state.get_str("name"), Some("Alice"));
        assert_eq!(state.get("count"), Some(&serde_json::json!(42)));
        assert_eq!(state.get("missing"), None);
        assert_eq!(state.len(), 2);
    }

    #[test]
    fn test_last_write_wins() {
        let mut state = SharedState::new();
        assert!(state.set("k", serde_json::json!(1)).is_none());
        let previous = state.set("k", serde_json::json!(2));
        assert_eq!(previous, Some(serde_json::json!(1)));
        assert_eq!(state.get("k"), Some(&serde_json::json!(2)));
    }

    #[test]
    fn test_merge() {
        let mut a = LocalState::new();
        a.set_str("a", "1");
        a.set_str("b", "2");

        let mut b = LocalState::new();
        b.set_str("b", "overwritten");
        b.set_str("c", "3");

        a.merge(&b);

        assert_eq!(a.get_str("a"), Some("1"));
        assert_eq!(a.get_str("b"), Some("overwritten"));
        assert_eq!(a.get_str("c"), Some("3"));
    }

    #[test]
    fn test_serializes_as_plain_object() {
        let mut state = SharedState::new();
        state.set_str("z", "last");
        state.set_str("a", "first");
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, r#"{"a":"first","z":"last"}"#);
    }
}

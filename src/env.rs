//! Registry of serialized environment objects shared with peers.
//!
//! The hub owns one registry for its lifetime. Values are opaque bytes;
//! the registry only tracks which names exist so dispatch can compute
//! what a given peer is still missing. A `BTreeMap` keeps name order
//! deterministic, which keeps dispatch frames reproducible.

use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Default)]
pub struct EnvRegistry {
    values: BTreeMap<String, Vec<u8>>,
}

impl EnvRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `name`, replacing any previous value.
    ///
    /// Returns `true` when an existing value was replaced; the caller
    /// then invalidates the name from every peer's known set so the new
    /// value is retransmitted.
    pub fn insert(&mut self, name: impl Into<String>, value: Vec<u8>) -> bool {
        self.values.insert(name.into(), value).is_some()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.values.get(name).map(Vec::as_slice)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Registered names not yet in `known`, in name order.
    #[must_use]
    pub fn missing_from(&self, known: &HashSet<String>) -> Vec<&str> {
        self.values
            .keys()
            .filter(|name| !known.contains(name.as_str()))
            .map(String::as_str)
            .collect()
    }

    /// Snapshot of names with their serialized sizes, in name order.
    #[must_use]
    pub fn list(&self) -> Vec<(String, usize)> {
        self.values
            .iter()
            .map(|(name, value)| (name.clone(), value.len()))
            .collect()
    }

    /// Drops every stored value. Only used at teardown.
    pub fn clear(&mut self) {
        self.values.clear();
    }
}

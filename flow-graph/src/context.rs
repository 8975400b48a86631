use dashmap::DashMap;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::error::{GraphError, Result};

/// Shared state for one graph execution, keyed by name.
///
/// Tasks conventionally store their output under their own task id so that
/// downstream tasks (and joins) can read every upstream result.
#[derive(Clone, Debug)]
pub struct Context {
    data: Arc<DashMap<String, Value>>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            data: Arc::new(DashMap::new()),
        }
    }

    pub async fn set(&self, key: impl Into<String>, value: impl serde::Serialize) -> Result<()> {
        let key = key.into();
        let value = serde_json::to_value(value)
            .map_err(|e| GraphError::ContextError(format!("cannot serialize '{key}': {e}")))?;
        self.data.insert(key, value);
        Ok(())
    }

    pub async fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_sync(key)
    }

    pub fn get_sync<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.data
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Like `get`, but a missing or mistyped value is an error naming the key.
    pub async fn require<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .data
            .get(key)
            .map(|v| v.clone())
            .ok_or_else(|| GraphError::ContextError(format!("{key} not found in context")))?;
        serde_json::from_value(value)
            .map_err(|e| GraphError::ContextError(format!("{key} has unexpected shape: {e}")))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub async fn remove(&self, key: &str) -> Option<Value> {
        self.data.remove(key).map(|(_, v)| v)
    }

    pub async fn clear(&self) {
        self.data.clear();
    }

    /// Copy of the whole state, keys sorted.
    pub fn snapshot(&self) -> Map<String, Value> {
        let mut entries: Vec<(String, Value)> = self
            .data
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries.into_iter().collect()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

use crate::errors::{RemixError, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::{Mutex, RwLock};

pub const SETTINGS_KEY: &str = "settings";
pub const ELEMENTS_KEY: &str = "elements";
pub const CONVERSATIONS_PREFIX: &str = "conversations:";

/// External key-value persistence with get/set semantics.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Held across a read-modify-write of any key. Shared by every handle
    /// onto the same store.
    fn write_lock(&self) -> &Mutex<()>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, Value>>,
    writes: Mutex<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.values.write().await.insert(key.to_string(), value);
        Ok(())
    }

    fn write_lock(&self) -> &Mutex<()> {
        &self.writes
    }
}

/// Whole-document JSON file, rewritten on every `set`.
pub struct JsonFileStore {
    path: PathBuf,
    cache: RwLock<Option<Map<String, Value>>>,
    writes: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: RwLock::new(None),
            writes: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<Map<String, Value>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) if raw.trim().is_empty() => Ok(Map::new()),
            Ok(raw) => match serde_json::from_str::<Value>(&raw)? {
                Value::Object(map) => Ok(map),
                _ => Err(RemixError::Storage(format!(
                    "{} does not contain a JSON object",
                    self.path.display()
                ))),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        if let Some(map) = self.cache.read().await.as_ref() {
            return Ok(map.get(key).cloned());
        }
        let map = self.load().await?;
        let value = map.get(key).cloned();
        *self.cache.write().await = Some(map);
        Ok(value)
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut cache = self.cache.write().await;
        let mut map = match cache.take() {
            Some(map) => map,
            None => self.load().await?,
        };
        map.insert(key.to_string(), value);

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let serialized = serde_json::to_string_pretty(&Value::Object(map.clone()))?;
        tokio::fs::write(&self.path, serialized).await?;
        *cache = Some(map);
        Ok(())
    }

    fn write_lock(&self) -> &Mutex<()> {
        &self.writes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn memory_store_round_trips_values() {
        let store = MemoryStore::new();
        assert!(store.get("missing").await.unwrap().is_none());
        store.set("k", json!({"a": 1})).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn json_file_store_persists_across_instances() {
        let path = std::env::temp_dir().join(format!(
            "browser-remix-store-{}.json",
            uuid::Uuid::new_v4()
        ));

        let store = JsonFileStore::new(&path);
        store.set(SETTINGS_KEY, json!({"model": "m"})).await.unwrap();
        store.set(ELEMENTS_KEY, json!([])).await.unwrap();

        let reopened = JsonFileStore::new(&path);
        assert_eq!(
            reopened.get(SETTINGS_KEY).await.unwrap(),
            Some(json!({"model": "m"}))
        );
        assert_eq!(reopened.get(ELEMENTS_KEY).await.unwrap(), Some(json!([])));

        let _ = std::fs::remove_file(path);
    }
}

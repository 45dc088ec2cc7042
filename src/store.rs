//! Persistence collaborators: the enablement store and plugin key-value storage.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Records which plugins should be enabled when the host starts.
#[async_trait]
pub trait EnablementStore: Send + Sync {
    /// Identifiers of previously enabled plugins, sorted.
    async fn get_enabled_plugin_ids(&self) -> Result<Vec<String>>;

    /// Mark a plugin as enabled.
    async fn set_enabled(&self, id: &str) -> Result<()>;

    /// Remove a plugin from the enabled set.
    async fn clear_enabled(&self, id: &str) -> Result<()>;
}

/// Generic key-value storage shared by plugins through [`NamespacedStore`].
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a value.
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Write a value.
    async fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Delete a value. Returns true if it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Keys starting with `prefix`, sorted.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StoreState {
    #[serde(default)]
    enabled: BTreeSet<String>,
    #[serde(default)]
    values: BTreeMap<String, Value>,
}

impl StoreState {
    fn keys(&self, prefix: &str) -> Vec<String> {
        self.values
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }
}

/// In-memory store, lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with plugins already marked enabled.
    pub fn with_enabled<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            state: Mutex::new(StoreState {
                enabled: ids.into_iter().map(Into::into).collect(),
                values: BTreeMap::new(),
            }),
        }
    }
}

#[async_trait]
impl EnablementStore for MemoryStore {
    async fn get_enabled_plugin_ids(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().await.enabled.iter().cloned().collect())
    }

    async fn set_enabled(&self, id: &str) -> Result<()> {
        self.state.lock().await.enabled.insert(id.to_string());
        Ok(())
    }

    async fn clear_enabled(&self, id: &str) -> Result<()> {
        self.state.lock().await.enabled.remove(id);
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.state.lock().await.values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.state.lock().await.values.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.state.lock().await.values.remove(key).is_some())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self.state.lock().await.keys(prefix))
    }
}

/// Store persisted as a single JSON document, rewritten on every change.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl FileStore {
    /// Open a store, creating an empty one if the file does not exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| Error::store(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreState::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, state: &StoreState) -> Result<()> {
        let content = serde_json::to_string_pretty(state).map_err(|e| Error::store(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl EnablementStore for FileStore {
    async fn get_enabled_plugin_ids(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().await.enabled.iter().cloned().collect())
    }

    async fn set_enabled(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.enabled.insert(id.to_string()) {
            self.persist(&state).await?;
        }
        Ok(())
    }

    async fn clear_enabled(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.enabled.remove(id) {
            self.persist(&state).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.state.lock().await.values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut state = self.state.lock().await;
        state.values.insert(key.to_string(), value);
        self.persist(&state).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let existed = state.values.remove(key).is_some();
        if existed {
            self.persist(&state).await?;
        }
        Ok(existed)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self.state.lock().await.keys(prefix))
    }
}

/// Key-value access confined to one plugin's `plugin:<name>:` prefix.
#[derive(Clone)]
pub struct NamespacedStore {
    prefix: String,
    inner: Arc<dyn KeyValueStore>,
}

impl NamespacedStore {
    /// Create a view of `inner` scoped to `plugin`.
    pub fn new(plugin: &str, inner: Arc<dyn KeyValueStore>) -> Self {
        Self {
            prefix: format!("plugin:{}:", plugin),
            inner,
        }
    }

    /// Key prefix applied to every operation.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Read a value.
    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.inner.get(&self.key(key)).await
    }

    /// Read and deserialize a value.
    pub async fn get_as<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| Error::store(format!("{}{}: {}", self.prefix, key, e))),
            None => Ok(None),
        }
    }

    /// Write a value.
    pub async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.inner.set(&self.key(key), value).await
    }

    /// Delete a value.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.inner.delete(&self.key(key)).await
    }

    /// Keys owned by this plugin, without the prefix.
    pub async fn keys(&self) -> Result<Vec<String>> {
        let keys = self.inner.keys(&self.prefix).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&self.prefix).map(str::to_string))
            .collect())
    }

    /// Delete every key owned by this plugin. Returns the number removed.
    pub async fn clear(&self) -> Result<usize> {
        let keys = self.inner.keys(&self.prefix).await?;
        let mut removed = 0;
        for key in keys {
            if self.inner.delete(&key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

impl std::fmt::Debug for NamespacedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespacedStore")
            .field("prefix", &self.prefix)
            .finish()
    }
}

//! Settings persistence contract and the cached snapshot the page reads.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, warn};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("settings store unavailable: {0}")]
    Unavailable(String),
    #[error("settings io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A change notification: `key` moved from `old_value` to `new_value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageChange {
    pub key: String,
    pub new_value: Option<Value>,
    pub old_value: Option<Value>,
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;
    async fn set(&self, key: &str, value: Value) -> Result<(), StorageError>;
    async fn entries(&self) -> Result<BTreeMap<String, Value>, StorageError>;
    fn subscribe(&self) -> broadcast::Receiver<StorageChange>;
}

/// Volatile store, used in tests and as a fallback when no file is given.
pub struct MemoryStore {
    values: RwLock<BTreeMap<String, Value>>,
    changes: broadcast::Sender<StorageChange>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            values: RwLock::new(BTreeMap::new()),
            changes,
        }
    }

    pub fn with_values(values: impl IntoIterator<Item = (String, Value)>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            values: RwLock::new(values.into_iter().collect()),
            changes,
        }
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let old_value = self
            .values
            .write()
            .await
            .insert(key.to_string(), value.clone());
        if old_value.as_ref() != Some(&value) {
            // No receivers is fine: nobody is listening yet.
            let _ = self.changes.send(StorageChange {
                key: key.to_string(),
                new_value: Some(value),
                old_value,
            });
        }
        Ok(())
    }

    async fn entries(&self) -> Result<BTreeMap<String, Value>, StorageError> {
        Ok(self.values.read().await.clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }
}

/// JSON-file backed store. The whole map is rewritten on every `set`.
pub struct FileStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, Value>>,
    changes: broadcast::Sender<StorageChange>,
}

impl FileStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let values = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!("Opened settings file {} ({} keys)", path.display(), values.len());
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            path,
            values: Mutex::new(values),
            changes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SettingsStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let mut values = self.values.lock().await;
        let old_value = values.get(key).cloned();
        if old_value.as_ref() == Some(&value) {
            return Ok(());
        }

        let mut next = values.clone();
        next.insert(key.to_string(), value.clone());
        let bytes = serde_json::to_vec_pretty(&next)?;
        tokio::fs::write(&self.path, bytes).await?;
        *values = next;
        drop(values);

        let _ = self.changes.send(StorageChange {
            key: key.to_string(),
            new_value: Some(value),
            old_value,
        });
        Ok(())
    }

    async fn entries(&self) -> Result<BTreeMap<String, Value>, StorageError> {
        Ok(self.values.lock().await.clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPrefixes {
    pub feature: String,
    pub preference: String,
}

impl Default for KeyPrefixes {
    fn default() -> Self {
        Self {
            feature: "feature:".to_string(),
            preference: "pref:".to_string(),
        }
    }
}

/// Cached flags and preferences. Only [`Settings`] mutates it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsSnapshot {
    features: BTreeMap<String, bool>,
    preferences: BTreeMap<String, Value>,
}

impl SettingsSnapshot {
    pub fn feature_enabled(&self, id: &str) -> Option<bool> {
        self.features.get(id).copied()
    }

    pub fn preference(&self, key: &str) -> Option<&Value> {
        self.preferences.get(key)
    }

    pub fn preference_or<'a>(&'a self, key: &str, default: &'a Value) -> &'a Value {
        self.preferences.get(key).unwrap_or(default)
    }

    pub fn with_feature(mut self, id: &str, enabled: bool) -> Self {
        self.features.insert(id.to_string(), enabled);
        self
    }

    pub fn with_preference(mut self, key: &str, value: Value) -> Self {
        self.preferences.insert(key.to_string(), value);
        self
    }
}

/// What a store change means to the page.
#[derive(Debug, Clone, PartialEq)]
pub enum SettingsEvent {
    FeatureToggled { id: String, enabled: bool },
    PreferenceChanged { key: String },
}

/// Typed access to a [`SettingsStore`] plus the snapshot it feeds.
pub struct Settings {
    store: Arc<dyn SettingsStore>,
    prefixes: KeyPrefixes,
    defaults: BTreeMap<String, bool>,
    snapshot: SettingsSnapshot,
}

impl Settings {
    pub fn new(store: Arc<dyn SettingsStore>, prefixes: KeyPrefixes) -> Self {
        Self {
            store,
            prefixes,
            defaults: BTreeMap::new(),
            snapshot: SettingsSnapshot::default(),
        }
    }

    pub fn store(&self) -> Arc<dyn SettingsStore> {
        Arc::clone(&self.store)
    }

    pub fn snapshot(&self) -> &SettingsSnapshot {
        &self.snapshot
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.store.subscribe()
    }

    fn feature_key(&self, id: &str) -> String {
        format!("{}{}", self.prefixes.feature, id)
    }

    fn preference_key(&self, key: &str) -> String {
        format!("{}{}", self.prefixes.preference, key)
    }

    /// Stored flag for `id`, or `default` when absent, malformed or when the
    /// store fails.
    pub async fn feature_state(&self, id: &str, default: bool) -> bool {
        match self.store.get(&self.feature_key(id)).await {
            Ok(Some(Value::Bool(enabled))) => enabled,
            Ok(Some(other)) => {
                warn!("Ignoring non-boolean flag for '{}': {}", id, other);
                default
            }
            Ok(None) => default,
            Err(e) => {
                warn!("Could not read flag for '{}', using default {}: {}", id, default, e);
                default
            }
        }
    }

    pub async fn set_feature_state(&self, id: &str, enabled: bool) -> Result<(), StorageError> {
        self.store
            .set(&self.feature_key(id), Value::Bool(enabled))
            .await
    }

    pub async fn user_preference(&self, key: &str, default: Value) -> Value {
        match self.store.get(&self.preference_key(key)).await {
            Ok(Some(value)) => value,
            Ok(None) => default,
            Err(e) => {
                warn!("Could not read preference '{}': {}", key, e);
                default
            }
        }
    }

    pub async fn set_user_preference(&self, key: &str, value: Value) -> Result<(), StorageError> {
        self.store.set(&self.preference_key(key), value).await
    }

    /// Rebuilds the snapshot from the store. `features` lists every registered
    /// id with its declared default.
    pub async fn load(&mut self, features: &[(String, bool)]) {
        let mut snapshot = SettingsSnapshot::default();
        self.defaults = features.iter().cloned().collect();
        for (id, default) in features {
            let enabled = self.feature_state(id, *default).await;
            snapshot.features.insert(id.clone(), enabled);
        }
        match self.store.entries().await {
            Ok(entries) => {
                for (key, value) in entries {
                    if let Some(pref) = key.strip_prefix(self.prefixes.preference.as_str()) {
                        snapshot.preferences.insert(pref.to_string(), value);
                    }
                }
            }
            Err(e) => warn!("Could not load preferences, using defaults: {}", e),
        }
        self.snapshot = snapshot;
    }

    /// Folds a store notification into the snapshot. Keys outside both
    /// namespaces and no-op changes produce no event.
    pub fn apply_change(&mut self, change: &StorageChange) -> Option<SettingsEvent> {
        if let Some(id) = change.key.strip_prefix(self.prefixes.feature.as_str()) {
            let enabled = match &change.new_value {
                Some(Value::Bool(enabled)) => Some(*enabled),
                Some(other) => {
                    warn!("Ignoring non-boolean flag change for '{}': {}", id, other);
                    self.defaults.get(id).copied()
                }
                None => self.defaults.get(id).copied(),
            };
            // Unregistered ids have no default to fall back to.
            let Some(enabled) = enabled else {
                self.snapshot.features.remove(id);
                return None;
            };
            if self.snapshot.features.get(id) == Some(&enabled) {
                return None;
            }
            self.snapshot.features.insert(id.to_string(), enabled);
            return Some(SettingsEvent::FeatureToggled {
                id: id.to_string(),
                enabled,
            });
        }

        if let Some(key) = change.key.strip_prefix(self.prefixes.preference.as_str()) {
            let changed = match &change.new_value {
                Some(value) => self.snapshot.preferences.insert(key.to_string(), value.clone())
                    != Some(value.clone()),
                None => self.snapshot.preferences.remove(key).is_some(),
            };
            return changed.then(|| SettingsEvent::PreferenceChanged {
                key: key.to_string(),
            });
        }

        None
    }
}

//! Durable client-side storage: the key-value store abstraction, the shared
//! RoadmapStore cache with publish-on-write change notifications, and the
//! anonymous shadow identity.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dpg_core::Opportunity;
use thiserror::Error;
use tokio::fs;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "dpg-store";

pub const ROADMAP_KEY: &str = "dpg_roadmap";
pub const SHADOW_ID_KEY: &str = "dpg_shadow_id";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error for key {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt value for key {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Scoped durable key-value storage, the device-local persistence boundary.
#[async_trait]
pub trait ClientStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// File-backed store: one file per key under a root directory, written via
/// temp-file + atomic rename so a crash never leaves a torn value.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }
}

#[async_trait]
impl ClientStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(self.path_for(key)).await {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::Io {
                key: key.to_string(),
                source: err,
            }),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let io = |source| StoreError::Io {
            key: key.to_string(),
            source,
        };
        fs::create_dir_all(&self.root).await.map_err(io)?;
        let target = self.path_for(key);
        let temp = self.root.join(format!(".{}.{key}.tmp", Uuid::new_v4()));
        fs::write(&temp, value).await.map_err(io)?;
        if let Err(err) = fs::rename(&temp, &target).await {
            let _ = fs::remove_file(&temp).await;
            return Err(io(err));
        }
        Ok(())
    }
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl ClientStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Returns the durable anonymous shadow id, creating one on first use.
pub async fn ensure_shadow_id(store: &dyn ClientStore) -> Result<Uuid, StoreError> {
    if let Some(raw) = store.get(SHADOW_ID_KEY).await? {
        if let Ok(id) = raw.trim().parse::<Uuid>() {
            return Ok(id);
        }
        debug!("discarding unparseable shadow id");
    }
    let id = Uuid::new_v4();
    store.set(SHADOW_ID_KEY, &id.to_string()).await?;
    Ok(id)
}

/// Change notification published after every store mutation so all mounted
/// views re-render from the same source of truth.
#[derive(Debug, Clone)]
pub struct RoadmapEvent {
    pub titles: Vec<String>,
}

/// Outcome of the local half of a toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalToggle {
    Added,
    Removed,
}

/// The single shared mutable client cache of saved opportunities.
///
/// Entries are ordered by insertion and unique by title. Every mutation
/// persists the full set to the injected [`ClientStore`] and then broadcasts
/// a [`RoadmapEvent`]; readers subscribe rather than polling storage.
pub struct RoadmapStore {
    store: Arc<dyn ClientStore>,
    entries: Mutex<Vec<Opportunity>>,
    events: broadcast::Sender<RoadmapEvent>,
}

impl RoadmapStore {
    pub fn new(store: Arc<dyn ClientStore>) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            store,
            entries: Mutex::new(Vec::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoadmapEvent> {
        self.events.subscribe()
    }

    /// Loads the persisted set into memory. Call once per session before the
    /// first read; an absent key is an empty roadmap, not an error.
    pub async fn hydrate(&self) -> Result<Vec<Opportunity>, StoreError> {
        let loaded: Vec<Opportunity> = match self.store.get(ROADMAP_KEY).await? {
            Some(raw) => serde_json::from_str(&raw).map_err(|source| StoreError::Corrupt {
                key: ROADMAP_KEY.to_string(),
                source,
            })?,
            None => Vec::new(),
        };
        let mut entries = self.entries.lock().await;
        *entries = loaded.clone();
        Ok(loaded)
    }

    pub async fn snapshot(&self) -> Vec<Opportunity> {
        self.entries.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn contains(&self, title: &str) -> bool {
        self.entries.lock().await.iter().any(|o| o.title == title)
    }

    /// Idempotent toggle keyed by title. Persists and publishes before
    /// returning; the caller decides whether a network push follows.
    /// Returns the new full set alongside the action so a push can carry the
    /// exact state computed at issue time.
    pub async fn toggle(
        &self,
        opportunity: &Opportunity,
    ) -> Result<(LocalToggle, Vec<Opportunity>), StoreError> {
        let mut entries = self.entries.lock().await;
        let action = match entries.iter().position(|o| o.title == opportunity.title) {
            Some(idx) => {
                entries.remove(idx);
                LocalToggle::Removed
            }
            None => {
                entries.push(opportunity.clone());
                LocalToggle::Added
            }
        };
        let snapshot = entries.clone();
        self.persist_and_publish(&entries).await?;
        Ok((action, snapshot))
    }

    /// Title-keyed removal. Returns the post-removal set when a matching
    /// entry existed, `None` otherwise (no write, no event).
    pub async fn remove_by_title(
        &self,
        title: &str,
    ) -> Result<Option<Vec<Opportunity>>, StoreError> {
        let mut entries = self.entries.lock().await;
        let Some(idx) = entries.iter().position(|o| o.title == title) else {
            return Ok(None);
        };
        entries.remove(idx);
        let snapshot = entries.clone();
        self.persist_and_publish(&entries).await?;
        Ok(Some(snapshot))
    }

    /// Additive union by title: existing (local) entries win on conflict,
    /// unseen titles are appended in their incoming order. Never subtractive.
    pub async fn merge_additive(
        &self,
        incoming: Vec<Opportunity>,
    ) -> Result<Vec<Opportunity>, StoreError> {
        let mut entries = self.entries.lock().await;
        for opp in incoming {
            if !entries.iter().any(|o| o.title == opp.title) {
                entries.push(opp);
            }
        }
        let snapshot = entries.clone();
        self.persist_and_publish(&entries).await?;
        Ok(snapshot)
    }

    async fn persist_and_publish(&self, entries: &[Opportunity]) -> Result<(), StoreError> {
        let raw = serde_json::to_string(entries).map_err(|source| StoreError::Corrupt {
            key: ROADMAP_KEY.to_string(),
            source,
        })?;
        self.store.set(ROADMAP_KEY, &raw).await?;
        let _ = self.events.send(RoadmapEvent {
            titles: entries.iter().map(|o| o.title.clone()).collect(),
        });
        Ok(())
    }
}

//! In-memory storage driver
//!
//! Keeps revisions in process memory. Used by tests and by embedders that
//! don't need durable history.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

use super::{StorageDriver, ensure_status};
use crate::error::{KubeError, Result};
use crate::release::{ReleaseStatus, StoredRelease};

/// (namespace, name) -> version -> revision
type Store = BTreeMap<(String, String), BTreeMap<u32, StoredRelease>>;

/// In-memory storage driver
#[derive(Clone, Default)]
pub struct MemoryDriver {
    store: Arc<RwLock<Store>>,
    counters: Arc<Counters>,
}

#[derive(Default)]
struct Counters {
    gets: AtomicUsize,
    lists: AtomicUsize,
    creates: AtomicUsize,
    updates: AtomicUsize,
    deletes: AtomicUsize,
}

/// Counts of operations performed, for test assertions
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OperationCounts {
    pub gets: usize,
    pub lists: usize,
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with pre-populated revisions
    pub fn with_releases(releases: impl IntoIterator<Item = StoredRelease>) -> Self {
        let mut store = Store::new();
        for release in releases {
            store
                .entry((release.namespace.clone(), release.name.clone()))
                .or_default()
                .insert(release.version, release);
        }
        Self {
            store: Arc::new(RwLock::new(store)),
            counters: Arc::default(),
        }
    }

    pub fn operation_counts(&self) -> OperationCounts {
        let c = &self.counters;
        OperationCounts {
            gets: c.gets.load(Ordering::Relaxed),
            lists: c.lists.load(Ordering::Relaxed),
            creates: c.creates.load(Ordering::Relaxed),
            updates: c.updates.load(Ordering::Relaxed),
            deletes: c.deletes.load(Ordering::Relaxed),
        }
    }

    /// Total number of stored revisions
    pub async fn release_count(&self) -> usize {
        self.store.read().await.values().map(BTreeMap::len).sum()
    }

    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

fn key(namespace: &str, name: &str) -> (String, String) {
    (namespace.to_string(), name.to_string())
}

fn release_not_found(namespace: &str, name: &str) -> KubeError {
    KubeError::ReleaseNotFound {
        name: name.to_string(),
        namespace: namespace.to_string(),
    }
}

#[async_trait]
impl StorageDriver for MemoryDriver {
    async fn get(&self, namespace: &str, name: &str, version: u32) -> Result<StoredRelease> {
        Self::bump(&self.counters.gets);
        self.store
            .read()
            .await
            .get(&key(namespace, name))
            .and_then(|versions| versions.get(&version))
            .cloned()
            .ok_or_else(|| KubeError::RevisionNotFound {
                name: name.to_string(),
                version,
            })
    }

    async fn history(&self, namespace: &str, name: &str) -> Result<Vec<StoredRelease>> {
        Self::bump(&self.counters.lists);
        let store = self.store.read().await;
        match store.get(&key(namespace, name)) {
            Some(versions) if !versions.is_empty() => Ok(versions.values().cloned().collect()),
            _ => Err(release_not_found(namespace, name)),
        }
    }

    async fn list(
        &self,
        namespace: Option<&str>,
        name: Option<&str>,
    ) -> Result<Vec<StoredRelease>> {
        Self::bump(&self.counters.lists);
        let store = self.store.read().await;
        Ok(store
            .iter()
            .filter(|((ns, n), _)| {
                namespace.is_none_or(|f| f == ns) && name.is_none_or(|f| f == n)
            })
            .flat_map(|(_, versions)| versions.values().cloned())
            .collect())
    }

    async fn create(&self, release: &StoredRelease) -> Result<()> {
        Self::bump(&self.counters.creates);
        // Check and insert under one write guard
        let mut store = self.store.write().await;
        let versions = store
            .entry(key(&release.namespace, &release.name))
            .or_default();

        if versions.contains_key(&release.version) {
            return Err(KubeError::RevisionExists {
                name: release.name.clone(),
                version: release.version,
            });
        }

        versions.insert(release.version, release.clone());
        Ok(())
    }

    async fn update(&self, release: &StoredRelease) -> Result<()> {
        Self::bump(&self.counters.updates);
        let mut store = self.store.write().await;
        let slot = store
            .get_mut(&key(&release.namespace, &release.name))
            .and_then(|versions| versions.get_mut(&release.version))
            .ok_or_else(|| KubeError::RevisionNotFound {
                name: release.name.clone(),
                version: release.version,
            })?;
        *slot = release.clone();
        Ok(())
    }

    async fn update_if(&self, release: &StoredRelease, expected: ReleaseStatus) -> Result<()> {
        Self::bump(&self.counters.updates);
        // Compare and replace under one write guard
        let mut store = self.store.write().await;
        let slot = store
            .get_mut(&key(&release.namespace, &release.name))
            .and_then(|versions| versions.get_mut(&release.version))
            .ok_or_else(|| KubeError::RevisionNotFound {
                name: release.name.clone(),
                version: release.version,
            })?;
        ensure_status(slot, expected)?;
        *slot = release.clone();
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str, version: u32) -> Result<StoredRelease> {
        Self::bump(&self.counters.deletes);
        let mut store = self.store.write().await;
        let k = key(namespace, name);
        let versions = store
            .get_mut(&k)
            .ok_or_else(|| release_not_found(namespace, name))?;
        let removed = versions
            .remove(&version)
            .ok_or_else(|| KubeError::RevisionNotFound {
                name: name.to_string(),
                version,
            })?;
        if versions.is_empty() {
            store.remove(&k);
        }
        Ok(removed)
    }

    async fn delete_all(&self, namespace: &str, name: &str) -> Result<Vec<StoredRelease>> {
        Self::bump(&self.counters.deletes);
        self.store
            .write()
            .await
            .remove(&key(namespace, name))
            .filter(|versions| !versions.is_empty())
            .map(|versions| versions.into_values().collect())
            .ok_or_else(|| release_not_found(namespace, name))
    }
}

//! Cache-aside layer in front of a cluster's logout affinity store.
//!
//! Lookups hit the store at most once per key until the key is evicted;
//! absent results are cached too. Writes go to the store first and the
//! cached entry is replaced while the key's bucket is still locked, so a
//! concurrent loader can never install a value older than the last write.

use scc::hash_map::Entry;
use serverclusters_db::{StorageError, ValueStorage};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;
use uuid::Uuid;

pub const DEFAULT_CAPACITY: usize = 1000;

struct Slot {
    /// `None` caches a miss.
    server: Option<String>,
    touched: u64,
}

pub struct LogoutAffinityCache {
    storage: Arc<dyn ValueStorage>,
    entries: scc::HashMap<Uuid, Slot>,
    /// touch stamp -> key, oldest first.
    recency: Mutex<BTreeMap<u64, Uuid>>,
    clock: AtomicU64,
    capacity: usize,
}

impl LogoutAffinityCache {
    pub fn new(storage: Arc<dyn ValueStorage>, capacity: usize) -> Self {
        Self {
            storage,
            entries: scc::HashMap::new(),
            recency: Mutex::new(BTreeMap::new()),
            clock: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    /// Name of the backing store.
    pub fn store_name(&self) -> &str {
        self.storage.name()
    }

    /// Server the player last logged out from, loading it from the store on
    /// a cache miss.
    pub async fn get(&self, player: Uuid) -> Result<Option<String>, StorageError> {
        let stamp = self.tick();
        match self.entries.entry_async(player).await {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                let previous = std::mem::replace(&mut slot.touched, stamp);
                let server = slot.server.clone();
                self.retouch(player, Some(previous), stamp);
                Ok(server)
            }
            Entry::Vacant(vacant) => {
                // the vacant entry keeps the bucket locked while loading
                let server = self.storage.get(player).await?;
                debug!(store = %self.storage.name(), %player, found = server.is_some(), "loaded logout server");
                vacant.insert_entry(Slot {
                    server: server.clone(),
                    touched: stamp,
                });
                self.retouch(player, None, stamp);
                self.evict_overflow().await;
                Ok(server)
            }
        }
    }

    /// Write through to the store and update the cached entry.
    ///
    /// The cached entry is updated even when the store write fails, so this
    /// proxy keeps routing the player correctly; the error is returned for
    /// the caller to log.
    pub async fn put(&self, player: Uuid, server: String) -> Result<(), StorageError> {
        let stamp = self.tick();
        let entry = self.entries.entry_async(player).await;
        let stored = self.storage.put(player, server.clone()).await;

        let grew = match entry {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                slot.server = Some(server);
                let previous = std::mem::replace(&mut slot.touched, stamp);
                self.retouch(player, Some(previous), stamp);
                false
            }
            Entry::Vacant(vacant) => {
                vacant.insert_entry(Slot {
                    server: Some(server),
                    touched: stamp,
                });
                self.retouch(player, None, stamp);
                true
            }
        };
        if grew {
            self.evict_overflow().await;
        }
        stored
    }

    /// Drop a cached entry without touching the store.
    pub async fn evict(&self, player: Uuid) -> bool {
        match self.entries.remove_async(&player).await {
            Some((_, slot)) => {
                self.recency_index().remove(&slot.touched);
                true
            }
            None => false,
        }
    }

    pub async fn contains_cached(&self, player: Uuid) -> bool {
        self.entries.read_async(&player, |_, _| ()).await.is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn close(&self) {
        self.storage.close().await;
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn recency_index(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, Uuid>> {
        self.recency.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn retouch(&self, player: Uuid, previous: Option<u64>, stamp: u64) {
        let mut recency = self.recency_index();
        if let Some(previous) = previous {
            recency.remove(&previous);
        }
        recency.insert(stamp, player);
    }

    fn pop_oldest(&self) -> Option<(u64, Uuid)> {
        self.recency_index().pop_first()
    }

    async fn evict_overflow(&self) {
        while self.entries.len() > self.capacity {
            let Some((stamp, player)) = self.pop_oldest() else {
                break;
            };
            // skip if the key was touched after its stamp was popped
            let evicted = self
                .entries
                .remove_if_async(&player, |slot| slot.touched == stamp)
                .await;
            if evicted.is_some() {
                debug!(store = %self.storage.name(), %player, "evicted logout server");
            }
        }
    }
}
